// Graphics context
//
// Owns every GPU object needed to put a frame on screen and exposes the
// begin / draw / end frame calls the application loop uses. The Vulkan
// side of the frame protocol lives in `Presenter`; the ordering rules live
// in `FrameSynchronizer`.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use super::command::{CommandRecorder, DrawTarget};
use super::pipeline::{create_render_pass, destroy_render_pass, GraphicsPipeline};
use super::shader::{CompiledShader, ShaderCompiler};
use super::swapchain::{query_surface_format, wait_for_usable_extent, AcquireOutcome, PresentOutcome};
use super::sync::{FrameDevice, FrameSlot, FrameStatus, FrameSynchronizer, MAX_FRAMES_IN_FLIGHT};
use super::{Swapchain, VulkanDevice};
use crate::config::{Config, ShaderConfig};
use crate::platform::SurfaceProvider;

/// Vertices generated by the triangle vertex shader
const TRIANGLE_VERTEX_COUNT: u32 = 3;

fn compile_shaders(compiler: &dyn ShaderCompiler, config: &ShaderConfig) -> Result<(CompiledShader, CompiledShader)> {
    let vertex = compiler
        .compile(&config.vertex_source())
        .context("Failed to compile vertex shader")?;
    let fragment = compiler
        .compile(&config.fragment_source())
        .context("Failed to compile fragment shader")?;
    Ok((vertex, fragment))
}

/// Vulkan implementation of the frame protocol
pub struct Presenter {
    // Option so Drop can release these before the render pass
    swapchain: Option<Swapchain>,
    pipeline: Option<GraphicsPipeline>,
    render_pass: vk::RenderPass,
    commands: CommandRecorder,
    slots: Vec<FrameSlot>,
    shaders: (CompiledShader, CompiledShader),
    clear_color: [f32; 4],
    device: Arc<VulkanDevice>,
}

impl Presenter {
    fn new(
        device: Arc<VulkanDevice>,
        shaders: (CompiledShader, CompiledShader),
        clear_color: [f32; 4],
        framebuffer_size: (u32, u32),
    ) -> Result<Self> {
        let surface_format = query_surface_format(&device)?;
        let render_pass = create_render_pass(&device, surface_format.format)?;
        let commands = match CommandRecorder::new(&device, MAX_FRAMES_IN_FLIGHT) {
            Ok(commands) => commands,
            Err(e) => {
                destroy_render_pass(&device, render_pass);
                return Err(e);
            }
        };

        // From here on Drop cleans up whatever got created
        let mut presenter = Self {
            swapchain: None,
            pipeline: None,
            render_pass,
            commands,
            slots: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            shaders,
            clear_color,
            device,
        };

        presenter.pipeline = Some(GraphicsPipeline::new(
            presenter.device.clone(),
            render_pass,
            &presenter.shaders.0,
            &presenter.shaders.1,
        )?);
        presenter.swapchain = Some(Swapchain::new(presenter.device.clone(), render_pass, framebuffer_size)?);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let slot = FrameSlot::new(&presenter.device)?;
            presenter.slots.push(slot);
        }

        Ok(presenter)
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }

    fn pipeline(&self) -> Result<&GraphicsPipeline> {
        self.pipeline.as_ref().context("Pipeline not initialized")
    }

    /// Replace the pipeline, e.g. after the render pass changed
    fn rebuild_pipeline(&mut self) -> Result<()> {
        self.pipeline = None;
        self.pipeline = Some(GraphicsPipeline::new(
            self.device.clone(),
            self.render_pass,
            &self.shaders.0,
            &self.shaders.1,
        )?);
        log::info!("Graphics pipeline rebuilt");
        Ok(())
    }
}

/// The render pass only depends on the pixel format; a colour-space change
/// alone keeps it and the pipeline built against it.
pub fn needs_render_pass_rebuild(old: vk::SurfaceFormatKHR, new: vk::SurfaceFormatKHR) -> bool {
    old.format != new.format
}

impl FrameDevice for Presenter {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.slots[slot].in_flight_fence;
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed to wait for in-flight fence")
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.slots[slot].image_available;
        self.swapchain()?.acquire_next_image(semaphore)
    }

    fn reset_slot_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.slots[slot].in_flight_fence;
        unsafe { self.device.device.reset_fences(&[fence]) }.context("Failed to reset in-flight fence")
    }

    fn record_commands(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let swapchain = self.swapchain()?;
        let framebuffer = *swapchain
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for image {}", image_index))?;

        let target = DrawTarget {
            render_pass: self.render_pass,
            framebuffer,
            extent: swapchain.extent,
            pipeline: self.pipeline()?.pipeline,
            clear_color: self.clear_color,
            vertex_count: TRIANGLE_VERTEX_COUNT,
        };
        self.commands.record_draw(&self.device, slot, &target)
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = &self.slots[slot];
        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.commands.buffer(slot)];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], frame.in_flight_fence)
        }
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let render_finished = self.slots[slot].render_finished;
        self.swapchain()?
            .present(self.device.present_queue, image_index, &[render_finished])
    }

    fn regenerate_swapchain(&mut self, surface: &mut dyn SurfaceProvider) -> Result<bool> {
        self.device.wait_idle()?;

        let Some(framebuffer_size) = wait_for_usable_extent(surface) else {
            log::info!("Window closed while minimized, keeping the old swapchain");
            return Ok(false);
        };

        let old_format = self.swapchain()?.format;
        self.swapchain = None;

        let new_format = query_surface_format(&self.device)?;
        if needs_render_pass_rebuild(old_format, new_format) {
            log::info!("Surface format changed {:?} -> {:?}", old_format.format, new_format.format);
            let render_pass = create_render_pass(&self.device, new_format.format)?;
            self.pipeline = None;
            destroy_render_pass(&self.device, self.render_pass);
            self.render_pass = render_pass;
            self.rebuild_pipeline()?;
        }

        self.swapchain = Some(Swapchain::new(self.device.clone(), self.render_pass, framebuffer_size)?);
        log::info!("Swapchain recreated");
        Ok(true)
    }

    fn replace_shaders(&mut self, vertex: CompiledShader, fragment: CompiledShader) -> Result<()> {
        self.device.wait_idle()?;
        let pipeline = GraphicsPipeline::new(self.device.clone(), self.render_pass, &vertex, &fragment)?;
        self.pipeline = Some(pipeline);
        self.shaders = (vertex, fragment);
        log::info!("Shaders reloaded");
        Ok(())
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        log::info!("Cleaning up frame resources...");

        // Wait for GPU to finish before destroying anything
        let _ = self.device.wait_idle();

        for slot in &self.slots {
            slot.destroy(&self.device);
        }
        self.commands.destroy(&self.device);

        // Framebuffers and the pipeline reference the render pass
        self.swapchain = None;
        self.pipeline = None;
        destroy_render_pass(&self.device, self.render_pass);
    }
}

/// Everything needed to draw into one window.
///
/// `D` is the GPU side of the frame protocol; [`Presenter`] unless a test
/// swaps in a simulated one.
pub struct GraphicsContext<D = Presenter> {
    sync: FrameSynchronizer,
    frames: D,
    resized: bool,
}

impl GraphicsContext {
    /// Create the device, compile shaders and build the first swapchain.
    ///
    /// Shader compilation errors here are fatal.
    pub fn new<W>(window: &mut W, config: &Config, compiler: &dyn ShaderCompiler) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle + SurfaceProvider,
    {
        let device = VulkanDevice::new(&config.window.title, config.validation_enabled(), &*window)?;
        let shaders = compile_shaders(compiler, &config.shaders)?;

        let framebuffer_size =
            wait_for_usable_extent(window).context("Window closed before it could be drawn to")?;
        let presenter = Presenter::new(device, shaders, config.graphics.clear_color, framebuffer_size)?;

        Ok(Self::with_frame_device(presenter))
    }
}

impl<D: FrameDevice> GraphicsContext<D> {
    pub fn with_frame_device(frames: D) -> Self {
        Self {
            sync: FrameSynchronizer::new(),
            frames,
            resized: false,
        }
    }

    /// Returns the acquired image, or `None` if this frame was skipped
    pub fn begin_frame(&mut self, surface: &mut dyn SurfaceProvider) -> Result<Option<u32>> {
        let image = self.sync.begin_frame(&mut self.frames, surface)?;
        if image.is_none() {
            // The swapchain was just rebuilt
            self.resized = false;
        }
        Ok(image)
    }

    pub fn draw(&mut self) -> Result<()> {
        self.sync.draw(&mut self.frames)
    }

    pub fn end_frame(&mut self, surface: &mut dyn SurfaceProvider) -> Result<FrameStatus> {
        let resized = std::mem::take(&mut self.resized);
        self.sync.end_frame(&mut self.frames, surface, resized)
    }

    /// `begin_frame`, `draw` and `end_frame` in one go
    pub fn draw_frame(&mut self, surface: &mut dyn SurfaceProvider) -> Result<FrameStatus> {
        if self.begin_frame(surface)?.is_none() {
            return Ok(FrameStatus::Skipped);
        }
        self.draw()?;
        self.end_frame(surface)
    }

    /// Force a swapchain rebuild after the next present
    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    /// Recompile both shaders and swap in a new pipeline.
    ///
    /// On error the current pipeline stays in place.
    pub fn reload_shaders(&mut self, compiler: &dyn ShaderCompiler, config: &ShaderConfig) -> Result<()> {
        let (vertex, fragment) = compile_shaders(compiler, config)?;
        self.frames.replace_shaders(vertex, fragment)
    }

    pub fn frame_device(&self) -> &D {
        &self.frames
    }

    pub fn frame_index(&self) -> usize {
        self.sync.frame_index()
    }

    pub fn frames_presented(&self) -> u64 {
        self.sync.frames_presented()
    }

    pub fn frames_skipped(&self) -> u64 {
        self.sync.frames_skipped()
    }

    pub fn recreations(&self) -> u64 {
        self.sync.recreations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn pixel_format_change_rebuilds_render_pass() {
        let old = surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let new = surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert!(needs_render_pass_rebuild(old, new));
    }

    #[test]
    fn same_format_keeps_render_pass() {
        let format = surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert!(!needs_render_pass_rebuild(format, format));

        let other_space = surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT);
        assert!(!needs_render_pass_rebuild(format, other_space));
    }
}

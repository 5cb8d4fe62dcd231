// Command recording
//
// One primary command buffer per frame slot, all from a single pool that
// allows individual resets. A buffer is reset and fully re-recorded every
// time its slot is reused, after the slot's fence has been waited on.

use anyhow::{Context, Result};
use ash::vk;

use super::tracker::ResourceKind;
use super::VulkanDevice;

/// Everything a draw needs to know about the current frame
#[derive(Debug, Clone, Copy)]
pub struct DrawTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub clear_color: [f32; 4],
    pub vertex_count: u32,
}

/// Full-surface viewport with the standard depth range
pub fn viewport_for(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn scissor_for(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

pub struct CommandRecorder {
    pub pool: vk::CommandPool,
    pub buffers: Vec<vk::CommandBuffer>,
}

impl CommandRecorder {
    /// Create the pool on the graphics family and allocate `count` buffers
    pub fn new(device: &VulkanDevice, count: usize) -> Result<Self> {
        let graphics_family = device
            .queue_families
            .graphics
            .context("Device has no graphics queue family")?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_family);

        let pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?
        };
        device.tracker.created(ResourceKind::CommandPool);

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let buffers = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                device.tracker.destroyed(ResourceKind::CommandPool);
                return Err(e).context("Failed to allocate command buffers");
            }
        };

        Ok(Self { pool, buffers })
    }

    pub fn buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.buffers[slot]
    }

    /// Re-record the slot's buffer: clear, bind, set dynamic state, draw.
    ///
    /// The caller must have waited on the slot's fence.
    pub fn record_draw(&self, device: &VulkanDevice, slot: usize, target: &DrawTarget) -> Result<()> {
        let cmd = self.buffer(slot);
        let device = &device.device;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: target.clear_color,
            },
        }];

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(target.render_pass)
                .framebuffer(target.framebuffer)
                .render_area(scissor_for(target.extent))
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport_for(target.extent)]);
            device.cmd_set_scissor(cmd, 0, &[scissor_for(target.extent)]);
            device.cmd_draw(cmd, target.vertex_count, 1, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }

        Ok(())
    }

    /// Destroys the pool, which frees its buffers too
    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe { device.device.destroy_command_pool(self.pool, None) };
        device.tracker.destroyed(ResourceKind::CommandPool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_covers_whole_extent() {
        let viewport = viewport_for(vk::Extent2D {
            width: 1920,
            height: 1080,
        });
        assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
        assert_eq!((viewport.width, viewport.height), (1920.0, 1080.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
    }

    #[test]
    fn scissor_matches_extent() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let scissor = scissor_for(extent);
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
        assert_eq!(scissor.extent, extent);
    }
}

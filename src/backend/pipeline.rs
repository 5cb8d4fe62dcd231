// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// Everything except viewport and scissor is baked in at creation time, so
// a change means destroying the pipeline and building a new one.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::shader::{create_shader_module, destroy_shader_module, CompiledShader};
use super::tracker::ResourceKind;
use super::VulkanDevice;

/// Create the single render pass: one colour attachment, cleared, presented
pub fn create_render_pass(device: &VulkanDevice, format: vk::Format) -> Result<vk::RenderPass> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    // Don't write the image before the acquire semaphore has released it
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let attachments = &[color_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    let render_pass = unsafe {
        device
            .device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")?
    };
    device.tracker.created(ResourceKind::RenderPass);
    Ok(render_pass)
}

pub fn destroy_render_pass(device: &VulkanDevice, render_pass: vk::RenderPass) {
    unsafe { device.device.destroy_render_pass(render_pass, None) };
    device.tracker.destroyed(ResourceKind::RenderPass);
}

/// Create framebuffers for each swapchain image view
pub fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());

    for &image_view in image_views {
        let attachments = &[image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let created = unsafe { device.device.create_framebuffer(&framebuffer_info, None) };
        match created {
            Ok(framebuffer) => {
                device.tracker.created(ResourceKind::Framebuffer);
                framebuffers.push(framebuffer);
            }
            Err(e) => {
                for framebuffer in framebuffers {
                    unsafe { device.device.destroy_framebuffer(framebuffer, None) };
                    device.tracker.destroyed(ResourceKind::Framebuffer);
                }
                return Err(e).context("Failed to create framebuffer");
            }
        }
    }

    Ok(framebuffers)
}

/// Fill mode, back-face culling, clockwise front faces
pub fn rasterization_state() -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false)
        .build()
}

/// Standard alpha blending: `src.a * src + (1 - src.a) * dst`
pub fn color_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .build()
}

pub const DYNAMIC_STATES: [vk::DynamicState; 2] = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

/// Immutable pipeline plus its layout
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl GraphicsPipeline {
    /// Build the pipeline from a vertex + fragment pair.
    ///
    /// Shader modules only live for the duration of this call.
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        vertex: &CompiledShader,
        fragment: &CompiledShader,
    ) -> Result<Self> {
        let vert_module = create_shader_module(&device, &vertex.code)
            .context("Failed to create vertex shader module")?;
        let frag_module = match create_shader_module(&device, &fragment.code) {
            Ok(module) => module,
            Err(e) => {
                destroy_shader_module(&device, vert_module);
                return Err(e.context("Failed to create fragment shader module"));
            }
        };

        let result = Self::build(&device, render_pass, vertex, fragment, vert_module, frag_module);

        destroy_shader_module(&device, vert_module);
        destroy_shader_module(&device, frag_module);

        let (pipeline, layout) = result?;
        Ok(Self {
            pipeline,
            layout,
            device,
        })
    }

    fn build(
        device: &VulkanDevice,
        render_pass: vk::RenderPass,
        vertex: &CompiledShader,
        fragment: &CompiledShader,
        vert_module: vk::ShaderModule,
        frag_module: vk::ShaderModule,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vertex.stage.vk_stage())
                .module(vert_module)
                .name(&vertex.entry_point)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(fragment.stage.vk_stage())
                .module(frag_module)
                .name(&fragment.entry_point)
                .build(),
        ];

        // Vertices come from the shader itself
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only: the actual rectangles are set while recording
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = rasterization_state();

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [color_blend_attachment()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&color_blend_attachments)
            .blend_constants([0.0; 4]);

        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&DYNAMIC_STATES);

        let layout_info = vk::PipelineLayoutCreateInfo::builder();
        let pipeline_layout = unsafe {
            device
                .device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };
        device.tracker.created(ResourceKind::PipelineLayout);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match pipelines {
            Ok(pipelines) => {
                device.tracker.created(ResourceKind::Pipeline);
                Ok((pipelines[0], pipeline_layout))
            }
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(pipeline_layout, None) };
                device.tracker.destroyed(ResourceKind::PipelineLayout);
                Err(e).context("Failed to create graphics pipeline")
            }
        }
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
        self.device.tracker.destroyed(ResourceKind::Pipeline);
        self.device.tracker.destroyed(ResourceKind::PipelineLayout);
    }
}

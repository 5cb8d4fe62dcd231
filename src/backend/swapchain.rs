// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// plus the image view and framebuffer that go with each image. The whole
// set is rebuilt together whenever the surface changes.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::device::QueueFamilyIndices;
use super::pipeline::create_framebuffers;
use super::tracker::ResourceKind;
use super::VulkanDevice;
use crate::platform::SurfaceProvider;

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface changed underneath us; nothing was signaled
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn needs_recreate(self) -> bool {
        self != PresentOutcome::Presented
    }
}

/// Prefer 8-bit BGRA sRGB, otherwise whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX replaces queued images instead of blocking: low latency, no
/// tearing. FIFO is the fallback every implementation must support.
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// `u32::MAX` in `current_extent` means the window decides the size
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer_size: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    let (width, height) = framebuffer_size;
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum so we never wait on the driver; 0 max = no limit
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        preferred.min(caps.max_image_count)
    } else {
        preferred
    }
}

/// Images are shared between families only when graphics and present differ
pub fn choose_sharing(queue_families: &QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if queue_families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, queue_families.unique())
    }
}

/// Block on window events until the framebuffer has a non-zero area.
///
/// Returns the usable size, or `None` if the window went away first.
pub fn wait_for_usable_extent(surface: &mut dyn SurfaceProvider) -> Option<(u32, u32)> {
    while surface.is_minimized() {
        log::debug!("Surface minimized, waiting for events");
        if !surface.wait_events() {
            return None;
        }
    }
    Some(surface.framebuffer_size())
}

/// Swapchain, its images, one view per image and one framebuffer per view
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

/// Surface format the next swapchain would get, without creating it
pub fn query_surface_format(device: &VulkanDevice) -> Result<vk::SurfaceFormatKHR> {
    let formats = device.surface.formats(device.physical_device)?;
    choose_surface_format(&formats).context("Surface reports no formats")
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        framebuffer_size: (u32, u32),
    ) -> Result<Self> {
        let physical_device = device.physical_device;
        let surface_caps = device.surface.capabilities(physical_device)?;
        let formats = device.surface.formats(physical_device)?;
        let present_modes = device.surface.present_modes(physical_device)?;

        let surface_format = choose_surface_format(&formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&surface_caps, framebuffer_size);
        let image_count = choose_image_count(&surface_caps);
        let (sharing_mode, family_indices) = choose_sharing(&device.queue_families);

        log::info!(
            "Creating swapchain: {}x{}, {:?}/{:?}, {:?}, {} images requested",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            image_count
        );

        let swapchain_loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;
        device.tracker.created(ResourceKind::Swapchain);

        // From here on Drop cleans up whatever got created
        let mut chain = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            format: surface_format,
            present_mode,
            extent,
            device,
        };

        chain.images = unsafe { chain.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &chain.images {
            let view = create_image_view(&chain.device, image, surface_format.format)?;
            chain.image_views.push(view);
        }

        chain.framebuffers = create_framebuffers(&chain.device, &chain.image_views, render_pass, extent)?;

        debug_assert_eq!(chain.images.len(), chain.image_views.len());
        debug_assert_eq!(chain.image_views.len(), chain.framebuffers.len());
        log::info!("Created swapchain with {} images", chain.image_count());

        Ok(chain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

fn create_image_view(device: &VulkanDevice, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = unsafe { device.device.create_image_view(&create_info, None) }
        .context("Failed to create image view")?;
    device.tracker.created(ResourceKind::ImageView);
    Ok(view)
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let tracker = &self.device.tracker;
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            tracker.destroyed_n(ResourceKind::Framebuffer, self.framebuffers.len());

            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            tracker.destroyed_n(ResourceKind::ImageView, self.image_views.len());

            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            tracker.destroyed(ResourceKind::Swapchain);
        }
    }
}

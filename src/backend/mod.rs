// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Each wrapper owns its handles and records them
// in the device's resource tracker.

pub mod command;
pub mod context;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod tracker;

pub use context::GraphicsContext;
pub use device::VulkanDevice;
pub use swapchain::Swapchain;

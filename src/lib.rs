// Rocket renderer - Vulkan frame presentation core
//
// Window -> surface -> device -> swapchain -> per-frame sync, driven by a
// small application loop. See `engine::Engine` for the entry point.

pub mod backend;
pub mod config;
pub mod engine;
pub mod hot_reload;
pub mod platform;

pub use config::Config;
pub use engine::{Application, Engine};

// Platform module - windowing seen from the renderer
//
// The renderer only needs a handful of things from a window: native handles
// to build a surface, the framebuffer size, whether it's minimized, and a
// way to block until something happens. Those live in `SurfaceProvider`.

pub mod window;

pub use window::WinitWindow;

/// What the graphics context needs from the window it presents to
pub trait SurfaceProvider {
    /// Current framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);

    /// A zero-area framebuffer can't back a swapchain
    fn is_minimized(&self) -> bool {
        let (width, height) = self.framebuffer_size();
        width == 0 || height == 0
    }

    /// Block until at least one window event has been processed.
    ///
    /// Returns `false` once the window is closing; callers waiting for the
    /// surface to become usable must give up at that point.
    fn wait_events(&mut self) -> bool;

    /// Returns and clears the "framebuffer was resized" notification
    fn take_resized(&mut self) -> bool {
        false
    }
}

/// A platform window driven by the application loop
pub trait Window: SurfaceProvider {
    /// Process pending events without blocking
    fn poll(&mut self);

    /// End-of-tick hook. Presentation itself goes through the swapchain.
    fn swap(&mut self);

    fn should_close(&self) -> bool;

    fn set_title(&mut self, title: &str);
}

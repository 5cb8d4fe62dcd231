// winit-backed window
//
// winit 0.30 wants to own the loop through `run_app`. The engine drives its
// own loop instead (poll once per tick, block while minimized), so events
// are pumped on demand with `pump_app_events`.

use anyhow::{Context, Result};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Fullscreen, WindowAttributes, WindowId},
};

use super::{SurfaceProvider, Window};
use crate::config::WindowConfig;

/// Event-handler half of the window: receives winit callbacks
struct WindowState {
    attributes: WindowAttributes,
    window: Option<winit::window::Window>,
    size: PhysicalSize<u32>,
    resized: bool,
    close_requested: bool,
    is_fullscreen: bool,
    creation_error: Option<String>,
}

impl WindowState {
    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            self.resized = true;
        }
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                self.size = window.inner_size();
                log::info!("Window created: {}x{}", self.size.width, self.size.height);
                self.window = Some(window);
            }
            Err(e) => {
                self.creation_error = Some(e.to_string());
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.size = size;
                self.resized = true;
            }
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if !event.state.is_pressed() {
                    return;
                }
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::Escape) => {
                        log::info!("ESC pressed, exiting...");
                        self.close_requested = true;
                        event_loop.exit();
                    }
                    PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// A native window plus the event loop that feeds it
pub struct WinitWindow {
    state: WindowState,
    event_loop: EventLoop<()>,
}

impl WinitWindow {
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new().context("Failed to create event loop")?;

        let mut attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(config.resizable);
        if config.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let mut window = Self {
            state: WindowState {
                attributes,
                window: None,
                size: PhysicalSize::new(0, 0),
                resized: false,
                close_requested: false,
                is_fullscreen: config.fullscreen,
                creation_error: None,
            },
            event_loop,
        };

        // The native window only exists once the loop has delivered `resumed`
        while window.state.window.is_none() {
            if let PumpStatus::Exit(code) = window.pump(Some(Duration::ZERO)) {
                let reason = window
                    .state
                    .creation_error
                    .take()
                    .unwrap_or_else(|| format!("event loop exited with code {code}"));
                anyhow::bail!("Failed to create window: {}", reason);
            }
        }

        // Creation is not a resize
        window.state.resized = false;
        Ok(window)
    }

    fn pump(&mut self, timeout: Option<Duration>) -> PumpStatus {
        let status = self.event_loop.pump_app_events(timeout, &mut self.state);
        if let PumpStatus::Exit(_) = status {
            self.state.close_requested = true;
        }
        status
    }
}

impl SurfaceProvider for WinitWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        let minimized = self
            .state
            .window
            .as_ref()
            .and_then(|w| w.is_minimized())
            .unwrap_or(false);
        if minimized {
            (0, 0)
        } else {
            (self.state.size.width, self.state.size.height)
        }
    }

    fn wait_events(&mut self) -> bool {
        if self.state.close_requested {
            return false;
        }
        self.pump(None);
        !self.state.close_requested
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }
}

impl Window for WinitWindow {
    fn poll(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn swap(&mut self) {
        if let Some(ref window) = self.state.window {
            window.request_redraw();
        }
    }

    fn should_close(&self) -> bool {
        self.state.close_requested
    }

    fn set_title(&mut self, title: &str) {
        if let Some(ref window) = self.state.window {
            window.set_title(title);
        }
    }
}

impl HasWindowHandle for WinitWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.state
            .window
            .as_ref()
            .ok_or(HandleError::Unavailable)?
            .window_handle()
    }
}

impl HasDisplayHandle for WinitWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.state
            .window
            .as_ref()
            .ok_or(HandleError::Unavailable)?
            .display_handle()
    }
}

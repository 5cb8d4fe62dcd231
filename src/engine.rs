// Engine - the application loop
//
// Owns the window and the graphics context and runs one tick per loop:
// poll events, update the application, draw, present, bookkeeping.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::backend::context::Presenter;
use crate::backend::shader::ExternalCompiler;
use crate::backend::sync::{FrameDevice, FrameStatus};
use crate::backend::GraphicsContext;
use crate::config::Config;
use crate::hot_reload::ShaderWatcher;
use crate::platform::{Window, WinitWindow};

/// Hooks the engine calls around its loop
pub trait Application {
    fn on_start(&mut self) {}

    /// `delta_time` is the length of the previous tick in seconds
    fn on_update(&mut self, _delta_time: f32) {}

    fn on_stop(&mut self) {}
}

/// Wall-clock bookkeeping for the loop
#[derive(Debug, Clone, Copy)]
pub struct Timespan {
    start: Instant,
    current: Instant,
    delta: Duration,
}

impl Default for Timespan {
    fn default() -> Self {
        Self::new()
    }
}

impl Timespan {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            current: now,
            delta: Duration::ZERO,
        }
    }

    /// Start a new tick
    pub fn validate(&mut self) {
        self.validate_at(Instant::now());
    }

    fn validate_at(&mut self, now: Instant) {
        self.delta = now.saturating_duration_since(self.current);
        self.current = now;
    }

    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// Seconds from construction to the latest tick
    pub fn elapsed_seconds(&self) -> f32 {
        self.current.duration_since(self.start).as_secs_f32()
    }
}

/// Per-run counters. `draw_calls` covers the current tick only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetrics {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub draw_calls: u32,
    pub swapchain_recreations: u64,
}

impl FrameMetrics {
    pub fn reset_frame(&mut self) {
        self.draw_calls = 0;
    }

    pub fn record(&mut self, status: FrameStatus) {
        match status {
            FrameStatus::Presented { .. } => self.frames_presented += 1,
            FrameStatus::Skipped => self.frames_skipped += 1,
        }
    }
}

/// Logs how long its scope took when dropped
pub struct ScopedTimer {
    name: &'static str,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        log::debug!("({}) Elapsed time: {:?}", self.name, self.start.elapsed());
    }
}

/// Averages frames over one-second windows
#[derive(Debug)]
pub struct FpsCounter {
    frame_count: u32,
    last_update: Instant,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            last_update: now,
        }
    }

    /// Count a frame; returns the average FPS once a second has passed
    pub fn frame(&mut self, now: Instant) -> Option<f32> {
        self.frame_count += 1;
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let fps = self.frame_count as f32 / elapsed;
        self.frame_count = 0;
        self.last_update = now;
        Some(fps)
    }
}

/// Runs an [`Application`] against a window and the graphics context
/// drawing into it
pub struct Engine<W = WinitWindow, D = Presenter> {
    // Torn down before the window it draws into
    context: GraphicsContext<D>,
    window: W,
    compiler: ExternalCompiler,
    watcher: Option<ShaderWatcher>,
    time: Timespan,
    metrics: FrameMetrics,
    fps: FpsCounter,
    config: Config,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let _timer = ScopedTimer::new("Engine startup");

        log::info!(
            "Window: {}x{} ({})",
            config.window.width,
            config.window.height,
            if config.window.fullscreen { "fullscreen" } else { "windowed" }
        );

        let mut window = WinitWindow::new(&config.window)?;
        let compiler = ExternalCompiler::new(config.shaders.compiler);
        let context = GraphicsContext::new(&mut window, &config, &compiler)?;

        Ok(Self::from_parts(window, context, compiler, config))
    }
}

impl<W: Window, D: FrameDevice> Engine<W, D> {
    pub fn from_parts(window: W, context: GraphicsContext<D>, compiler: ExternalCompiler, config: Config) -> Self {
        let watcher = if config.debug.hot_reload_shaders {
            let files = [config.shaders.vertex.as_path(), config.shaders.fragment.as_path()];
            match ShaderWatcher::new(&files) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot-reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            context,
            window,
            compiler,
            watcher,
            time: Timespan::new(),
            metrics: FrameMetrics::default(),
            fps: FpsCounter::new(Instant::now()),
            config,
        }
    }

    pub fn metrics(&self) -> &FrameMetrics {
        &self.metrics
    }

    pub fn context(&self) -> &GraphicsContext<D> {
        &self.context
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    /// Run until the window closes. `on_stop` is called even on error.
    pub fn run(&mut self, app: &mut dyn Application) -> Result<()> {
        app.on_start();
        let result = self.run_loop(app);
        app.on_stop();

        log::info!(
            "Stopped after {:.1}s: {} frames presented, {} skipped, {} swapchain recreations",
            self.time.elapsed_seconds(),
            self.metrics.frames_presented,
            self.metrics.frames_skipped,
            self.metrics.swapchain_recreations
        );
        result
    }

    fn run_loop(&mut self, app: &mut dyn Application) -> Result<()> {
        while !self.window.should_close() {
            self.metrics.reset_frame();
            self.time.validate();

            self.window.poll();
            if self.window.should_close() {
                break;
            }
            if self.window.take_resized() {
                self.context.notify_resized();
            }

            // Nothing to draw into; block instead of spinning
            if self.window.is_minimized() {
                self.window.wait_events();
                continue;
            }

            app.on_update(self.time.delta_seconds());

            let status = match self.context.begin_frame(&mut self.window)? {
                Some(_) => {
                    self.context.draw()?;
                    self.metrics.draw_calls += 1;
                    self.context.end_frame(&mut self.window)?
                }
                None => FrameStatus::Skipped,
            };
            self.metrics.record(status);
            self.metrics.swapchain_recreations = self.context.recreations();
            log::trace!("Frame {:?}", status);

            self.window.swap();

            if matches!(status, FrameStatus::Presented { .. }) {
                self.update_fps();
            }
            self.check_shader_changes();
        }
        Ok(())
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        if let Some(fps) = self.fps.frame(Instant::now()) {
            let title = format!(
                "{} - {:.0} FPS ({:.2}ms)",
                self.config.window.title,
                fps,
                self.time.delta_seconds() * 1000.0
            );
            self.window.set_title(&title);
        }
    }

    fn check_shader_changes(&mut self) {
        let Some(ref watcher) = self.watcher else {
            return;
        };
        if !watcher.poll_changed() {
            return;
        }

        let _timer = ScopedTimer::new("Shader reload");
        if let Err(e) = self.context.reload_shaders(&self.compiler, &self.config.shaders) {
            log::error!("Shader reload failed, keeping current pipeline: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan_tracks_delta_and_elapsed() {
        let mut time = Timespan::new();
        let start = time.start;

        time.validate_at(start + Duration::from_millis(16));
        assert!((time.delta_seconds() - 0.016).abs() < 1e-6);

        time.validate_at(start + Duration::from_millis(50));
        assert!((time.delta_seconds() - 0.034).abs() < 1e-6);
        assert!((time.elapsed_seconds() - 0.05).abs() < 1e-6);
    }

    #[test]
    fn fresh_timespan_has_zero_delta() {
        let time = Timespan::new();
        assert_eq!(time.delta_seconds(), 0.0);
        assert_eq!(time.elapsed_seconds(), 0.0);
    }

    #[test]
    fn fps_reported_once_per_second() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(start);

        for i in 1..60 {
            assert_eq!(fps.frame(start + Duration::from_millis(i * 16)), None);
        }
        let reported = fps.frame(start + Duration::from_secs(1)).unwrap();
        assert!((reported - 60.0).abs() < 1e-3);

        // Counter restarts after reporting
        assert_eq!(fps.frame(start + Duration::from_millis(1100)), None);
    }

    #[test]
    fn metrics_count_presents_and_skips() {
        let mut metrics = FrameMetrics::default();
        metrics.draw_calls = 4;

        metrics.record(FrameStatus::Presented {
            image_index: 0,
            recreated: false,
        });
        metrics.record(FrameStatus::Presented {
            image_index: 1,
            recreated: true,
        });
        metrics.record(FrameStatus::Skipped);
        metrics.reset_frame();

        assert_eq!(
            metrics,
            FrameMetrics {
                frames_presented: 2,
                frames_skipped: 1,
                draw_calls: 0,
                swapchain_recreations: 0,
            }
        );
    }

    struct Counting {
        started: bool,
        updates: u32,
    }

    impl Application for Counting {
        fn on_start(&mut self) {
            self.started = true;
        }

        fn on_update(&mut self, _delta_time: f32) {
            self.updates += 1;
        }
    }

    #[test]
    fn application_hooks_have_defaults() {
        let mut app = Counting {
            started: false,
            updates: 0,
        };
        app.on_start();
        app.on_update(0.016);
        app.on_stop();
        assert!(app.started);
        assert_eq!(app.updates, 1);
    }
}

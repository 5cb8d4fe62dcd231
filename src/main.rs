// =============================================================================
// ROCKET RENDERER - clears the window and draws one triangle per frame
// =============================================================================
//
// FRAME FLOW:
// 1. Poll window events, forward resizes
// 2. Application update
// 3. Wait for the frame slot, acquire a swapchain image
// 4. Record and submit the draw
// 5. Present, recreate the swapchain if the surface changed
//
// =============================================================================

use anyhow::Result;
use rocket_renderer::{Application, Config, Engine};
use std::fs::OpenOptions;
use std::io::Write;

/// Demo application: the engine does all the drawing
struct Sandbox {
    updates: u64,
}

impl Application for Sandbox {
    fn on_start(&mut self) {
        log::info!("Sandbox started");
    }

    fn on_update(&mut self, _delta_time: f32) {
        self.updates += 1;
    }

    fn on_stop(&mut self) {
        log::info!("Sandbox stopped after {} updates", self.updates);
    }
}

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, config_error) = Config::load();

    init_logging(&config);
    if let Some(e) = config_error {
        log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
    }
    log::info!("Starting Rocket renderer");

    let mut engine = Engine::new(config)?;
    engine.run(&mut Sandbox { updates: 0 })
}

/// Initialize logging, optionally piping everything into the log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    // RUST_LOG still wins over the default level
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Rocket Renderer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {:?}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

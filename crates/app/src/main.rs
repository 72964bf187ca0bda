use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use ledcontrol_core::{
    AnimationEngine, EngineConfig, LocalFrameBuffer, Mapping, RoutedSink, SaveFile,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> ledcontrol_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            engine,
            config_file,
            save_interval,
            udp_target,
            duration,
        } => run(
            &engine,
            &config_file,
            save_interval,
            udp_target.as_deref(),
            duration,
        ),
        Commands::Preview { engine } => preview(&engine),
    }
}

fn run(
    options: &EngineOptions,
    config_file: &Path,
    save_interval: f64,
    udp_target: Option<&str>,
    duration: Option<f64>,
) -> ledcontrol_core::Result<()> {
    let engine = AnimationEngine::new(options.config()?)?;
    let save_file = SaveFile::new(config_file);
    let reports = engine.restore_state(save_file.load()?)?;
    for (id, report) in reports.iter().filter(|(_, r)| !r.errors.is_empty()) {
        tracing::warn!(id, errors = ?report.errors, "saved pattern does not compile");
    }
    if let Some(target) = udp_target {
        engine.update_settings(&json!({
            "groups": { "main": { "render_mode": "udp", "render_target": target } }
        }))?;
    }

    let mut sink = RoutedSink::new(engine.led_count());
    engine.clear_leds(&mut sink)?;
    engine.start(Box::new(sink))?;
    tracing::info!(path = %config_file.display(), "running");

    let started = Instant::now();
    let interval = Duration::from_secs_f64(save_interval.max(0.1));
    loop {
        let remaining = duration.map(|d| Duration::from_secs_f64(d.max(0.0)).saturating_sub(started.elapsed()));
        if remaining.is_some_and(|r| r.is_zero()) {
            break;
        }
        thread::sleep(remaining.map_or(interval, |r| r.min(interval)));
        save_file.save(&engine.snapshot_state()?)?;
        tracing::info!(
            fps = engine.get_frame_rate()?,
            cost_ms = engine.get_average_cost()?.as_secs_f64() * 1000.0,
            "render stats"
        );
    }

    engine.stop()?;
    save_file.save(&engine.snapshot_state()?)?;
    Ok(())
}

/// Compiles every built-in pattern and prints its first frame on a small
/// strip as JSON.
fn preview(options: &EngineOptions) -> ledcontrol_core::Result<()> {
    let engine = AnimationEngine::new(options.config()?)?;
    engine.update_settings(&json!({ "global_brightness": 1.0 }))?;
    let started = Instant::now();

    let mut previews = Vec::new();
    for (id, definition) in engine.get_functions()? {
        let report = engine.compile_function(id)?;
        engine.update_settings(&json!({
            "groups": { "main": { "function": id, "speed": definition.default_speed, "scale": definition.default_scale } }
        }))?;
        let mut sink = LocalFrameBuffer::new(engine.led_count());
        engine.render_frame_at(started + Duration::from_secs(1), &mut sink)?;
        previews.push(json!({
            "id": id,
            "name": definition.name,
            "errors": report.errors,
            "warnings": report.warnings,
            "colors": sink.output(),
        }));
    }

    let text = serde_json::to_string_pretty(&previews)?;
    println!("{text}");
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Animation engine for addressable LED strips", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct EngineOptions {
    /// Number of LEDs; ignored when a pixel mapping is given.
    #[arg(long, default_value_t = 100)]
    led_count: usize,
    /// Target frame rate.
    #[arg(long, default_value_t = 60.0)]
    fps: f64,
    /// Ceiling for every brightness setting.
    #[arg(long, default_value_t = 1.0)]
    brightness_limit: f64,
    /// Keep the animation clock running when patterns change.
    #[arg(long)]
    no_timer_reset: bool,
    /// JSON array of [x, y] or [x, y, z] LED coordinates.
    #[arg(long)]
    pixel_mapping_json: Option<PathBuf>,
}

impl EngineOptions {
    fn config(&self) -> ledcontrol_core::Result<EngineConfig> {
        let mut config = EngineConfig {
            led_count: self.led_count,
            refresh_rate: self.fps,
            brightness_limit: self.brightness_limit,
            no_timer_reset: self.no_timer_reset,
            ..EngineConfig::default()
        };
        if let Some(path) = &self.pixel_mapping_json {
            let mapping = Mapping::from_json_points(&std::fs::read_to_string(path)?)?;
            if let Mapping::Points(points) = &mapping {
                config.led_count = points.len();
                tracing::info!(led_count = points.len(), "using pixel mapping from file");
            }
            config.mapping = mapping;
        } else {
            tracing::info!(led_count = config.led_count, "using linear pixel mapping");
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the configured outputs until stopped.
    Run {
        #[command(flatten)]
        engine: EngineOptions,
        /// Save file holding settings, presets, patterns and palettes.
        #[arg(long, default_value = "ledcontrol.json")]
        config_file: PathBuf,
        /// Seconds between automatic saves.
        #[arg(long, default_value_t = 60.0)]
        save_interval: f64,
        /// Send the main group to a UDP controller (`host` or `host:port`).
        #[arg(long)]
        udp_target: Option<String>,
        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<f64>,
    },
    /// Print the first frame of every built-in pattern as JSON.
    Preview {
        #[command(flatten)]
        engine: EngineOptions,
    },
}

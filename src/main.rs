//! `licht` command line entry: load (or synthesize) a scene, run the build
//! against an in-process farm agent, and report what was exported.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use licht_build::run_build;
use licht_export::CollectingExporter;
use licht_farm::FarmAgent;
use licht_scene::{BuildSettings, Scene};

#[derive(Parser, Debug)]
#[command(name = "licht")]
#[command(about = "Static lighting build scheduler")]
struct Args {
    /// Scene description TOML. Omitted: builds a synthetic scene instead.
    #[arg(short, long)]
    scene: Option<PathBuf>,

    /// Build settings TOML overriding the defaults.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Mapping count for the synthetic scene.
    #[arg(long, default_value_t = 64)]
    synthetic: usize,

    /// Worker thread count (0 picks one per core).
    #[arg(short, long)]
    threads: Option<usize>,

    /// Deterministic build seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Quality scale, clamped to [0.25, 4].
    #[arg(short, long)]
    quality: Option<f32>,

    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_filter = if args.quiet {
        "warn"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut settings = match &args.settings {
        Some(path) => match BuildSettings::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                log::error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => BuildSettings::default(),
    };
    if let Some(threads) = args.threads {
        settings.worker_threads = threads;
    }
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    if let Some(quality) = args.quality {
        settings.quality = quality;
    }
    settings.validate();

    let scene = match &args.scene {
        Some(path) => match Scene::load(path, &settings) {
            Ok(scene) => scene,
            Err(err) => {
                log::error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => Scene::synthetic(args.synthetic, settings.seed, &settings),
    };
    let scene = Arc::new(scene);
    log::info!(
        "scene '{}': {} tasks ({} mappings)",
        scene.name,
        scene.task_ids().len(),
        scene.mappings.len()
    );

    let agent = Arc::new(FarmAgent::seed(&scene.task_ids()));
    let exporter = Arc::new(CollectingExporter::new());

    // Forward farm traffic into the logger while the build runs.
    let pump_done = Arc::new(AtomicBool::new(false));
    let pump = {
        let agent = Arc::clone(&agent);
        let done = Arc::clone(&pump_done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                for msg in agent.drain_messages() {
                    msg.emit();
                }
                thread::sleep(Duration::from_millis(20));
            }
            for msg in agent.drain_messages() {
                msg.emit();
            }
        })
    };

    let result = run_build(scene, settings, Arc::new(agent.client()), exporter);
    pump_done.store(true, Ordering::Release);
    let _ = pump.join();

    match result {
        Ok(report) => {
            log::info!(
                "farm: {} handed out, {} rejected, {}/{} completed",
                agent.accepted_count(),
                agent.rejected_count(),
                agent.completed_count(),
                agent.unique_total()
            );
            if report.cancelled {
                log::warn!("build was cancelled before completion");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("build failed: {err}");
            ExitCode::FAILURE
        }
    }
}

//! CLI Entry Point for imager_agent
//!
//! Provides command-line interface for:
//! - Validating a batch configuration and printing the capture plan
//! - Running a batch against simulated hardware
//!
//! # Usage
//!
//! Check a configuration:
//! ```bash
//! imager_agent check --config config/imager.toml
//! ```
//!
//! Run a batch on the simulators:
//! ```bash
//! imager_agent run --config config/imager.toml
//! imager_agent run --json   # status reports as JSON lines
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imager_agent::agent::ImagerAgent;
use imager_agent::config::{ImagerConfig, DEFAULT_CONFIG_PATH};
use imager_agent::hardware::mock::{MockCamera, MockFilterWheel};
use imager_agent::hardware::DeviceId;
use imager_agent::imager::status::total_exposure;
use imager_agent::imager::{naming, BatchState, Imager};
use imager_agent::storage::FileImageStore;
use imager_agent::tracing_init;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "imager_agent")]
#[command(about = "Batch capture sequencer for a camera and filter wheel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured batch on simulated hardware
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override the output directory
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print status reports as JSON lines instead of summaries
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration and print the capture plan
    Check {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            json,
        } => run_batch(config, output, json).await,
        Commands::Check { config } => check_config(config),
    }
}

fn load_config(path: &PathBuf) -> Result<ImagerConfig> {
    let config = ImagerConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;

    println!("Configuration OK: {}", path.display());
    println!("Camera:       {}", config.devices.camera);
    println!(
        "Filter wheel: {}",
        config.devices.filter_wheel.as_deref().unwrap_or("(none)")
    );
    println!("Output:       {}", config.storage.output_dir.display());
    println!();

    for (index, group) in config.groups.iter().enumerate() {
        let filter = group
            .filter_slot
            .map_or_else(|| "-".to_string(), |slot| slot.to_string());
        println!(
            "Group {:>2}: {:>4} x {:>8.1}s  filter {:>2}  bin {}  first {}",
            index + 1,
            group.image_count,
            group.exposure.as_secs_f64(),
            filter,
            group.binning,
            naming::image_filename(
                &config.storage.prefix,
                index,
                0,
                naming::DEFAULT_EXTENSION
            ),
        );
    }

    let images: u64 = config.groups.iter().map(|g| u64::from(g.image_count)).sum();
    println!();
    println!(
        "{} images, {:.1}s total exposure",
        images,
        total_exposure(&config.groups).as_secs_f64()
    );
    Ok(())
}

async fn run_batch(path: PathBuf, output: Option<PathBuf>, json: bool) -> Result<()> {
    let mut config = load_config(&path)?;
    if let Some(output) = output {
        config.storage.output_dir = output;
    }
    tracing_init::init_from_config(&config)?;
    info!(config = %path.display(), "Loaded configuration");

    let (device_tx, device_rx) = mpsc::channel(64);
    let camera = Arc::new(
        MockCamera::new(config.devices.camera.as_str(), device_tx.clone())
            .with_time_scale(config.simulation.time_scale),
    );
    let wheel = config.devices.filter_wheel.as_deref().map(|name| {
        Arc::new(
            MockFilterWheel::new(name, config.simulation.filter_slots, device_tx.clone())
                .with_step_time(config.simulation.step_time),
        )
    });
    drop(device_tx);

    let store = Arc::new(FileImageStore::new(&config.storage.output_dir));
    let imager = Imager::new().with_abort_timeout(config.sequencer.abort_timeout);
    let mut agent = ImagerAgent::new(imager, store);
    agent.register_camera(camera.clone());
    if let Some(wheel) = &wheel {
        agent.register_filter_wheel(wheel.clone());
    }
    let (handle, task) = agent.spawn(device_rx);

    camera.connect().await;
    if let Some(wheel) = &wheel {
        wheel.connect().await;
    }

    handle
        .set_devices(
            config.devices.camera.as_str(),
            config.devices.filter_wheel.clone().map(DeviceId::from),
        )
        .await?;
    handle.set_image_prefix(config.storage.prefix.clone()).await?;
    handle.configure(config.groups.clone()).await?;

    let mut status = handle.subscribe();
    handle.start().await?;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let report = status.borrow_and_update().clone();
                if json {
                    println!("{}", serde_json::to_string(&report)?);
                } else {
                    println!("{}", report.summary());
                }
                if report.state == BatchState::Idle {
                    match &report.alert {
                        Some(alert) => warn!(alert = %alert, "Batch ended with alert"),
                        None => info!(
                            output = %config.storage.output_dir.display(),
                            "Batch finished"
                        ),
                    }
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, aborting batch");
                handle.abort().await?;
            }
        }
    }

    handle.shutdown().await?;
    task.await.context("Imager agent task panicked")?;
    Ok(())
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fwup_core::session::{SessionConfig, UpdateSession};
use fwup_core::transport::SimulatedDevice;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "BLE GATT firmware update tool", long_about = None)]
struct Args {
    /// Path to the firmware image
    firmware: Option<PathBuf>,

    /// Load session settings from a TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings to a TOML file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Bytes the simulated target already holds from an earlier attempt
    #[arg(long, default_value_t = 0)]
    resume_from: u32,

    /// Firmware version reported by the simulated target
    #[arg(long, default_value_t = 0)]
    device_version: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(firmware) = &args.firmware {
        config.firmware_path = Some(firmware.clone());
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    if let Some(path) = &args.save_config {
        config
            .save_to_file(path)
            .with_context(|| format!("Failed to save config {}", path.display()))?;
        info!("Config written to {}", path.display());
        return Ok(());
    }

    let mut device = SimulatedDevice::new(&config.target_name).with_version(args.device_version);
    if args.resume_from > 0 {
        let path = config
            .firmware_path
            .as_ref()
            .context("--resume-from needs a firmware image")?;
        let image = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let held = (args.resume_from as usize).min(image.len());
        device = device.with_received(&image[..held]);
    }

    info!(
        adapter = %config.adapter,
        "Updating {} (simulated)",
        device.name()
    );

    let summary = UpdateSession::new(config).run(&device)?;

    info!(
        start = summary.start_offset.unwrap_or(0),
        chunks = summary.chunks_sent,
        "Sent {} bytes, device holds {} bytes",
        summary.bytes_sent,
        device.offset()
    );
    Ok(())
}

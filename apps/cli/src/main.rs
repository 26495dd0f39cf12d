use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use irestore_core::archive::ExtractedArchive;
use irestore_core::session::{RestoreConfig, RestoreSession};
use irestore_core::transport::NusbConnector;
use irestore_core::tss::HttpTssTransport;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "iOS restore tool (Pure Rust)", long_about = None)]
struct Args {
    /// Extracted firmware directory (contains BuildManifest.plist)
    firmware: PathBuf,

    /// Target device ECID, hex with or without 0x
    #[arg(short, long, value_parser = parse_ecid)]
    ecid: Option<u64>,

    /// Load settings from a TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective settings to a TOML file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Signing server URL
    #[arg(short, long)]
    url: Option<String>,

    /// Erase the device instead of updating it
    #[arg(long)]
    erase: bool,

    /// Firmware is custom-built; skip signing
    #[arg(long)]
    custom: bool,

    /// Device runs an exploited DFU stage
    #[arg(long)]
    exploit: bool,

    /// Detect the device and stop
    #[arg(short, long)]
    no_action: bool,

    /// Restore the latest available firmware
    #[arg(long)]
    latest: bool,

    /// Kernel boot-args override
    #[arg(long, allow_hyphen_values = true)]
    boot_args: Option<String>,

    /// Load iBEC from recovery mode before staging
    #[arg(long)]
    boot_ibec: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_ecid(text: &str) -> Result<u64, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid ECID {text:?}: {e}"))
}

fn build_config(args: &Args) -> Result<RestoreConfig> {
    let mut config = match &args.config {
        Some(path) => RestoreConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RestoreConfig::default(),
    };

    if args.ecid.is_some() {
        config.ecid = args.ecid;
    }
    if let Some(url) = &args.url {
        config.url = url.clone();
    }
    if args.boot_args.is_some() {
        config.boot_args = args.boot_args.clone();
    }
    config.flags.erase |= args.erase;
    config.flags.custom |= args.custom;
    config.flags.exploit |= args.exploit;
    config.flags.no_action |= args.no_action;
    config.flags.latest |= args.latest;
    config.boot_ibec |= args.boot_ibec;
    Ok(config)
}

fn main() -> Result<()> {
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

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = build_config(&args)?;

    if let Some(path) = &args.save_config {
        config
            .save_to_file(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Configuration saved");
        return Ok(());
    }

    info!(firmware = %args.firmware.display(), "Starting irestore (nusb backend)...");

    let signer = HttpTssTransport::new()?;
    let mut session = RestoreSession::new(
        config,
        NusbConnector::new(),
        ExtractedArchive::new(&args.firmware),
        signer,
    );

    if let Err(e) = session.run() {
        error!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

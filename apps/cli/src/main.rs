use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use fwup_core::events::{TracingObserver, UpdateEvent, UpdateObserver};
use fwup_core::{
    CancelToken, Component, DirectoryCatalog, ExternalFlasher, FirmwareImage, ImageSpec,
    RebootStrategy, Resolver, SerialTransport, SessionConfig, UpdateSession,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PackageMode {
    Gnss,
    App,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "LG69T serial firmware update tool", long_about = None)]
struct Args {
    /// Path to a .p1fw package (zip archive or directory)
    #[arg(long, value_name = "FILE")]
    p1fw: Option<PathBuf>,

    /// Components to take from the package; may be repeated (default: gnss and app)
    #[arg(long, value_enum, value_name = "MODE")]
    p1fw_mode: Vec<PackageMode>,

    /// Raw GNSS receiver binary
    #[arg(long, value_name = "FILE")]
    gnss: Option<PathBuf>,

    /// Raw application binary
    #[arg(long, value_name = "FILE")]
    app: Option<PathBuf>,

    /// Bootloader binary, flashed with the external tool first
    #[arg(long, value_name = "FILE")]
    bootloader: Option<PathBuf>,

    /// Released version to install, as COMPONENT@VERSION; may be repeated
    #[arg(long, value_name = "COMPONENT@VERSION", value_parser = parse_release)]
    release: Vec<(Component, String)>,

    /// Directory holding released <version>.p1fw packages
    #[arg(long, value_name = "DIR")]
    catalog: Option<PathBuf>,

    /// Serial port of the device
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Skip the software reset and ask for a manual power cycle instead
    #[arg(short, long)]
    manual_reboot: bool,

    /// Do not reset the device into its updater before the update
    #[arg(long)]
    no_reboot: bool,

    /// Resends allowed per packet
    #[arg(long)]
    max_retries: Option<u32>,

    /// Session configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_release(s: &str) -> Result<(Component, String), String> {
    let (component, version) = s
        .split_once('@')
        .ok_or_else(|| format!("expected COMPONENT@VERSION, got '{}'", s))?;
    if version.is_empty() {
        return Err("release version is empty".to_string());
    }
    Ok((component.parse()?, version.to_string()))
}

/// Progress bar over the packet transfer; everything else goes to tracing.
struct ProgressObserver {
    bar: Mutex<Option<ProgressBar>>,
    log: TracingObserver,
}

impl ProgressObserver {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            log: TracingObserver,
        }
    }
}

impl UpdateObserver for ProgressObserver {
    fn on_event(&self, event: &UpdateEvent) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        match event {
            UpdateEvent::Progress {
                component,
                current,
                total,
            } => {
                let bar = slot.get_or_insert_with(|| {
                    let bar = ProgressBar::new(*total);
                    if let Ok(style) = ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                    {
                        bar.set_style(style.progress_chars("=>-"));
                    }
                    bar.set_message(format!("Sending {} firmware", component));
                    bar
                });
                bar.set_position(*current);
                if current == total {
                    bar.finish_with_message(format!("{} firmware sent", component));
                    *slot = None;
                }
            }
            UpdateEvent::ManualRebootRequired { message, .. } => {
                if let Some(bar) = slot.as_ref() {
                    bar.suspend(|| eprintln!("{}", message));
                } else {
                    eprintln!("{}", message);
                }
            }
            other => match slot.as_ref() {
                Some(bar) => bar.suspend(|| self.log.on_event(other)),
                None => self.log.on_event(other),
            },
        }
    }
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(retries) = args.max_retries {
        config.max_retries = retries;
    }
    if args.manual_reboot {
        config.reboot_strategy = RebootStrategy::Manual;
    }
    if args.no_reboot {
        config.reboot_before_update = false;
    }
    Ok(config)
}

/// Everything to resolve, in the order given on the command line.
fn image_specs(args: &Args) -> Result<Vec<ImageSpec>> {
    let mut specs = Vec::new();

    if let Some(path) = &args.p1fw {
        let modes = if args.p1fw_mode.is_empty() {
            vec![PackageMode::Gnss, PackageMode::App]
        } else {
            args.p1fw_mode.clone()
        };
        let components = modes
            .iter()
            .map(|m| match m {
                PackageMode::Gnss => Component::Gnss,
                PackageMode::App => Component::Application,
            })
            .collect();
        specs.push(ImageSpec::Package {
            path: path.clone(),
            components,
        });

        if args.gnss.is_some() {
            warn!("Ignoring provided GNSS bin path, as p1fw path was provided.");
        }
        if args.app.is_some() {
            warn!("Ignoring provided application bin path, as p1fw path was provided.");
        }
    } else {
        if let Some(path) = &args.gnss {
            specs.push(ImageSpec::File {
                path: path.clone(),
                component: Component::Gnss,
            });
        }
        if let Some(path) = &args.app {
            specs.push(ImageSpec::File {
                path: path.clone(),
                component: Component::Application,
            });
        }
    }

    for (component, version) in &args.release {
        specs.push(ImageSpec::Release {
            component: *component,
            version: version.clone(),
        });
    }

    if specs.is_empty() && args.bootloader.is_none() {
        bail!("You must specify a p1fw file, a gnss file, an app file, a bootloader or a release to upgrade.");
    }
    Ok(specs)
}

/// Resolve all images up front so nothing is flashed when one is missing.
/// GNSS goes before the application.
fn resolve_images(args: &Args) -> Result<Vec<FirmwareImage>> {
    let mut resolver = Resolver::new();
    if let Some(dir) = &args.catalog {
        resolver = resolver.with_catalog(DirectoryCatalog::new(dir));
    }

    let mut images = Vec::new();
    for spec in image_specs(args)? {
        images.extend(resolver.resolve(&spec)?);
    }
    images.sort_by_key(|image| match image.component() {
        Component::Gnss => 0,
        _ => 1,
    });
    Ok(images)
}

/// Ctrl-C stops the running session at its next packet or poll.
fn install_cancel_handler() -> Result<CancelToken> {
    let token = CancelToken::new();
    let token_for_signal = token.clone();
    ctrlc::set_handler(move || {
        token_for_signal.cancel();
    })
    .context("installing Ctrl-C handler failed")?;
    Ok(token)
}

fn run(args: &Args, cancel: &CancelToken) -> Result<()> {
    let config = load_config(args)?;
    let images = resolve_images(args)?;

    if let Some(path) = &args.bootloader {
        if !path.exists() {
            bail!("Bootloader image {} not found", path.display());
        }
        info!(path = %path.display(), "Flashing bootloader");
        ExternalFlasher::new(config.bootloader.clone()).flash_default(path, &config.port)?;
    }

    let observer = Arc::new(ProgressObserver::new());
    for image in &images {
        info!(
            component = %image.component(),
            version = image.version().unwrap_or("unknown"),
            len = image.len(),
            "Starting update"
        );
        let transport = SerialTransport::open(&config.port, config.baud_rate)?;
        let report = UpdateSession::with_observer(config.clone(), transport, Arc::clone(&observer))
            .with_cancel(cancel.clone())
            .run(image)
            .with_context(|| format!("{} update failed", image.component()))?;
        info!(
            component = %report.component,
            packets = report.packets,
            retransmissions = report.retransmissions,
            "Update succeeded"
        );
    }
    Ok(())
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

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    let result = install_cancel_handler().and_then(|cancel| run(&args, &cancel));
    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

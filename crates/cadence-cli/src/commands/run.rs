//! Server run command.

use anyhow::Context;
use cadence_config::{DriverConfig, ServerConfig, default_config_path, user_drivers_dir};
use cadence_core::ParamValue;
use cadence_server::Server;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Configuration file (TOML); defaults to the user config if present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server name
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Audio driver (see `cadenced drivers`)
    #[arg(short, long)]
    driver: Option<String>,

    /// Sample rate
    #[arg(short, long)]
    rate: Option<u32>,

    /// Frames per period
    #[arg(short, long)]
    period: Option<u32>,

    /// Loopback channel count (0 disables the loopback driver)
    #[arg(short = 'L', long)]
    loopback: Option<u32>,

    /// Client timeout in milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Request realtime scheduling
    #[arg(long)]
    realtime: bool,

    /// Disable realtime scheduling
    #[arg(long, conflicts_with = "realtime")]
    no_realtime: bool,

    /// Exit when the last client leaves
    #[arg(long)]
    temporary: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ServerConfig> {
    if let Some(path) = path {
        return ServerConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()));
    }
    let path = default_config_path();
    if path.exists() {
        return ServerConfig::load(&path)
            .with_context(|| format!("loading configuration {}", path.display()));
    }
    Ok(ServerConfig::default())
}

/// Applies command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut ServerConfig, args: &RunArgs) {
    if let Some(name) = &args.name {
        config.name.clone_from(name);
    }
    if let Some(driver) = &args.driver
        && *driver != config.driver.name
    {
        config.driver = DriverConfig::new(driver.clone());
    }
    if let Some(rate) = args.rate {
        config.driver.params.remove("r");
        config
            .driver
            .params
            .insert("rate".to_string(), ParamValue::UInt(u64::from(rate)));
    }
    if let Some(period) = args.period {
        config.driver.params.remove("p");
        config
            .driver
            .params
            .insert("period".to_string(), ParamValue::UInt(u64::from(period)));
    }
    if let Some(loopback) = args.loopback {
        config.loopback = loopback;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_ms = timeout;
    }
    if args.realtime {
        config.realtime = true;
    } else if args.no_realtime {
        config.realtime = false;
    }
    config.temporary |= args.temporary;
    config.verbose |= args.verbose;
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    // Bridge `log` records from cpal and libloading.
    tracing_log::LogTracer::init().ok();
    Ok(())
}

pub fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;
    init_tracing(config.verbose)?;

    let drivers_dir = user_drivers_dir();
    if drivers_dir.is_dir() {
        config.module_dirs.push(drivers_dir);
    }

    let server = Server::new(&config);
    server
        .open(&config.driver.name, &config.driver_params())
        .with_context(|| format!("opening server '{}'", config.name))?;
    server.start()?;

    println!(
        "Server '{}' running on driver '{}' ({} frames at {} Hz)",
        server.name(),
        config.driver.name,
        server.control().buffer_size(),
        server.control().sample_rate()
    );
    println!("\nPress Ctrl+C to stop...\n");

    let weak = Arc::downgrade(&server);
    ctrlc::set_handler(move || {
        if let Some(server) = weak.upgrade() {
            server.request_shutdown();
        }
    })?;

    // Also fires when a temporary server loses its last client.
    let _ = server.shutdown_signal().recv();
    println!("\nStopping...");

    server.stop()?;
    server.close()?;
    println!("Done!");
    Ok(())
}

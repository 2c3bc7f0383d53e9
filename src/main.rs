// src/main.rs - gcode-host: runs the G-code dispatcher against simulated motion and heaters
use std::path::PathBuf;

use clap::Parser;
use tokio::task::LocalSet;

use krusty_gcodes::config::{self, Config};
use krusty_gcodes::files::DirFileStore;
use krusty_gcodes::host::{Host, HostOptions};
use krusty_shared::FileStore;
use krusty_simulator::MemoryFiles;

/// G-code host CLI
#[derive(Parser, Debug)]
#[command(name = "gcode-host", about = "Feeds G-code from serial, stdin or the command line through the dispatcher.")]
struct Cli {
    /// Path to a TOML config file (defaults are used when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device to read commands from instead of stdin
    #[arg(long)]
    serial: Option<String>,

    /// Serial baud rate (overrides the config)
    #[arg(long)]
    baud: Option<u32>,

    /// Keep files in memory instead of under the configured root
    #[arg(long)]
    simulate: bool,

    /// Run the configuration macro before accepting commands
    #[arg(long)]
    run_config: bool,

    /// Command to execute; may be repeated. The host exits when they are done.
    #[arg(short = 'e', long = "exec")]
    exec: Vec<String>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();

    tracing::info!("Starting gcode-host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            config::load_config(&path).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path, e);
                Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
            })?
        }
        None => {
            tracing::info!("No configuration given, using defaults");
            Config::default()
        }
    };
    tracing::info!(
        "Machine: {} ({} extruders, {} heaters)",
        config.machine.name.as_deref().unwrap_or("unnamed"),
        config.machine.extruders,
        config.machine.heaters
    );

    let files: Box<dyn FileStore> = if cli.simulate {
        Box::new(MemoryFiles::new())
    } else {
        Box::new(DirFileStore::new(&config.files.root))
    };
    let options = HostOptions {
        serial: cli.serial.or_else(|| config.host.serial.clone()),
        baud: cli.baud.unwrap_or(config.host.baud),
        run_config: cli.run_config,
        exit_when_idle: !cli.exec.is_empty(),
        exec: cli.exec,
    };

    let host = Host::new(config, files)?;
    let shutdown_tx = host.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            let _ = shutdown_tx.send(());
        }
    });

    let local = LocalSet::new();
    local.run_until(host.run(options)).await?;
    tracing::info!("gcode-host stopped");
    Ok(())
}

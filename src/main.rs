use anyhow::{Context, Result};
use auralock::config::{Config, SessionConfig};
use auralock::daemon;
use auralock::session::{CommandSession, DryRunSession, SessionAction, SessionController};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "auralock")]
#[command(version = "0.1.0")]
#[command(about = "Locks the screen when your Bluetooth wearable walks away")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look for the device, then lock and unlock the session as it moves
    Run {
        /// Log lock/unlock decisions without running any desktop command
        #[arg(long)]
        dry_run: bool,
    },

    /// Feed a JSON-lines sample recording through the decision engine
    Replay {
        /// Recorded samples, one JSON object per line
        file: PathBuf,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_secs()
        .init();

    match cli.command {
        Commands::Run { dry_run } => handle_run(&cli.config, dry_run).await,
        Commands::Replay { file } => handle_replay(&cli.config, file).await,
        Commands::Init { force } => handle_init(&cli.config, force),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path).context("Failed to load config")?;
    config.validate().context("Invalid config")?;
    Ok(config)
}

async fn handle_run(config_path: &Path, dry_run: bool) -> Result<()> {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            // The configured notifier is unknown here, fall back to the default one
            CommandSession::new(&SessionConfig::default())
                .notify(&format!("AuraLock could not start: {:#}", e));
            return Err(e);
        }
    };

    // Set up shared running flag for signal handling
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping scan...");
        r.store(false, Ordering::SeqCst);
    })?;

    let result = if dry_run {
        daemon::run(&config, DryRunSession::new(), running).await
    } else {
        daemon::run(&config, CommandSession::new(&config.session), running).await
    };

    info!("Exiting.");
    result
}

async fn handle_replay(config_path: &Path, file: PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    let session = daemon::replay(&config, file).await?;

    for action in session.actions() {
        match action {
            SessionAction::Lock => println!("lock"),
            SessionAction::Unlock => println!("unlock"),
            SessionAction::Notify(message) => println!("notify: {}", message),
        }
    }

    Ok(())
}

fn handle_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{:?} already exists, use --force to overwrite it",
            config_path
        );
    }

    let config = Config::default();
    config.save(config_path)?;
    info!("Created {:?}", config_path);
    info!("Set device.address to your wearable's Bluetooth address, then run 'auralock run'.");

    Ok(())
}

//! Flick CLI
//!
//! Hand one file to a nearby device without pairing. `flick send` advertises
//! the file on the local network and waits for one receiver; `flick receive`
//! picks up the first advertised file it finds.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use flick_core::{
    Acquirer, Advertiser, ContentStore, DeviceIdentity, StatusBridge, StatusEvent, StatusReceiver,
};
use flick_discovery::MdnsSubstrate;
use flick_files::IncomingDir;
use flick_transport::TcpEngine;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use config::{Config, KEYS, expand_path};
use progress::{TransferProgress, format_bytes};

/// Flick - zero-pairing file handoff on the local network
#[derive(Parser)]
#[command(name = "flick")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/flick/config.toml")]
    config: String,

    /// Print status events as JSON lines instead of a progress bar
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Offer a file to the first device that picks it up
    Send {
        /// File to send
        file: PathBuf,

        /// Port to listen on (defaults to network.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Name to advertise instead of the file's own name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Download the first file offered on the network
    Receive {
        /// Directory to save into (defaults to transfer.output_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the name and size a file would be advertised with
    Info {
        /// File to inspect
        file: PathBuf,
    },

    /// View or modify configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show specific configuration key
        key: Option<String>,
    },

    /// Set a configuration value
    Set {
        /// Configuration key to set
        key: String,

        /// Value to set
        value: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let config_path = expand_path(&cli.config);
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else if config_path == Config::default_path() {
        Config::load_or_default()?
    } else {
        Config::load(&config_path)?
    };

    // `config set` must be able to repair an invalid file
    if !matches!(cli.command, Commands::Config { .. }) {
        config.validate()?;
    }

    match cli.command {
        Commands::Send { file, port, name } => {
            send_file(file, port, name, &config, cli.json).await?;
        }
        Commands::Receive { output } => {
            receive_file(output, &config, cli.json).await?;
        }
        Commands::Info { file } => {
            show_info(file, cli.json)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { key } => config_show(key, &config)?,
            ConfigAction::Set { key, value } => config_set(&key, &value, &config_path)?,
        },
    }

    Ok(())
}

/// Advertise `file` and serve it to the first peer
async fn send_file(
    file: PathBuf,
    port: Option<u16>,
    name: Option<String>,
    config: &Config,
    json: bool,
) -> anyhow::Result<()> {
    let source = IncomingDir::new(&config.transfer.output_dir).open_source(&file)?;
    let display_name = name.unwrap_or(source.display_name);
    let size = source.handle.probe_size().ok();
    let port = port.unwrap_or(config.network.port);

    let (events, consumer) = StatusBridge::channel(config.discovery.status_capacity);
    let advertiser = Advertiser::new(
        MdnsSubstrate::hub(config.mdns_config()),
        Arc::new(TcpEngine::new(config.engine_config())),
        DeviceIdentity::new(&config.device.name),
        events,
    );

    if !json {
        println!("File: {}", file.display());
        if let Some(size) = size {
            println!("Size: {}", format_bytes(size));
        }
        println!("Service: {}", advertiser.identity().service_name());
        println!("Port: {port}");
        println!();
    }

    let session = advertiser.begin(source.handle, &display_name, port).await?;
    tracing::info!(%session, "Advertising {display_name}");

    follow(consumer, size, &display_name, json, move || {
        let advertiser = advertiser.clone();
        async move { advertiser.cancel().await }
    })
    .await
}

/// Pick up the first advertised file
async fn receive_file(output: Option<PathBuf>, config: &Config, json: bool) -> anyhow::Result<()> {
    let root = output.unwrap_or_else(|| config.transfer.output_dir.clone());
    let (events, consumer) = StatusBridge::channel(config.discovery.status_capacity);
    let acquirer = Acquirer::new(
        MdnsSubstrate::hub(config.mdns_config()),
        Arc::new(TcpEngine::new(config.engine_config())),
        Arc::new(IncomingDir::new(&root)),
        events,
    );

    if !json {
        println!("Saving to: {}", root.display());
        println!();
    }

    let session = acquirer.begin().await?;
    tracing::info!(%session, "Browsing for offers");

    follow(consumer, None, "Looking for devices...", json, move || {
        let acquirer = acquirer.clone();
        async move { acquirer.cancel().await }
    })
    .await
}

/// Render bridge events until the session ends; Ctrl-C cancels it
async fn follow<F, Fut>(
    mut events: StatusReceiver,
    total: Option<u64>,
    label: &str,
    json: bool,
    cancel: F,
) -> anyhow::Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
{
    let mut progress = (!json).then(|| TransferProgress::new(total, label));
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = events.recv_latest() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                // Runs beside this loop, which keeps draining the events the
                // cancellation has to queue
                let cancelling = cancel();
                tokio::spawn(async move {
                    if !cancelling.await {
                        tracing::debug!("Nothing left to cancel");
                    }
                });
                continue;
            }
        };

        let Some(event) = event else {
            anyhow::bail!("Status channel closed before the transfer finished");
        };

        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else if let Some(progress) = progress.as_mut() {
            render(progress, &event);
        }

        if event.is_terminal() {
            return match event {
                StatusEvent::Completed { .. } => Ok(()),
                other => Err(anyhow::anyhow!("{}", other.message())),
            };
        }
    }
}

fn render(progress: &mut TransferProgress, event: &StatusEvent) {
    match event {
        StatusEvent::Status { message, .. } => progress.set_message(message),
        StatusEvent::Progress {
            bytes,
            total,
            message,
            ..
        } => {
            if let Some(total) = total {
                progress.set_total(*total);
            }
            progress.update(*bytes);
            progress.set_message(message);
        }
        StatusEvent::Completed { bytes, message, .. } => {
            progress.update(*bytes);
            progress.finish_with_message(message);
        }
        StatusEvent::Failed { message, .. } | StatusEvent::Cancelled { message, .. } => {
            progress.abandon_with_message(message);
        }
    }
}

/// Print what `send` would advertise for `file`
fn show_info(file: PathBuf, json: bool) -> anyhow::Result<()> {
    let parent = file.parent().map(std::path::Path::to_path_buf).unwrap_or_default();
    let source = IncomingDir::new(parent).open_source(&file)?;
    let size = source.handle.probe_size();

    if json {
        let size = size.as_ref().ok().copied();
        println!(
            "{}",
            serde_json::json!({ "name": source.display_name, "size": size })
        );
        return Ok(());
    }

    println!("Name: {}", source.display_name);
    match size {
        Ok(bytes) => println!("Size: {} ({bytes} bytes)", format_bytes(bytes)),
        Err(e) => println!("Size: unknown ({e})"),
    }
    Ok(())
}

/// Show one key or the whole configuration
fn config_show(key: Option<String>, config: &Config) -> anyhow::Result<()> {
    if let Some(key) = key {
        println!("{}", config.get(&key)?);
        return Ok(());
    }

    println!("Flick Configuration");
    println!();
    let mut section = "";
    for key in KEYS {
        let (head, field) = key.split_once('.').unwrap_or(("", key));
        if head != section {
            if !section.is_empty() {
                println!();
            }
            println!("[{head}]");
            section = head;
        }
        println!("  {field} = {}", config.get(key)?);
    }
    Ok(())
}

/// Set a configuration value and save the file
fn config_set(key: &str, value: &str, path: &std::path::Path) -> anyhow::Result<()> {
    let mut config = if path.exists() {
        Config::load(path)?
    } else {
        Config::default()
    };

    config.set(key, value)?;
    config.validate()?;
    config.save(path)?;

    println!("Configuration updated: {key} = {value}");
    println!("Saved to: {}", path.display());
    Ok(())
}

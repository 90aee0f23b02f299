//! hubcli - command line consumer for a Thing-oriented IoT hub

use clap::{Parser, Subcommand};
use hubconnect::config::ClientConfig;
use hubconnect::connection::RequestOptions;
use hubconnect::observability::init_default_logging;
use hubconnect::{Consumer, RequestMessage, OP_INVOKE_ACTION};
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info};

/// Talk to a hub over HTTP+SSE, MQTT or NATS
#[derive(Parser)]
#[command(name = "hubcli")]
#[command(about = "Consumer client for Thing-oriented IoT hubs")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "HUBCLI_CONFIG")]
    config: Option<PathBuf>,

    /// Override the request timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke an action and print its output
    Invoke {
        thing_id: String,
        action: String,
        /// Action input as JSON; plain text is sent as a string
        input: Option<String>,
        /// Print progress responses while waiting
        #[arg(long)]
        progress: bool,
    },
    /// Write a property value
    Write {
        thing_id: String,
        property: String,
        /// Value as JSON; plain text is sent as a string
        value: String,
    },
    /// Read one property, or all of them when no name is given
    Read {
        thing_id: String,
        property: Option<String>,
    },
    /// Print events (or property updates) until interrupted
    Subscribe {
        /// Thing ID; omit for all Things
        thing_id: Option<String>,
        /// Event or property name; omit for all
        name: Option<String>,
        /// Observe property updates instead of events
        #[arg(long)]
        properties: bool,
    },
    /// Validate the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let mut config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeouts.request_timeout_ms = timeout_ms;
    }

    let result = match cli.command {
        Commands::Config { show } => handle_config_command(&config, show),
        command => run_command(config, command).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }
    for path_str in ["hub.toml", "config/hub.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }
    Err("no configuration file found; pass --config or create hub.toml".into())
}

fn handle_config_command(config: &ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!(transport = ?config.transport_kind()?, "Configuration is valid");
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_command(
    config: ClientConfig,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    let consumer = Consumer::new(config)?;
    consumer.connect_with_config().await?;

    let result = execute(&consumer, command).await;
    consumer.disconnect().await;
    result
}

async fn execute(consumer: &Consumer, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Invoke {
            thing_id,
            action,
            input,
            progress,
        } => {
            let request = RequestMessage::new(
                OP_INVOKE_ACTION,
                thing_id,
                action,
                input.as_deref().map(parse_value),
            );
            let mut options = RequestOptions::default();
            if progress {
                options = options.with_progress(|r| eprintln!("{:?}", r.status));
            }
            let output = consumer
                .send_request_with(request, options)
                .await?
                .into_output()?;
            print_json(&output.unwrap_or(Value::Null))
        }
        Commands::Write {
            thing_id,
            property,
            value,
        } => {
            consumer
                .write_property(&thing_id, &property, parse_value(&value))
                .await?;
            Ok(())
        }
        Commands::Read { thing_id, property } => {
            let value = match property {
                Some(name) => consumer.read_property(&thing_id, &name).await?,
                None => consumer.read_all_properties(&thing_id).await?,
            };
            print_json(&value)
        }
        Commands::Subscribe {
            thing_id,
            name,
            properties,
        } => {
            consumer.set_notification_handler(|n| match serde_json::to_string(&n) {
                Ok(line) => println!("{line}"),
                Err(e) => error!("Failed to print notification: {}", e),
            });
            let thing_id = thing_id.unwrap_or_default();
            let name = name.unwrap_or_default();
            if properties {
                consumer.observe_property(&thing_id, &name).await?;
            } else {
                consumer.subscribe(&thing_id, &name).await?;
            }
            wait_for_shutdown().await?;
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

async fn wait_for_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

//! mqtt-agent: connect to a broker, subscribe, and log what arrives

use clap::{Parser, Subcommand};
use mqtt_agent::agent::{
    AgentHandle, AgentSettings, CommandInfo, LoopExit, MqttAgent, Subscription,
};
use mqtt_agent::config::AgentConfig;
use mqtt_agent::observability::init_default_logging;
use mqtt_agent::protocol::PublishInfo;
use mqtt_agent::transport::{SecureTransport, TcpTransport, TlsTransport};
use mqtt_agent::{agent_span, AgentError};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn, Instrument};

/// How long the CLI waits for pool and queue space
const COMMAND_BLOCK_TIME: Duration = Duration::from_secs(1);

/// Single-connection MQTT agent
#[derive(Parser)]
#[command(name = "mqtt-agent")]
#[command(about = "Single-connection MQTT agent")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe to the configured filters and log incoming publishes
    Run {
        /// Full connect sequences to try before giving up
        #[arg(long, default_value_t = 2, env = "MQTT_AGENT_BOOT_ATTEMPTS")]
        boot_attempts: u32,
    },
    /// Validate the configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { boot_attempts } => run_agent(config, boot_attempts).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(AgentConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["mqtt-agent.toml", "config/mqtt-agent.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(AgentConfig::load_from_file(&path)?);
                }
            }
            Err("No configuration file found. Provide one with -c/--config or create mqtt-agent.toml".into())
        }
    }
}

async fn run_agent(config: AgentConfig, boot_attempts: u32) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.agent_settings()?;
    if settings.credentials.requires_tls() {
        info!(server = %settings.server, "Connecting over TLS");
        serve(config, settings, TlsTransport::new(), boot_attempts).await
    } else {
        warn!(server = %settings.server, "No TLS material configured, connecting over plaintext TCP");
        serve(config, settings, TcpTransport::new(), boot_attempts).await
    }
}

async fn serve<T>(
    config: AgentConfig,
    settings: AgentSettings,
    transport: T,
    boot_attempts: u32,
) -> Result<(), Box<dyn std::error::Error>>
where
    T: SecureTransport + 'static,
{
    let client_id = settings.client_id.clone();

    let (mut agent, handle) = MqttAgent::new(settings, transport);
    agent.set_unsolicited_publish_handler(|publish: &PublishInfo<'_>| {
        warn!(topic = publish.topic, bytes = publish.payload.len(), "Unsolicited publish");
    });

    boot(&mut agent, boot_attempts.max(1)).await?;

    let span = agent_span!(client_id = %client_id);
    let mut agent_task = tokio::spawn(async move { agent.command_loop().await }.instrument(span));

    subscribe_configured(&config, &handle).await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Agent is running");

    let finished = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            None
        }
        result = &mut agent_task => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            handle.terminate(CommandInfo::new(COMMAND_BLOCK_TIME)).await?;
            agent_task.await
        }
    };

    match result? {
        Ok(LoopExit::Terminated) | Ok(LoopExit::Disconnected) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Connect with backoff, starting the whole sequence over up to
/// `attempts` times.
async fn boot<T: SecureTransport>(
    agent: &mut MqttAgent<T>,
    attempts: u32,
) -> Result<(), AgentError> {
    let mut last_error = None;
    for attempt in 1..=attempts {
        match agent.connect_with_backoff(true).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "Connect sequence failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(AgentError::BackoffExhausted { attempts: 0 }))
}

async fn subscribe_configured(
    config: &AgentConfig,
    handle: &AgentHandle,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.subscriptions.is_empty() {
        return Ok(());
    }

    let mut subscriptions = Vec::with_capacity(config.subscriptions.len());
    for entry in &config.subscriptions {
        subscriptions.push(
            Subscription::new(entry.filter.as_str(), entry.qos()?).with_handler(
                |publish: &PublishInfo<'_>| {
                    info!(
                        topic = publish.topic,
                        qos = ?publish.qos,
                        payload = %String::from_utf8_lossy(publish.payload),
                        "Received publish"
                    );
                },
            ),
        );
    }

    let (info, done) = CommandInfo::with_notifier(COMMAND_BLOCK_TIME);
    handle.subscribe(subscriptions, info).await?;
    tokio::spawn(async move {
        match done.await {
            Ok(result) if result.is_success() => info!("Subscriptions granted"),
            Ok(result) => warn!(
                status = ?result.status,
                codes = ?result.suback_codes,
                "Some subscriptions were not granted"
            ),
            Err(_) => warn!("Subscribe request dropped before completion"),
        }
    });
    Ok(())
}

fn handle_config_command(config: &AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", config.to_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}

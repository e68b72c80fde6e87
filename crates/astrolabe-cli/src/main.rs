use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use astrolabe_core::{
    ChartData, ClientError, ClientEvent, Config, ConnectionState, InterpretationClient,
    InterpretationRequest, InterpretationType, ProcessingState, StaticToken,
};

mod render;

use render::DeltaPrinter;

#[derive(Parser)]
#[command(name = "astrolabe")]
#[command(about = "Stream AI astrology interpretations from the command line")]
struct Cli {
    /// Show connection details on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Backend origin (overrides config and ASTROLABE_BACKEND)
    #[arg(long, global = true)]
    origin: Option<String>,
    /// Bearer token (overrides config and ASTROLABE_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask for an interpretation and stream it to stdout
    Interpret {
        /// Your question
        query: String,
        /// Chart data JSON file (planets and house cusps)
        #[arg(short, long)]
        chart: Option<PathBuf>,
        /// Interpretation type: natal, transit, synastry, progression, solar_return, general
        #[arg(short = 't', long = "type")]
        interpretation_type: Option<String>,
    },
    /// Connect and report connection changes until Ctrl-C
    Watch,
    /// Show or change the saved configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Set a configuration value
    Set { key: String, value: String },
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load()?;
    if let Some(origin) = &cli.origin {
        config.backend_origin = origin.clone();
    }
    if let Some(token) = &cli.token {
        config.user_token = Some(token.clone());
    }

    match cli.command {
        Commands::Interpret {
            query,
            chart,
            interpretation_type,
        } => {
            let chart_data = match chart {
                Some(path) => load_chart(&path)?,
                None => ChartData::default(),
            };
            let interpretation_type = match interpretation_type {
                Some(name) => parse_type(&name)?,
                None => config.default_interpretation_type,
            };
            let request = InterpretationRequest::new(query)
                .with_chart(chart_data)
                .with_type(interpretation_type);
            interpret(&config, request).await?
        }
        Commands::Watch => watch(&config).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => show_config(&config)?,
            ConfigAction::Set { key, value } => set_config(&key, &value)?,
            ConfigAction::Path => println!("{}", Config::get_config_path()?.display()),
        },
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "astrolabe=debug,astrolabe_core=debug"
    } else {
        "astrolabe=info,astrolabe_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // stdout carries the interpretation text only
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_type(name: &str) -> Result<InterpretationType> {
    InterpretationType::from_str(name).ok_or_else(|| {
        let known: Vec<&str> = InterpretationType::all().iter().map(|t| t.as_str()).collect();
        anyhow!(
            "Unknown interpretation type '{}'. Expected one of: {}",
            name,
            known.join(", ")
        )
    })
}

fn load_chart(path: &Path) -> Result<ChartData> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read chart file {}", path.display()))?;
    let chart: ChartData = serde_json::from_str(&content)
        .with_context(|| format!("Chart file {} is not valid chart JSON", path.display()))?;
    Ok(chart)
}

fn start_client(config: &Config) -> Result<InterpretationClient> {
    let client_config = config.client_config()?;
    let client = InterpretationClient::websocket(
        client_config,
        StaticToken::new(config.user_token.clone()),
    )?;
    Ok(client)
}

async fn interpret(config: &Config, request: InterpretationRequest) -> Result<()> {
    if request.is_blank() {
        bail!("Please provide a question to interpret");
    }

    let client = start_client(config)?;
    let mut events = client.subscribe();
    client.connect()?;

    // Wait for the socket, riding out the reconnect schedule
    loop {
        match events.recv().await {
            Ok(ClientEvent::ConnectionChanged {
                to: ConnectionState::Connected,
                ..
            }) => break,
            Ok(ClientEvent::ReconnectScheduled { attempt, delay_ms }) => {
                warn!("Connection failed, retry {} in {} ms", attempt, delay_ms);
            }
            Ok(ClientEvent::ReconnectExhausted) => {
                let error = ClientError::Transport(format!(
                    "could not reach the interpretation service at {}",
                    config.backend_origin
                ));
                client.shutdown().await;
                return Err(error.into());
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("Interpretation client stopped unexpectedly"),
        }
    }

    info!("Connected, sending {} request", request.interpretation_type.as_str());
    client.submit(request).await?;

    let mut printer = DeltaPrinter::new();
    let mut stdout = std::io::stdout();
    let outcome = loop {
        let event = events.recv().await;
        printer.print(&client.snapshot().interpretation, &mut stdout)?;

        match event {
            Ok(event) => match request_outcome(&event) {
                Some(result) => break result,
                None => continue,
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!("Skipped {} events, output caught up from state", skipped);
                continue;
            }
            Err(RecvError::Closed) => break Err(ClientError::ClientClosed),
        }
    };

    writeln!(stdout)?;
    stdout.flush()?;
    client.shutdown().await;
    outcome.map_err(anyhow::Error::from)
}

/// Whether an event finishes a running request, and how
fn request_outcome(event: &ClientEvent) -> Option<Result<(), ClientError>> {
    match event {
        ClientEvent::ProcessingChanged {
            to: ProcessingState::Complete,
            ..
        } => Some(Ok(())),
        ClientEvent::ServerError(error) => Some(Err(ClientError::Server(error.clone()))),
        ClientEvent::ConnectionChanged {
            to: ConnectionState::Disconnected | ConnectionState::Error,
            ..
        } => Some(Err(ClientError::Transport(
            "connection lost before the interpretation completed".to_string(),
        ))),
        _ => None,
    }
}

async fn watch(config: &Config) -> Result<()> {
    let client = start_client(config)?;
    client.on_state_change(|change| {
        info!(
            "connection: {}, processing: {}",
            change.connection, change.processing
        );
    });
    let mut events = client.subscribe();
    client.connect()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Disconnecting");
                break;
            }
            event = events.recv() => match event {
                Ok(ClientEvent::SessionAssigned(session_id)) => info!("Session {}", session_id),
                Ok(ClientEvent::ReconnectScheduled { attempt, delay_ms }) => {
                    warn!("Reconnect attempt {} in {} ms", attempt, delay_ms);
                }
                Ok(ClientEvent::ReconnectExhausted) => {
                    warn!("Giving up on reconnecting");
                    break;
                }
                Ok(ClientEvent::ConnectionError(message)) => warn!("{}", message),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    if let Some(token) = &shown.user_token {
        shown.user_token = Some(mask_token(token));
    }
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

fn set_config(key: &str, value: &str) -> Result<()> {
    // Edit the file itself, not the environment-adjusted view
    let path = Config::get_config_path()?;
    let mut config = Config::load_from(&path)?;
    config.set(key, value).with_context(|| {
        format!("Valid keys: {}", Config::keys().join(", "))
    })?;
    config.save_to(&path)?;
    println!("Saved {} to {}", key, path.display());
    Ok(())
}

fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    if token.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}

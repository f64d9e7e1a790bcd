//! CLI for mqttd
//!
//! Subcommands:
//! - `serve`: run the broker
//! - `add-user`: create or update a user in the session store

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use mqttd::broker::Engine;
use mqttd::config::load_config;
use mqttd::persistence::{SessionStore, SledStore};
use mqttd::transport::start_tcp_server;
use mqttd::utils::logging;

#[derive(Parser)]
#[command(name = "mqttd", version, about = "An MQTT 3.1.1 broker")]
struct Cli {
    /// Configuration file layered over config/default and under MQTTD_* variables
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker
    Serve {
        /// Log every packet read and written
        #[arg(long)]
        debug: bool,
        /// TLS certificate (reserved, not used yet)
        #[arg(long, value_name = "PATH")]
        cert: Option<PathBuf>,
        /// TLS private key (reserved, not used yet)
        #[arg(long, value_name = "PATH")]
        key: Option<PathBuf>,
    },
    /// Create or update a user
    AddUser { username: String, password: String },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Command::Serve { debug, cert, key } => run_server(config, debug, cert, key).await,
        Command::AddUser { username, password } => add_user(config, &username, &password),
    };

    if let Err(e) = result {
        error!("{e}");
        eprintln!("mqttd: {e}");
        std::process::exit(1);
    }
}

async fn run_server(
    config: Option<&str>,
    debug: bool,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config(config)?;
    logging::init(if debug { "debug" } else { &settings.log.level });

    if cert.is_some() || key.is_some() {
        warn!("TLS is not supported yet; --cert and --key are ignored");
    }

    let store = SledStore::open(&settings.persistence.path)?;
    let engine = Engine::new(Box::new(store), settings.broker.clone());
    let (events, engine_task) = engine.start();

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;

    tokio::select! {
        _ = start_tcp_server(listener, events, settings) => {
            error!("TCP server exited unexpectedly.");
        }
        _ = engine_task => {
            error!("Engine exited unexpectedly.");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

fn add_user(
    config: Option<&str>,
    username: &str,
    password: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config(config)?;
    logging::init(&settings.log.level);

    let store = SledStore::open(&settings.persistence.path)?;
    store.save_user(username, password.as_bytes())?;
    info!("Saved user {username} to {}", settings.persistence.path);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

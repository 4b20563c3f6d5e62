//! zmtp-peer
//!
//! Small TCP peer that runs one stream engine per connection and prints what
//! it receives.

use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use zmtp_engine::config::{default_config_path, Config};
use zmtp_engine::zmtp_wire::{KeyPair, Msg};
use zmtp_engine::{
    ChannelSession, Driver, EngineOptions, MonitorEvent, SessionHandle, StreamEngine,
};

/// Inbound messages buffered per connection before reading pauses.
const SESSION_CAPACITY: usize = 1024;

/// Longest the reactor blocks before checking for new connections.
const TURN_TIMEOUT: Duration = Duration::from_millis(50);

/// ZMTP peer - listen for or connect to ZMTP endpoints over TCP.
#[derive(Parser, Debug)]
#[command(name = "zmtp-peer")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept connections and print received messages
    Listen {
        /// Address to bind, e.g. 127.0.0.1:5555
        addr: String,
    },

    /// Connect to a peer, send messages and print what comes back
    Connect {
        /// Address to connect to
        addr: String,

        /// Message to send after the handshake (repeatable)
        #[arg(long, short, value_name = "MSG")]
        send: Vec<String>,
    },

    /// Generate a CURVE key pair for the [curve] config section
    Keygen,
}

/// A connected stream on its way to the reactor thread.
type Connection = (TcpStream, ChannelSession, String);

/// Engines run on a dedicated blocking thread; connections are handed over
/// through a channel.
struct ReactorThread {
    connections: std_mpsc::Sender<Connection>,
    stop: Arc<AtomicBool>,
    join: JoinHandle<Result<()>>,
}

impl ReactorThread {
    fn spawn(options: EngineOptions) -> Self {
        let (connections, incoming) = std_mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let join = tokio::task::spawn_blocking(move || run_reactor(incoming, options, flag));
        Self {
            connections,
            stop,
            join,
        }
    }

    fn hand_over(&self, stream: TcpStream, session: ChannelSession, endpoint: String) -> Result<()> {
        self.connections
            .send((stream, session, endpoint))
            .map_err(|_| anyhow::anyhow!("reactor thread has stopped"))
    }

    async fn shutdown(self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.join.await.context("reactor thread panicked")?
    }
}

fn run_reactor(
    incoming: std_mpsc::Receiver<Connection>,
    options: EngineOptions,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let mut driver: Driver<TcpStream, ChannelSession> = Driver::new();

    while !stop.load(Ordering::Relaxed) {
        while let Ok((stream, session, endpoint)) = incoming.try_recv() {
            match StreamEngine::new(stream, session, options.clone(), endpoint.clone()) {
                Ok(engine) => {
                    if driver.attach(engine).is_none() {
                        warn!(endpoint = %endpoint, "connection closed during greeting");
                    }
                }
                Err(err) => error!(endpoint = %endpoint, error = %err, "failed to set up engine"),
            }
        }
        driver.turn(TURN_TIMEOUT)?;
    }

    info!(engines = driver.len(), "reactor stopping");
    driver.shutdown();
    Ok(())
}

/// Print everything a session receives until its engine goes away.
async fn print_session(mut handle: SessionHandle, endpoint: String) {
    let mut identity_seen = false;
    loop {
        tokio::select! {
            Some(msg) = handle.inbound.recv() => {
                let text = String::from_utf8_lossy(msg.data());
                if identity_seen {
                    println!("[{}] {}", endpoint, text);
                } else {
                    identity_seen = true;
                    info!(endpoint = %endpoint, identity = %text, "peer identity");
                }
            }
            Some(event) = handle.events.recv() => match event {
                MonitorEvent::HandshakeSucceeded { endpoint } => {
                    info!(endpoint = %endpoint, "connection established");
                }
                MonitorEvent::HandshakeFailed { endpoint, reason } => {
                    warn!(endpoint = %endpoint, reason = %reason, "handshake failed");
                }
                MonitorEvent::Disconnected { endpoint, fd } => {
                    info!(endpoint = %endpoint, fd, "disconnected");
                }
            },
            else => break,
        }
    }
}

async fn listen(addr: &str, options: EngineOptions) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let reactor = ReactorThread::spawn(options.clone());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let endpoint = format!("tcp://{}", peer);
                let (session, handle) = ChannelSession::new(SESSION_CAPACITY);
                reactor.hand_over(stream.into_std()?, session, endpoint.clone())?;
                tokio::spawn(print_session(handle, endpoint));
            }
        }
    }

    reactor.shutdown().await
}

async fn connect(addr: &str, options: EngineOptions, messages: Vec<String>) -> Result<()> {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?
        .into_std()?;
    let endpoint = format!("tcp://{}", stream.peer_addr()?);
    info!("Connected to {}", endpoint);

    let reactor = ReactorThread::spawn(options.clone());
    let (session, handle) = ChannelSession::new(SESSION_CAPACITY);
    for text in messages {
        handle
            .outbound
            .send(Msg::new(text.into_bytes()))
            .map_err(|_| anyhow::anyhow!("session closed"))?;
    }
    reactor.hand_over(stream, session, endpoint.clone())?;

    let printer = tokio::spawn(print_session(handle, endpoint));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = printer => {}
    }

    reactor.shutdown().await
}

fn keygen() -> Result<()> {
    let keys = KeyPair::generate();
    println!("[curve]");
    println!("public_key = \"{}\"", hex::encode(keys.public.as_bytes()));
    println!("secret_key = \"{}\"", hex::encode(keys.secret.to_bytes()));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Keygen = cli.command {
        return keygen();
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides()?;
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::debug!("Configuration loaded from {:?}", config_path);

    let options = config.engine_options()?;
    info!(
        socket_type = %options.socket_type,
        curve = options.curve.is_some(),
        "zmtp-peer starting"
    );

    match cli.command {
        Commands::Listen { addr } => listen(&addr, options).await,
        Commands::Connect { addr, send } => connect(&addr, options, send).await,
        Commands::Keygen => keygen(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_listen() {
        let cli = Cli::parse_from(["zmtp-peer", "listen", "127.0.0.1:5555"]);
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Commands::Listen { addr } if addr == "127.0.0.1:5555"));
    }

    #[test]
    fn test_cli_parses_connect_with_messages() {
        let cli = Cli::parse_from([
            "zmtp-peer",
            "--verbose",
            "connect",
            "127.0.0.1:5555",
            "--send",
            "hello",
            "-s",
            "world",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Connect { addr, send } => {
                assert_eq!(addr, "127.0.0.1:5555");
                assert_eq!(send, vec!["hello", "world"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_global_config_flag() {
        let cli = Cli::parse_from(["zmtp-peer", "keygen", "--config", "/tmp/zmtp.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/zmtp.toml")));
        assert!(matches!(cli.command, Commands::Keygen));
    }
}

//! passerd-rs — a protocol-translation daemon that makes a microblog
//! account's timelines, mentions, and direct messages reachable through
//! a standard IRC client.
//!
//! `main.rs` is deliberately thin: load configuration, install tracing,
//! open the sqlite store (running migrations), bind the listener, and
//! spawn one task per accepted connection plus the signal-driven
//! shutdown watcher. Everything that matters — registration,
//! authentication, channel semantics, feed polling — lives in the
//! library modules below and is exercised by their own test suites.

mod api;
mod auth;
mod callbacks;
mod channel;
mod config;
mod db;
mod dialog;
mod error;
mod feed;
mod html;
mod identity;
mod irc;
mod remote;
mod scheduler;
mod session;
mod text;
mod throttle;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use crate::config::{Config, LoggingConfig};
use crate::db::Database;
use crate::identity::IdentityCache;
use crate::irc::{IrcCodec, Message};
use crate::remote::{UnconfiguredAuthProbe, UnconfiguredDelegatedAuth, UnconfiguredRemoteFactory};
use crate::session::{Session, SessionSignal, Transport};

/// Process-wide diagnostics the `!gc` channel command reports (`spec.md`
/// §9's supplemented command): connections accepted so far stand in for
/// the original's task count, since this crate has no manual GC to run.
static START_TIME: OnceLock<Instant> = OnceLock::new();
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn uptime() -> std::time::Duration {
    START_TIME.get_or_init(Instant::now).elapsed()
}

pub(crate) fn active_connections() -> usize {
    ACTIVE_CONNECTIONS.load(Ordering::Relaxed)
}

/// A single optional CLI argument names the config path; falls back to
/// `config.toml` in the working directory, matching the teacher's
/// `resolve_config_path` convention minus the `-c`/`--config` flags this
/// crate's smaller surface doesn't need.
fn resolve_config_path() -> String {
    std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string())
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(Config::load(path)?),
        Err(_) => {
            eprintln!("no config file at {path}, starting with built-in defaults");
            Ok(Config::default())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.clone()));

    if logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
    }
}

/// The outbound half of a client socket, written through the
/// [`Transport`] seam `session.rs` dispatches against instead of holding
/// a concrete stream type directly.
struct SocketTransport {
    sink: AsyncMutex<SplitSink<Framed<TcpStream, IrcCodec>, Message>>,
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    async fn send(&self, msg: Message) -> crate::error::Result<()> {
        self.sink.lock().await.send(msg).await
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    db: Arc<Database>,
    identity: Arc<IdentityCache<Database>>,
    config: Arc<Config>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let _ = stream.set_nodelay(true);
    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    let framed = Framed::new(stream, IrcCodec::new());
    let (sink, mut stream) = framed.split();
    let transport = Arc::new(SocketTransport { sink: AsyncMutex::new(sink) });

    let session = Session::new(
        config.server.name.clone(),
        config.server.network.clone(),
        config.server.motd.load_lines(),
        config.limits.clone(),
        transport,
        db,
        Arc::new(UnconfiguredRemoteFactory),
        Arc::new(UnconfiguredAuthProbe),
        Arc::new(UnconfiguredDelegatedAuth),
        identity.clone(),
        identity,
    );

    info!(peer = %peer, "client connected");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!(peer = %peer, "server shutting down, closing connection");
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(msg)) => {
                        if session.dispatch(msg).await == SessionSignal::Disconnect {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(peer = %peer, error = %e, "connection error, closing");
                        break;
                    }
                    None => {
                        info!(peer = %peer, "client closed connection");
                        break;
                    }
                }
            }
        }
    }

    session.on_disconnect().await;
    ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    START_TIME.get_or_init(Instant::now);
    let config_path = resolve_config_path();
    let config = load_config(&config_path)?;

    init_tracing(&config.logging);

    info!(
        bind = %config.server.bind,
        server = %config.server.name,
        network = %config.server.network,
        "starting passerd"
    );

    let db = Arc::new(Database::connect(&config.database.path, config.database.max_connections).await?);
    info!(path = %config.database.path, "database ready");

    let identity = Arc::new(IdentityCache::new(db.clone()));
    let config = Arc::new(config);

    let listener = TcpListener::bind(config.server.bind.as_str()).await?;
    info!(bind = %config.server.bind, "listening for IRC connections");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, shutting down");
                let _ = shutdown_tx.send(());
            }
        });
    }

    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };
                let db = db.clone();
                let identity = identity.clone();
                let config = config.clone();
                let conn_shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    handle_connection(stream, peer, db, identity, config, conn_shutdown).await;
                });
            }
        }
    }

    info!("passerd stopped");
    Ok(())
}

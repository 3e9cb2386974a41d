//! Notify CLI - 实时同步命令行入口

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use notify_socket::{
    MemoryCache, MemoryCredentials, ServiceCache, SessionConfig, SessionNotice, TlsConfig,
};
use notify_sync::{BackoffConfig, ExponentialBackoff, SyncExit, SyncService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Notify realtime client
#[derive(Parser, Debug)]
#[command(name = "notify")]
#[command(version, about = "Keeps a local service cache in sync with the notification server")]
struct Args {
    /// Server WebSocket URL (defaults to NOTIFY_SERVER_* environment variables)
    #[arg(short, long)]
    server: Option<String>,

    /// Access token (falls back to NOTIFY_ACCESS_TOKEN)
    #[arg(short, long)]
    token: Option<String>,

    /// Session ID to resume on first connect (printed when a previous run stops with Ctrl+C)
    #[arg(long)]
    session_id: Option<String>,

    /// Persist the service cache to this JSON file
    #[arg(long)]
    cache_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// CA certificate path for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate path for mTLS
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Client key path for mTLS (not needed for P12)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// P12 password (for PKCS#12 format client cert)
    #[arg(long)]
    p12_password: Option<String>,

    /// Skip TLS certificate verification (DEVELOPMENT ONLY)
    #[arg(long, default_value = "false")]
    insecure: bool,

    /// Seconds to wait for the server's ready event
    #[arg(long, default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Give up after this many reconnect attempts (unlimited if unset)
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow!(e))?;

    info!("Starting notify client...");

    let Some(token) = args
        .token
        .or_else(|| std::env::var("NOTIFY_ACCESS_TOKEN").ok())
    else {
        bail!("No access token: pass --token or set NOTIFY_ACCESS_TOKEN");
    };
    let credentials = Arc::new(match args.session_id {
        Some(session_id) => MemoryCredentials::with_session(token, session_id),
        None => MemoryCredentials::new(token),
    });

    let cache = match &args.cache_file {
        Some(path) => MemoryCache::open(path)?,
        None => MemoryCache::new(),
    };

    // 构建连接配置
    let defaults = SessionConfig::default();
    let config = SessionConfig {
        url: args.server.unwrap_or_else(|| defaults.url.clone()),
        tls: TlsConfig {
            ca_cert_path: args.ca_cert,
            client_cert_path: args.client_cert,
            client_key_path: args.client_key,
            client_p12_password: args.p12_password,
            danger_accept_invalid_certs: args.insecure,
        },
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
        ..defaults
    };
    info!("Server: {}", config.url);

    let policy = ExponentialBackoff::new(BackoffConfig {
        max_attempts: args.max_reconnect_attempts,
        ..BackoffConfig::default()
    });
    let mut service = SyncService::start(config, credentials.clone(), cache, policy);

    // 后台打印缓存变化和会话通知
    let mut changes = service.cache().subscribe();
    let mut notices = service.session().subscribe();
    let monitor = tokio::spawn(async move {
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => info!(
                        "Service {} {:?} ({:?}), unread total {}",
                        change.key, change.kind, change.origin, change.unread_total
                    ),
                    Err(RecvError::Lagged(n)) => warn!("Missed {} cache changes", n),
                    Err(RecvError::Closed) => break,
                },
                notice = notices.recv() => match notice {
                    Ok(SessionNotice::Status(change)) => debug!("Status: {:?}", change.new),
                    Ok(SessionNotice::ServerError(payload)) => {
                        warn!("Server error: {} ({})", payload.message, payload.verbose)
                    }
                    Ok(SessionNotice::AuthenticationRequired(code)) => {
                        warn!("Authentication required: {}", code)
                    }
                    Ok(SessionNotice::Replayed { count }) => info!("Replayed {} missed events", count),
                    Err(RecvError::Lagged(n)) => warn!("Missed {} session notices", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    // 创建 shutdown 信号
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut runner = tokio::spawn(async move {
        let exit = service.run(shutdown_rx).await;
        (service, exit)
    });

    // 等待 Ctrl+C 或同步自行结束
    info!("Notify client running. Press Ctrl+C to stop.");
    let finished = tokio::select! {
        joined = &mut runner => Some(joined?),
        result = signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C, shutting down...");
            // 断开会清掉会话 ID，先打印出来
            if let Some(hint) = resume_hint(&credentials) {
                info!("Resume this session with {}", hint);
            }
            let _ = shutdown_tx.send(true);
            None
        }
    };
    let (service, exit) = match finished {
        Some(done) => done,
        None => match tokio::time::timeout(SHUTDOWN_TIMEOUT, runner).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!("Sync service did not stop within {:?}", SHUTDOWN_TIMEOUT);
                monitor.abort();
                return Ok(());
            }
        },
    };
    monitor.abort();
    let exit = exit?;

    // 停止服务，落盘缓存
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, service.shutdown()).await {
        Ok(Ok(cache)) => {
            if let Err(e) = cache.flush() {
                warn!("Failed to save cache: {:#}", e);
            }
            info!(
                "Cache closed with {} services, {} unread",
                cache.len(),
                cache.current_unread_count()
            );
        }
        Ok(Err(e)) => warn!("Failed to stop sync service: {:?}", e),
        Err(_) => warn!("Cache did not drain within {:?}", SHUTDOWN_TIMEOUT),
    }

    match exit {
        SyncExit::Shutdown => {
            info!("Notify client stopped");
            Ok(())
        }
        SyncExit::AuthenticationRequired(code) => {
            bail!("Access token rejected ({}), log in again", code)
        }
        SyncExit::Disconnected(context) => bail!("Gave up reconnecting: {:?}", context),
    }
}

/// 下次启动时恢复当前会话所需的参数
fn resume_hint(credentials: &MemoryCredentials) -> Option<String> {
    credentials
        .session_id()
        .map(|session_id| format!("--session-id {session_id}"))
}

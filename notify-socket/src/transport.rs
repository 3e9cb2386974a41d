//! 传输层
//!
//! 把物理连接包装成一对 channel：控制器从 `inbound` 读事件，往 `outbound` 写帧。
//! 丢掉 `TransportLink` 就等于注销所有回调，底层任务随之退出。

use crate::config::{SessionConfig, TlsConfig};
use crate::error::SocketError;
use crate::status::Headers;
use futures::{SinkExt, StreamExt};
use native_tls::{Certificate, Identity, TlsConnector};
use std::fs;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector as StreamConnector};
use tracing::{debug, info, warn};

/// 传输层上报给控制器的事件
#[derive(Debug)]
pub enum TransportEvent {
    /// 握手完成
    Opened { headers: Headers },
    /// 一条文本消息
    Message(String),
    /// 对端带关闭码断开
    Closed { code: u16, reason: String },
    /// 没有关闭码的断开（网络错误、读失败、流结束）
    Failed(Option<SocketError>),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Failed(_))
    }
}

/// 控制器发给传输层的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// 控制器持有的一端
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// 传输实现持有的另一端
#[derive(Debug)]
pub struct TransportPeer {
    pub events: mpsc::Sender<TransportEvent>,
    pub outbound: mpsc::Receiver<Outbound>,
}

impl TransportLink {
    pub fn pair(outbound_buffer: usize) -> (TransportLink, TransportPeer) {
        let (out_tx, out_rx) = mpsc::channel(outbound_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(256);
        (
            TransportLink {
                outbound: out_tx,
                inbound: event_rx,
            },
            TransportPeer {
                events: event_tx,
                outbound: out_rx,
            },
        )
    }
}

/// 打开物理连接
///
/// `open` 立即返回，连接结果通过 `TransportEvent::Opened` / `Failed` 异步送达。
pub trait Connector: Send + Sync + 'static {
    fn open(&self, config: &SessionConfig) -> TransportLink;
}

/// 基于 tokio-tungstenite 的 WebSocket 连接器
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, config: &SessionConfig) -> TransportLink {
        let (link, peer) = TransportLink::pair(config.outbound_buffer);
        tokio::spawn(run_socket(config.url.clone(), config.tls.clone(), peer));
        link
    }
}

async fn run_socket(url: String, tls: TlsConfig, mut peer: TransportPeer) {
    let connector = match build_tls_connector(&tls) {
        Ok(connector) => connector.map(StreamConnector::NativeTls),
        Err(e) => {
            let _ = peer.events.send(TransportEvent::Failed(Some(e))).await;
            return;
        }
    };

    info!("[Transport] Connecting to {}", url);
    let connecting = connect_async_tls_with_config(url.as_str(), None, false, connector);
    let result = tokio::select! {
        result = connecting => result,
        _ = peer.events.closed() => {
            debug!("[Transport] Link dropped while connecting");
            return;
        }
    };

    let (stream, response) = match result {
        Ok(ok) => ok,
        Err(tungstenite::Error::Url(e)) => {
            let _ = peer
                .events
                .send(TransportEvent::Failed(Some(SocketError::InvalidUrl(e.to_string()))))
                .await;
            return;
        }
        Err(e) => {
            warn!("[Transport] Connect failed: {}", e);
            let _ = peer
                .events
                .send(TransportEvent::Failed(Some(SocketError::ConnectionFailed(e.to_string()))))
                .await;
            return;
        }
    };

    let headers: Headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    info!("[Transport] Socket opened");
    if peer.events.send(TransportEvent::Opened { headers }).await.is_err() {
        return;
    }

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            frame = read.next() => {
                let event = match frame {
                    Some(Ok(Message::Text(text))) => TransportEvent::Message(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            debug!("[Transport] Dropping non UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(Some(frame)))) => TransportEvent::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.as_str().to_owned(),
                    },
                    Some(Ok(Message::Close(None))) => TransportEvent::Failed(Some(
                        SocketError::Transport("closed without status code".into()),
                    )),
                    // ping/pong 由 tungstenite 自己应答
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => TransportEvent::Failed(Some(SocketError::Transport(e.to_string()))),
                    None => TransportEvent::Failed(None),
                };
                let terminal = event.is_terminal();
                if peer.events.send(event).await.is_err() || terminal {
                    break;
                }
            }
            outbound = peer.outbound.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        let _ = peer
                            .events
                            .send(TransportEvent::Failed(Some(SocketError::EmitFailed(e.to_string()))))
                            .await;
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.close().await;
                    debug!("[Transport] Socket closed by client");
                    break;
                }
            }
        }
    }
}

/// 构建 TLS 连接器（支持 mTLS）
///
/// 全部默认时返回 None，由 tungstenite 使用系统根证书。
pub fn build_tls_connector(tls: &TlsConfig) -> Result<Option<TlsConnector>, SocketError> {
    if tls.is_default() {
        return Ok(None);
    }
    let mut builder = TlsConnector::builder();
    if let Some(path) = &tls.ca_cert_path {
        let pem = read_pem(path, "CA cert")?;
        let root = Certificate::from_pem(&pem).map_err(tls_error("parse CA cert"))?;
        builder.add_root_certificate(root);
    }
    if let Some(path) = &tls.client_cert_path {
        builder.identity(load_identity(tls, path)?);
    }
    if tls.danger_accept_invalid_certs {
        warn!("[Transport] Accepting invalid server certificates");
        builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .map(Some)
        .map_err(tls_error("build TLS connector"))
}

/// `.p12` / `.pfx` 按 PKCS#12 读取，其余按 PEM 证书 + PKCS#8 私钥
fn load_identity(tls: &TlsConfig, cert_path: &Path) -> Result<Identity, SocketError> {
    let cert = read_pem(cert_path, "client cert")?;
    let pkcs12 = matches!(
        cert_path.extension().and_then(|ext| ext.to_str()),
        Some("p12" | "pfx")
    );
    if pkcs12 {
        let password = tls.client_p12_password.as_deref().unwrap_or_default();
        return Identity::from_pkcs12(&cert, password).map_err(tls_error("parse PKCS#12 identity"));
    }
    let Some(key_path) = &tls.client_key_path else {
        return Err(SocketError::TlsError("PEM client cert needs a client key path".into()));
    };
    let key = read_pem(key_path, "client key")?;
    Identity::from_pkcs8(&cert, &key).map_err(tls_error("load PEM identity"))
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>, SocketError> {
    debug!("[Transport] Reading {} from {}", what, path.display());
    fs::read(path).map_err(|e| {
        SocketError::TlsError(format!("cannot read {what} {}: {e}", path.display()))
    })
}

fn tls_error<E: std::fmt::Display>(action: &'static str) -> impl FnOnce(E) -> SocketError {
    move |e| SocketError::TlsError(format!("failed to {action}: {e}"))
}

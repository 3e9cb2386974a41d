//! Socket 错误定义

use crate::protocol::EventType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Emit failed: {0}")]
    EmitFailed(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("No access token available")]
    MissingAccessToken,

    #[error("Session controller has shut down")]
    ControllerClosed,

    #[error("Local cache has shut down")]
    CacheClosed,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("TLS error: {0}")]
    TlsError(String),
}

/// 入站消息解码错误
///
/// 单条消息解码失败不会断开连接，由控制器记录日志后跳过。
#[derive(Error, Debug)]
pub enum DecodeError {
    /// 不是 `{"event": ..., "d": ...}` 结构
    #[error("invalid event envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    /// 服务端新增的事件类型，旧客户端忽略即可
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// `d` 是合法数据，但属于另一种事件
    #[error("payload for `{declared}` has the shape of `{detected}`")]
    MismatchedDataAndEvent {
        declared: EventType,
        detected: EventType,
    },

    #[error("malformed `{event}` payload: {source}")]
    MalformedPayload {
        event: EventType,
        #[source]
        source: serde_json::Error,
    },
}

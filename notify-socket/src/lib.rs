//! 实时服务事件通道客户端
//!
//! 通过 WebSocket 与通知服务保持长连接：鉴权、心跳、断线恢复，
//! 并把服务变更事件按顺序合并进本地缓存

mod cache;
mod config;
mod controller;
mod credentials;
mod dispatcher;
mod error;
mod heartbeat;
mod protocol;
mod status;
mod transport;

#[cfg(test)]
mod testutil;

pub use cache::{
    CacheChange, CacheHandle, CacheWorker, ChangeKind, MemoryCache, ServiceCache, ServiceRecord,
};
pub use config::{SessionConfig, TlsConfig, DEFAULT_HANDSHAKE_TIMEOUT};
pub use controller::{SessionController, SessionHandle, SessionNotice};
pub use credentials::{Credentials, MemoryCredentials};
pub use dispatcher::{DispatchBatch, DispatchOrigin, EventDispatcher};
pub use error::{DecodeError, SocketError};
pub use heartbeat::HeartbeatScheduler;
pub use protocol::{
    // 上行
    Operation, OperationPayload, OperationType,
    // 下行
    decode_event, EventType, ReadyPayload, ErrorPayload, ServerEvent,
    Service, ServiceEvent, ServiceKey,
    // 关闭码
    ErrorCode,
};
pub use status::{ConnectionStatus, DisconnectContext, Headers, StatusCell, StatusChange};
pub use transport::{
    build_tls_connector, Connector, Outbound, TransportEvent, TransportLink, TransportPeer,
    WsConnector,
};

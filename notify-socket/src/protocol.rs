//! 实时通道线协议
//!
//! 上行是带整数 `op` 的操作包，下行是带字符串 `event` 的事件包，
//! 负载统一放在 `d` 字段。

use crate::error::{DecodeError, SocketError};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

// ==================== 上行操作 (Client → Server) ====================

/// 操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Heartbeat = 0,
    Identify = 1,
    IdentifyReconnect = 2,
}

impl OperationType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OperationType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Heartbeat),
            1 => Ok(Self::Identify),
            2 => Ok(Self::IdentifyReconnect),
            other => Err(other),
        }
    }
}

impl Serialize for OperationType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for OperationType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::try_from(code).map_err(|c| D::Error::custom(format!("unknown operation code {c}")))
    }
}

/// 操作负载
///
/// 反序列化时 `Reconnect` 必须排在前面，否则带 sessionID 的包会被当成 `Connect`。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationPayload {
    Reconnect {
        #[serde(rename = "accessToken")]
        access_token: String,
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    Connect {
        #[serde(rename = "accessToken")]
        access_token: String,
    },
}

// 令牌不进日志
impl fmt::Debug for OperationPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnect { session_id, .. } => f
                .debug_struct("Reconnect")
                .field("access_token", &"<redacted>")
                .field("session_id", session_id)
                .finish(),
            Self::Connect { .. } => f
                .debug_struct("Connect")
                .field("access_token", &"<redacted>")
                .finish(),
        }
    }
}

/// 上行操作包 `{"op": <int>, "d": <payload>}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OperationType,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OperationPayload>,
}

impl Operation {
    /// 新会话鉴权
    pub fn identify(access_token: impl Into<String>) -> Self {
        Self {
            op: OperationType::Identify,
            data: Some(OperationPayload::Connect {
                access_token: access_token.into(),
            }),
        }
    }

    /// 带旧会话 ID 的恢复鉴权，成功后服务端会补发断线期间的事件
    pub fn identify_reconnect(access_token: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            op: OperationType::IdentifyReconnect,
            data: Some(OperationPayload::Reconnect {
                access_token: access_token.into(),
                session_id: session_id.into(),
            }),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            op: OperationType::Heartbeat,
            data: None,
        }
    }

    /// 编码成文本帧
    pub fn encode(&self) -> Result<String, SocketError> {
        serde_json::to_string(self).map_err(|e| SocketError::SerializationError(e.to_string()))
    }
}

// ==================== 下行事件 (Server → Client) ====================

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Ready,
    ServiceEvent,
    Replay,
    Error,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Ready,
        EventType::ServiceEvent,
        EventType::Replay,
        EventType::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::ServiceEvent => "serviceEvent",
            Self::Replay => "replay",
            Self::Error => "error",
        }
    }

    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 鉴权成功
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// 心跳间隔（秒）
    #[serde(rename = "pingInterval")]
    pub ping_interval: f64,
}

impl ReadyPayload {
    /// 非正数、非有限值或溢出时返回 None，表示不发心跳
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        if !self.ping_interval.is_finite() || self.ping_interval <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.ping_interval)
            .ok()
            .filter(|d| !d.is_zero())
    }
}

/// 服务端上报的应用错误，仅提示，不关闭连接
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub verbose: String,
}

/// 服务的身份标识，本地缓存按它合并
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceKey(pub String);

impl ServiceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 一个被追踪的服务（通知来源）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub unread_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// 客户端不认识的字段原样保留
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey(self.id.clone())
    }
}

/// 服务变更指令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServiceEvent {
    ServiceCreated {
        service: Service,
    },
    ServiceUpdated {
        service: Service,
    },
    ServiceDeleted {
        #[serde(rename = "serviceID")]
        service_id: ServiceKey,
    },
    /// 未读数是绝对值而不是增量，重复应用结果不变
    UnreadCountChanged {
        #[serde(rename = "serviceID")]
        service_id: ServiceKey,
        #[serde(rename = "unreadCount")]
        unread_count: i64,
    },
}

impl ServiceEvent {
    pub fn service_key(&self) -> ServiceKey {
        match self {
            Self::ServiceCreated { service } | Self::ServiceUpdated { service } => service.key(),
            Self::ServiceDeleted { service_id } | Self::UnreadCountChanged { service_id, .. } => {
                service_id.clone()
            }
        }
    }
}

/// Server 发送给 Client 的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "d", rename_all = "camelCase")]
pub enum ServerEvent {
    Ready(ReadyPayload),
    #[serde(rename = "serviceEvent")]
    Service(ServiceEvent),
    Replay(Vec<ServiceEvent>),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Ready(_) => EventType::Ready,
            Self::Service(_) => EventType::ServiceEvent,
            Self::Replay(_) => EventType::Replay,
            Self::Error(_) => EventType::Error,
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(rename = "d", default)]
    data: Value,
}

/// 解码一条下行消息
///
/// 先读 `event` 标签，再按标签解析 `d`。`d` 对不上声明的类型时，
/// 用其余类型逐个试解析，以区分“发错了类型”和“数据本身坏了”。
pub fn decode_event(text: &str) -> Result<ServerEvent, DecodeError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(DecodeError::InvalidEnvelope)?;
    let declared = EventType::from_wire(&raw.event)
        .ok_or_else(|| DecodeError::UnknownEventType(raw.event.clone()))?;

    match parse_payload(declared, &raw.data) {
        Ok(event) => Ok(event),
        Err(source) => {
            let detected = EventType::ALL
                .into_iter()
                .filter(|t| *t != declared)
                .find(|t| parse_payload(*t, &raw.data).is_ok());
            match detected {
                Some(detected) => Err(DecodeError::MismatchedDataAndEvent { declared, detected }),
                None => Err(DecodeError::MalformedPayload {
                    event: declared,
                    source,
                }),
            }
        }
    }
}

fn parse_payload(event: EventType, data: &Value) -> Result<ServerEvent, serde_json::Error> {
    match event {
        EventType::Ready => ReadyPayload::deserialize(data).map(ServerEvent::Ready),
        EventType::ServiceEvent => ServiceEvent::deserialize(data).map(ServerEvent::Service),
        EventType::Replay => Vec::<ServiceEvent>::deserialize(data).map(ServerEvent::Replay),
        EventType::Error => ErrorPayload::deserialize(data).map(ServerEvent::Error),
    }
}

// ==================== 关闭码 ====================

/// 服务端关闭连接时携带的错误码，未知整数一律落到 `Unknown`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoInternetConnection,
    InvalidFormat,
    InvalidAccessToken,
    ExpiredSessionId,
    Unknown,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            Self::NoInternetConnection => 1,
            Self::InvalidFormat => 1000,
            Self::InvalidAccessToken => 1001,
            Self::ExpiredSessionId => 1002,
            Self::Unknown => -1,
        }
    }

    /// 凭证失效，用同样的凭证重试必然同样失败
    pub fn requires_reauthentication(self) -> bool {
        matches!(self, Self::InvalidAccessToken | Self::ExpiredSessionId)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unknown | Self::NoInternetConnection)
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            1 => Self::NoInternetConnection,
            1000 => Self::InvalidFormat,
            1001 => Self::InvalidAccessToken,
            1002 => Self::ExpiredSessionId,
            _ => Self::Unknown,
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        Self::from(i64::from(code))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoInternetConnection => "noInternetConnection",
            Self::InvalidFormat => "invalidFormat",
            Self::InvalidAccessToken => "invalidAccessToken",
            Self::ExpiredSessionId => "expiredSessionID",
            Self::Unknown => "unknown",
        };
        write!(f, "{}({})", name, self.code())
    }
}

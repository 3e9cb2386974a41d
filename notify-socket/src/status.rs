//! 连接状态模型

use crate::error::SocketError;
use crate::protocol::ErrorCode;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// 握手响应头
pub type Headers = BTreeMap<String, String>;

/// 断开的原因
#[derive(Debug, Clone)]
pub enum DisconnectContext {
    /// 还没尝试过连接，或者被主动断开
    Initial,
    /// 传输层错误（没有关闭帧）
    Error(Option<Arc<SocketError>>),
    /// 服务端带关闭码断开
    Disconnect { reason: String, code: ErrorCode },
}

impl DisconnectContext {
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::Disconnect { code, .. } if code.requires_reauthentication())
    }

    /// 网络错误和未知关闭码可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Initial => false,
            Self::Error(_) => true,
            Self::Disconnect { code, .. } => code.is_retryable(),
        }
    }
}

// `Error` 只比较“有没有原因”，两边都带原因即视为相等。
// 上层用它给弹窗去重，改成严格比较会改变去重行为。
impl PartialEq for DisconnectContext {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Initial, Self::Initial) => true,
            (Self::Error(a), Self::Error(b)) => a.is_some() == b.is_some(),
            (
                Self::Disconnect { reason: r1, code: c1 },
                Self::Disconnect { reason: r2, code: c2 },
            ) => r1 == r2 && c1 == c2,
            _ => false,
        }
    }
}

/// 连接状态，同一时刻只有一个
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Disconnected(DisconnectContext),
    Connecting,
    Connected { headers: Headers },
    Authorized { session_id: String },
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected(DisconnectContext::Initial)
    }
}

impl ConnectionStatus {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized { .. })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Authorized { session_id } => Some(session_id),
            _ => None,
        }
    }

    /// 一次连接尝试内状态只能往前走：
    /// Disconnected → Connecting → Connected → Authorized，任何状态都可以回到 Disconnected
    pub fn can_transition_to(&self, next: &ConnectionStatus) -> bool {
        match (self, next) {
            (_, Self::Disconnected(_)) => true,
            (Self::Disconnected(_), Self::Connecting) => true,
            (Self::Connecting, Self::Connected { .. }) => true,
            (Self::Connected { .. }, Self::Authorized { .. }) => true,
            _ => false,
        }
    }
}

/// 一次状态变化
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub old: ConnectionStatus,
    pub new: ConnectionStatus,
}

/// 状态持有者
///
/// 写入和取旧值在同一次 `send_replace` 里完成，观察者不会看到半截状态。
#[derive(Debug)]
pub struct StatusCell {
    tx: watch::Sender<ConnectionStatus>,
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::default());
        Self { tx }
    }

    pub fn current(&self) -> ConnectionStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    pub fn replace(&self, new: ConnectionStatus) -> StatusChange {
        let old = self.tx.send_replace(new.clone());
        StatusChange { old, new }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

//! 凭证与会话协作方
//!
//! 连接时提供访问令牌和可恢复的会话 ID，会话变化和认证失效时被通知。

use crate::protocol::ErrorCode;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

pub trait Credentials: Send + Sync + 'static {
    /// 当前访问令牌
    fn access_token(&self) -> Option<String>;

    /// 之前授权过、可以尝试恢复的会话 ID（例如进程重启前保存的）
    fn resumable_session(&self) -> Option<String> {
        None
    }

    /// 会话建立（Some）或被丢弃（None）
    fn session_changed(&self, _session_id: Option<&str>) {}

    /// 服务端拒绝了当前凭证，需要重新登录
    fn authentication_required(&self, _code: ErrorCode) {}
}

#[derive(Debug, Default)]
struct CredentialState {
    access_token: Option<String>,
    session_id: Option<String>,
    auth_failure: Option<ErrorCode>,
}

/// 进程内凭证存储
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentials {
    state: Arc<RwLock<CredentialState>>,
}

impl MemoryCredentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        let creds = Self::default();
        creds.set_access_token(access_token);
        creds
    }

    /// 带上次保存的会话 ID，首次连接即走恢复流程
    pub fn with_session(access_token: impl Into<String>, session_id: impl Into<String>) -> Self {
        let creds = Self::new(access_token);
        creds.write().session_id = Some(session_id.into());
        creds
    }

    /// 换令牌（重新登录），同时清除认证失败标记
    pub fn set_access_token(&self, access_token: impl Into<String>) {
        let mut state = self.write();
        state.access_token = Some(access_token.into());
        state.auth_failure = None;
    }

    /// 登出，令牌和会话一起清掉
    pub fn clear(&self) {
        *self.write() = CredentialState::default();
    }

    pub fn session_id(&self) -> Option<String> {
        self.read().session_id.clone()
    }

    /// 最近一次认证失败的错误码，换令牌后清空
    pub fn needs_authentication(&self) -> Option<ErrorCode> {
        self.read().auth_failure
    }

    fn read(&self) -> RwLockReadGuard<'_, CredentialState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CredentialState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Credentials for MemoryCredentials {
    fn access_token(&self) -> Option<String> {
        self.read().access_token.clone()
    }

    fn resumable_session(&self) -> Option<String> {
        self.session_id()
    }

    fn session_changed(&self, session_id: Option<&str>) {
        self.write().session_id = session_id.map(str::to_string);
    }

    fn authentication_required(&self, code: ErrorCode) {
        info!("[Credentials] Authentication required ({})", code);
        let mut state = self.write();
        state.session_id = None;
        state.auth_failure = Some(code);
    }
}

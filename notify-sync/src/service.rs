//! 同步服务
//!
//! 把凭证、缓存任务和会话控制器组装在一起，按重连策略保持连接。

use crate::reconnect::ReconnectPolicy;
use anyhow::Result;
use notify_socket::{
    CacheHandle, CacheWorker, ConnectionStatus, Connector, Credentials, DisconnectContext,
    ErrorCode, ServiceCache, SessionConfig, SessionController, SessionHandle, SessionNotice,
    SocketError, WsConnector,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{info, warn};

/// `run` 结束的原因
#[derive(Debug, Clone, PartialEq)]
pub enum SyncExit {
    /// 收到关闭信号
    Shutdown,
    /// 凭证被拒绝，需要重新登录
    AuthenticationRequired(ErrorCode),
    /// 策略放弃重连
    Disconnected(DisconnectContext),
}

pub struct SyncService<C: ServiceCache> {
    session: SessionHandle,
    cache: CacheHandle<C>,
    worker: JoinHandle<C>,
    policy: Box<dyn ReconnectPolicy>,
}

impl<C: ServiceCache> SyncService<C> {
    /// 使用 WebSocket 连接器启动
    pub fn start(
        config: SessionConfig,
        credentials: Arc<dyn Credentials>,
        cache: C,
        policy: impl ReconnectPolicy,
    ) -> Self {
        Self::with_connector(config, Arc::new(WsConnector), credentials, cache, policy)
    }

    pub fn with_connector(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn Credentials>,
        cache: C,
        policy: impl ReconnectPolicy,
    ) -> Self {
        let (dispatcher, cache, worker) = CacheWorker::spawn(cache);
        let session = SessionController::spawn(config, connector, credentials, dispatcher);
        info!("[SyncService] Started");
        Self {
            session,
            cache,
            worker,
            policy: Box::new(policy),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn cache(&self) -> &CacheHandle<C> {
        &self.cache
    }

    /// 连接并保持，直到 `shutdown` 变为 true、凭证失效或策略放弃
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<SyncExit> {
        if *shutdown.borrow_and_update() {
            return Ok(SyncExit::Shutdown);
        }

        // 按通知逐条处理状态变化，watch 会把相邻的变化合并掉
        let mut notices = self.session.subscribe();
        self.session.connect().await?;

        let mut retry_at: Option<Instant> = None;
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // 发送端没了也按关闭处理
                    if changed.is_err() || *shutdown.borrow_and_update() {
                        info!("[SyncService] Shutdown requested");
                        self.session.disconnect().await?;
                        return Ok(SyncExit::Shutdown);
                    }
                }
                notice = notices.recv() => {
                    let status = match notice {
                        Ok(SessionNotice::Status(change)) => change.new,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("[SyncService] Missed {} session notices", skipped);
                            self.session.status()
                        }
                        Err(RecvError::Closed) => return Err(SocketError::ControllerClosed.into()),
                    };
                    match status {
                        ConnectionStatus::Authorized { .. } => {
                            self.policy.reset();
                            retry_at = None;
                        }
                        ConnectionStatus::Disconnected(context) if retry_at.is_none() => {
                            if let DisconnectContext::Disconnect { code, .. } = &context {
                                if code.requires_reauthentication() {
                                    warn!("[SyncService] Authentication required ({}), not reconnecting", code);
                                    return Ok(SyncExit::AuthenticationRequired(*code));
                                }
                            }
                            match self.policy.next_delay(&context) {
                                Some(delay) => {
                                    info!("[SyncService] Reconnecting in {:?}", delay);
                                    retry_at = Some(Instant::now() + delay);
                                }
                                None => {
                                    warn!("[SyncService] Giving up after {:?}", context);
                                    return Ok(SyncExit::Disconnected(context));
                                }
                            }
                        }
                        _ => {}
                    }
                }
                _ = wait_until(retry_at) => {
                    retry_at = None;
                    info!("[SyncService] Reconnecting...");
                    self.session.connect().await?;
                }
            }
        }
    }

    /// 断开连接，等缓存任务应用完剩余事件后交还缓存
    ///
    /// 调用前需要先丢掉所有克隆出去的句柄，否则缓存任务不会结束。
    pub async fn shutdown(self) -> Result<C> {
        let Self {
            session,
            cache,
            worker,
            ..
        } = self;
        session.disconnect().await?;
        drop(session);
        drop(cache);
        let cache = worker.await?;
        info!("[SyncService] Stopped");
        Ok(cache)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! 会话控制器
//!
//! 一个任务独占连接、状态、心跳和会话 ID，外部通过 `SessionHandle` 发指令。
//! 事件循环里指令优先于入站消息处理，所以 `disconnect()` 返回后旧连接上的
//! 消息不会再被处理，心跳也不会再发。

use crate::config::SessionConfig;
use crate::credentials::Credentials;
use crate::dispatcher::EventDispatcher;
use crate::error::{DecodeError, SocketError};
use crate::heartbeat::HeartbeatScheduler;
use crate::protocol::{
    decode_event, ErrorCode, ErrorPayload, Operation, ReadyPayload, ServerEvent, ServiceEvent,
};
use crate::status::{ConnectionStatus, DisconnectContext, Headers, StatusCell, StatusChange};
use crate::transport::{Connector, Outbound, TransportEvent, TransportLink};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// 控制器对外广播的通知
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// 状态变化
    Status(StatusChange),
    /// 服务端上报的应用错误，连接保持
    ServerError(ErrorPayload),
    /// 凭证被拒绝，需要重新登录，不会自动重连
    AuthenticationRequired(ErrorCode),
    /// 会话恢复后补发的事件已交给缓存
    Replayed { count: usize },
}

enum Command {
    Connect(oneshot::Sender<Result<(), SocketError>>),
    Disconnect(oneshot::Sender<()>),
}

/// 控制器句柄，可以随意 clone
///
/// 所有句柄都被丢弃后控制器会断开连接并退出。
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionHandle {
    /// 发起连接
    ///
    /// 没有访问令牌时立即失败；已经在连接中或已连接时什么也不做。
    /// 连接结果通过状态变化观察。
    pub async fn connect(&self) -> Result<(), SocketError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .await
            .map_err(|_| SocketError::ControllerClosed)?;
        rx.await.map_err(|_| SocketError::ControllerClosed)?
    }

    /// 主动断开，丢弃会话 ID，状态回到 `Disconnected(Initial)`
    pub async fn disconnect(&self) -> Result<(), SocketError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect(tx))
            .await
            .map_err(|_| SocketError::ControllerClosed)?;
        rx.await.map_err(|_| SocketError::ControllerClosed)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }
}

pub struct SessionController {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn Credentials>,
    dispatcher: EventDispatcher,
    status: StatusCell,
    notices: broadcast::Sender<SessionNotice>,
    commands: mpsc::Receiver<Command>,
    heartbeat: HeartbeatScheduler,
    link: Option<TransportLink>,
    /// 最近一次授权得到的会话 ID，断线后用于恢复
    session_id: Option<String>,
    handshake_deadline: Option<Instant>,
    /// 本次连接发的是 identifyReconnect
    resuming: bool,
}

impl SessionController {
    /// 启动控制器任务
    pub fn spawn(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn Credentials>,
        dispatcher: EventDispatcher,
    ) -> SessionHandle {
        let (command_tx, commands) = mpsc::channel(16);
        let (notices, _) = broadcast::channel(64);
        let status = StatusCell::new();
        let handle = SessionHandle {
            commands: command_tx,
            status: status.subscribe(),
            notices: notices.clone(),
        };

        let controller = Self {
            config,
            connector,
            credentials,
            dispatcher,
            status,
            notices,
            commands,
            heartbeat: HeartbeatScheduler::new(),
            link: None,
            session_id: None,
            handshake_deadline: None,
            resuming: false,
        };
        tokio::spawn(controller.run());
        handle
    }

    async fn run(mut self) {
        debug!("[SessionController] Started");
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Connect(reply)) => {
                        let _ = reply.send(self.connect());
                    }
                    Some(Command::Disconnect(reply)) => {
                        self.disconnect();
                        let _ = reply.send(());
                    }
                    None => {
                        self.disconnect();
                        break;
                    }
                },
                event = recv_link(&mut self.link) => self.handle_transport(event),
                _ = self.heartbeat.tick() => self.send(Operation::heartbeat()),
                _ = wait_deadline(self.handshake_deadline) => self.handshake_timed_out(),
            }
        }
        debug!("[SessionController] All handles dropped, stopped");
    }

    fn connect(&mut self) -> Result<(), SocketError> {
        if !self.status.current().is_disconnected() {
            debug!("[SessionController] Already connecting or connected, ignoring connect");
            return Ok(());
        }
        if self.credentials.access_token().is_none() {
            warn!("[SessionController] No access token, cannot connect");
            self.notify(SessionNotice::AuthenticationRequired(
                ErrorCode::InvalidAccessToken,
            ));
            return Err(SocketError::MissingAccessToken);
        }

        info!("[SessionController] Connecting to {}", self.config.url);
        self.set_status(ConnectionStatus::Connecting);
        self.link = Some(self.connector.open(&self.config));
        self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.heartbeat.stop();
        if let Some(link) = self.link.take() {
            let _ = link.outbound.try_send(Outbound::Close);
            info!("[SessionController] Disconnected by client");
        }
        self.handshake_deadline = None;
        self.resuming = false;
        self.session_id = None;
        self.credentials.session_changed(None);
        self.set_status(ConnectionStatus::Disconnected(DisconnectContext::Initial));
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { headers } => self.on_opened(headers),
            TransportEvent::Message(text) => self.on_message(&text),
            TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
            TransportEvent::Failed(cause) => self.on_failed(cause),
        }
    }

    fn on_opened(&mut self, headers: Headers) {
        if !matches!(self.status.current(), ConnectionStatus::Connecting) {
            debug!("[SessionController] Ignoring open outside of connecting state");
            return;
        }
        self.set_status(ConnectionStatus::Connected { headers });

        let Some(token) = self.credentials.access_token() else {
            self.on_failed(Some(SocketError::MissingAccessToken));
            return;
        };
        let resumable = self
            .session_id
            .clone()
            .or_else(|| self.credentials.resumable_session());
        let identify = match resumable {
            Some(session_id) => {
                info!("[SessionController] Resuming session {}", session_id);
                self.resuming = true;
                Operation::identify_reconnect(token, session_id)
            }
            None => {
                self.resuming = false;
                Operation::identify(token)
            }
        };
        self.send(identify);
    }

    fn on_message(&mut self, text: &str) {
        let event = match decode_event(text) {
            Ok(event) => event,
            Err(DecodeError::UnknownEventType(tag)) => {
                debug!("[SessionController] Ignoring unknown event `{}`", tag);
                return;
            }
            Err(e) => {
                warn!("[SessionController] Dropping undecodable message: {}", e);
                return;
            }
        };

        match event {
            ServerEvent::Ready(ready) => self.on_ready(ready),
            ServerEvent::Service(event) => self.on_service_event(event),
            ServerEvent::Replay(events) => self.on_replay(events),
            ServerEvent::Error(payload) => {
                warn!(
                    "[SessionController] Server error: {} ({})",
                    payload.message, payload.verbose
                );
                self.notify(SessionNotice::ServerError(payload));
            }
        }
    }

    fn on_ready(&mut self, ready: ReadyPayload) {
        if !matches!(self.status.current(), ConnectionStatus::Connected { .. }) {
            warn!("[SessionController] Unexpected ready in state {:?}", self.status.current());
            return;
        }

        self.handshake_deadline = None;
        match ready.heartbeat_interval() {
            Some(period) => self.heartbeat.start(period),
            None => warn!(
                "[SessionController] Invalid ping interval {}, heartbeat disabled",
                ready.ping_interval
            ),
        }
        self.session_id = Some(ready.session_id.clone());
        self.credentials.session_changed(Some(&ready.session_id));
        info!(
            "[SessionController] Authorized (session {}, resumed: {})",
            ready.session_id, self.resuming
        );
        self.set_status(ConnectionStatus::Authorized {
            session_id: ready.session_id,
        });
    }

    fn on_service_event(&mut self, event: ServiceEvent) {
        if !self.status.current().is_authorized() {
            warn!(
                "[SessionController] Dropping service event for {} before ready",
                event.service_key()
            );
            return;
        }
        if let Err(e) = self.dispatcher.dispatch(event) {
            warn!("[SessionController] Failed to dispatch event: {}", e);
        }
    }

    fn on_replay(&mut self, events: Vec<ServiceEvent>) {
        if !self.status.current().is_authorized() {
            warn!("[SessionController] Dropping replay of {} events before ready", events.len());
            return;
        }
        if !self.resuming {
            debug!("[SessionController] Replay received on a fresh session");
        }
        let count = events.len();
        info!("[SessionController] Replaying {} events", count);
        if let Err(e) = self.dispatcher.dispatch_replay(events) {
            warn!("[SessionController] Failed to dispatch replay: {}", e);
            return;
        }
        self.notify(SessionNotice::Replayed { count });
    }

    fn on_closed(&mut self, code: u16, reason: String) {
        let code = ErrorCode::from(code);
        info!("[SessionController] Closed by server: {} {}", code, reason);
        self.teardown();

        let reauthenticate = code.requires_reauthentication();
        if reauthenticate {
            self.session_id = None;
            self.credentials.session_changed(None);
            self.credentials.authentication_required(code);
        }
        self.set_status(ConnectionStatus::Disconnected(
            DisconnectContext::Disconnect { reason, code },
        ));
        if reauthenticate {
            self.notify(SessionNotice::AuthenticationRequired(code));
        }
    }

    fn on_failed(&mut self, cause: Option<SocketError>) {
        match &cause {
            Some(e) => warn!("[SessionController] Transport failed: {}", e),
            None => warn!("[SessionController] Transport closed without status"),
        }
        self.teardown();
        self.set_status(ConnectionStatus::Disconnected(DisconnectContext::Error(
            cause.map(Arc::new),
        )));
    }

    fn handshake_timed_out(&mut self) {
        warn!(
            "[SessionController] No ready within {:?}, giving up",
            self.config.handshake_timeout
        );
        self.on_failed(Some(SocketError::HandshakeTimeout(
            self.config.handshake_timeout,
        )));
    }

    /// 丢掉当前连接，会话 ID 保留
    fn teardown(&mut self) {
        self.heartbeat.stop();
        self.link = None;
        self.handshake_deadline = None;
        self.resuming = false;
    }

    /// 发送失败只记日志，不影响连接
    fn send(&self, operation: Operation) {
        let Some(link) = &self.link else {
            debug!("[SessionController] Not connected, dropping {:?}", operation.op);
            return;
        };
        let text = match operation.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("[SessionController] Failed to encode {:?}: {}", operation.op, e);
                return;
            }
        };
        match link.outbound.try_send(Outbound::Text(text)) {
            Ok(()) => debug!("[SessionController] Sent {:?}", operation.op),
            Err(e) => warn!("[SessionController] Failed to queue {:?}: {}", operation.op, e),
        }
    }

    fn set_status(&self, new: ConnectionStatus) {
        if self.status.current() == new {
            return;
        }
        let change = self.status.replace(new);
        if !change.old.can_transition_to(&change.new) {
            warn!(
                "[SessionController] Unexpected transition {:?} -> {:?}",
                change.old, change.new
            );
        }
        info!("[SessionController] Status {:?} -> {:?}", change.old, change.new);
        self.notify(SessionNotice::Status(change));
    }

    fn notify(&self, notice: SessionNotice) {
        // 没有订阅者时发送失败，忽略
        let _ = self.notices.send(notice);
    }
}

/// 没有连接时永远挂起；对端消失视为无状态码的断开
async fn recv_link(link: &mut Option<TransportLink>) -> TransportEvent {
    match link.as_mut() {
        Some(link) => link
            .inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Failed(None)),
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentials;
    use crate::dispatcher::{DispatchBatch, DispatchOrigin};
    use crate::testutil::{created, unread, MockConnector, MockServer};
    use std::time::Duration;

    struct Harness {
        handle: SessionHandle,
        servers: mpsc::UnboundedReceiver<MockServer>,
        batches: mpsc::UnboundedReceiver<DispatchBatch>,
        credentials: MemoryCredentials,
        connector: Arc<MockConnector>,
    }

    fn harness(credentials: MemoryCredentials) -> Harness {
        let (connector, servers) = MockConnector::new();
        let connector = Arc::new(connector);
        let (dispatcher, batches) = EventDispatcher::channel();
        let handle = SessionController::spawn(
            SessionConfig::with_url("ws://notify.test/events"),
            connector.clone(),
            Arc::new(credentials.clone()),
            dispatcher,
        );
        Harness {
            handle,
            servers,
            batches,
            credentials,
            connector,
        }
    }

    fn ready(session_id: &str, ping_interval: f64) -> ServerEvent {
        ServerEvent::Ready(ReadyPayload {
            session_id: session_id.to_string(),
            ping_interval,
        })
    }

    async fn wait_status(
        handle: &SessionHandle,
        f: impl Fn(&ConnectionStatus) -> bool,
    ) -> ConnectionStatus {
        let mut rx = handle.status_receiver();
        let status = rx.wait_for(|s| f(s)).await.unwrap().clone();
        status
    }

    async fn next_notice(
        rx: &mut broadcast::Receiver<SessionNotice>,
        f: impl Fn(&SessionNotice) -> bool,
    ) -> SessionNotice {
        loop {
            let notice = rx.recv().await.unwrap();
            if f(&notice) {
                return notice;
            }
        }
    }

    /// 连接并完成鉴权，返回服务端一头（identify 已被读走）
    async fn authorize(h: &mut Harness, session_id: &str) -> MockServer {
        h.handle.connect().await.unwrap();
        let mut server = h.servers.recv().await.unwrap();
        server.open(Headers::new()).await;
        let _ = server.next_operation().await;
        server.send_event(ready(session_id, 30.0)).await;
        wait_status(&h.handle, ConnectionStatus::is_authorized).await;
        server
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_token_fails() {
        let h = harness(MemoryCredentials::default());
        let mut notices = h.handle.subscribe();

        let err = h.handle.connect().await.unwrap_err();
        assert!(matches!(err, SocketError::MissingAccessToken));
        assert!(matches!(
            notices.recv().await.unwrap(),
            SessionNotice::AuthenticationRequired(_)
        ));
        assert_eq!(h.handle.status(), ConnectionStatus::default());
        assert_eq!(h.connector.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_connect_sends_identify() {
        let mut h = harness(MemoryCredentials::new("tok"));
        h.handle.connect().await.unwrap();
        assert_eq!(h.handle.status(), ConnectionStatus::Connecting);

        let mut server = h.servers.recv().await.unwrap();
        assert_eq!(server.url, "ws://notify.test/events");
        let headers: Headers = [("x-server".to_string(), "edge-1".to_string())].into();
        server.open(headers.clone()).await;

        assert_eq!(server.next_operation().await, Operation::identify("tok"));
        assert_eq!(h.handle.status(), ConnectionStatus::Connected { headers });
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_session_sends_identify_reconnect() {
        let mut h = harness(MemoryCredentials::with_session("tok", "abc"));
        h.handle.connect().await.unwrap();
        let mut server = h.servers.recv().await.unwrap();
        server.open(Headers::new()).await;
        assert_eq!(
            server.next_operation().await,
            Operation::identify_reconnect("tok", "abc")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connecting_is_noop() {
        let h = harness(MemoryCredentials::new("tok"));
        h.handle.connect().await.unwrap();
        h.handle.connect().await.unwrap();
        assert_eq!(h.connector.open_count(), 1);
        assert_eq!(h.handle.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_authorizes_and_starts_heartbeat() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let mut server = authorize(&mut h, "s1").await;
        let started = Instant::now();

        assert_eq!(
            h.handle.status(),
            ConnectionStatus::Authorized {
                session_id: "s1".into()
            }
        );
        assert_eq!(h.credentials.session_id().as_deref(), Some("s1"));

        assert_eq!(server.next_operation().await, Operation::heartbeat());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(server.next_operation().await, Operation::heartbeat());
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_ping_interval_disables_heartbeat() {
        let mut h = harness(MemoryCredentials::new("tok"));
        h.handle.connect().await.unwrap();
        let mut server = h.servers.recv().await.unwrap();
        server.open(Headers::new()).await;
        let _ = server.next_operation().await;
        server.send_event(ready("s1", 0.0)).await;
        wait_status(&h.handle, ConnectionStatus::is_authorized).await;

        time::sleep(Duration::from_secs(300)).await;
        assert!(server.drain_outbound().is_empty());
        assert!(h.handle.status().is_authorized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_with_invalid_token_requires_reauthentication() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let mut notices = h.handle.subscribe();
        let mut server = authorize(&mut h, "s1").await;

        server.close(1001, "token revoked").await;
        let status = wait_status(&h.handle, ConnectionStatus::is_disconnected).await;
        assert_eq!(
            status,
            ConnectionStatus::Disconnected(DisconnectContext::Disconnect {
                reason: "token revoked".into(),
                code: ErrorCode::InvalidAccessToken,
            })
        );
        let notice = next_notice(&mut notices, |n| {
            matches!(n, SessionNotice::AuthenticationRequired(_))
        })
        .await;
        assert!(matches!(
            notice,
            SessionNotice::AuthenticationRequired(ErrorCode::InvalidAccessToken)
        ));
        assert_eq!(h.credentials.session_id(), None);
        assert_eq!(
            h.credentials.needs_authentication(),
            Some(ErrorCode::InvalidAccessToken)
        );

        // 不会自动重连，也不会再发心跳
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.connector.open_count(), 1);
        assert!(server.next_outbound().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_close_keeps_session() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let server = authorize(&mut h, "s1").await;

        server.close(4000, "restarting").await;
        let status = wait_status(&h.handle, ConnectionStatus::is_disconnected).await;
        assert_eq!(
            status,
            ConnectionStatus::Disconnected(DisconnectContext::Disconnect {
                reason: "restarting".into(),
                code: ErrorCode::Unknown,
            })
        );
        assert_eq!(h.credentials.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_resumes_on_next_connect() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let server = authorize(&mut h, "s1").await;

        server.fail(None).await;
        let status = wait_status(&h.handle, ConnectionStatus::is_disconnected).await;
        assert_eq!(
            status,
            ConnectionStatus::Disconnected(DisconnectContext::Error(None))
        );

        h.handle.connect().await.unwrap();
        let mut server = h.servers.recv().await.unwrap();
        server.open(Headers::new()).await;
        assert_eq!(
            server.next_operation().await,
            Operation::identify_reconnect("tok", "s1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_keeps_connection() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let mut notices = h.handle.subscribe();
        let server = authorize(&mut h, "s1").await;

        let payload = ErrorPayload {
            message: "rate limited".into(),
            verbose: "slow down".into(),
        };
        server.send_event(ServerEvent::Error(payload.clone())).await;
        let notice = next_notice(&mut notices, |n| matches!(n, SessionNotice::ServerError(_))).await;
        assert!(matches!(notice, SessionNotice::ServerError(p) if p == payload));
        assert!(h.handle.status().is_authorized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_returns_to_initial() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let mut server = authorize(&mut h, "s1").await;

        h.handle.disconnect().await.unwrap();
        assert_eq!(h.handle.status(), ConnectionStatus::default());
        assert_eq!(server.next_outbound().await, Some(Outbound::Close));
        assert_eq!(server.next_outbound().await, None);
        assert_eq!(h.credentials.session_id(), None);

        // 断开后不再有心跳
        time::sleep(Duration::from_secs(120)).await;
        assert!(server.drain_outbound().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_and_replay_apply_in_order() {
        let mut h = harness(MemoryCredentials::with_session("tok", "s0"));
        let mut notices = h.handle.subscribe();
        let server = authorize(&mut h, "s0").await;

        server.send_event(ServerEvent::Service(created("a", 1))).await;
        server.send_event(ServerEvent::Service(unread("a", 2))).await;
        server
            .send_event(ServerEvent::Replay(vec![created("b", 0), unread("b", 5)]))
            .await;
        server.send_event(ServerEvent::Service(unread("a", 3))).await;

        let mut applied = Vec::new();
        let mut origins = Vec::new();
        while applied.len() < 5 {
            let batch = h.batches.recv().await.unwrap();
            origins.push(batch.origin);
            applied.extend(batch.events);
        }
        assert_eq!(
            applied,
            vec![
                created("a", 1),
                unread("a", 2),
                created("b", 0),
                unread("b", 5),
                unread("a", 3),
            ]
        );
        assert_eq!(
            origins,
            vec![
                DispatchOrigin::Live,
                DispatchOrigin::Live,
                DispatchOrigin::Replay,
                DispatchOrigin::Live,
            ]
        );
        let notice = next_notice(&mut notices, |n| matches!(n, SessionNotice::Replayed { .. })).await;
        assert!(matches!(notice, SessionNotice::Replayed { count: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_before_ready_are_dropped() {
        let mut h = harness(MemoryCredentials::new("tok"));
        h.handle.connect().await.unwrap();
        let mut server = h.servers.recv().await.unwrap();
        server.open(Headers::new()).await;
        let _ = server.next_operation().await;

        server.send_event(ServerEvent::Service(created("early", 1))).await;
        server.send_event(ready("s1", 30.0)).await;
        server.send_event(ServerEvent::Service(created("late", 1))).await;

        let batch = h.batches.recv().await.unwrap();
        assert_eq!(batch.events, vec![created("late", 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_messages_are_skipped() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let server = authorize(&mut h, "s1").await;

        server.send_text(r#"{"event":"typing","d":{}}"#).await;
        server.send_text("not json").await;
        server
            .send_text(r#"{"event":"replay","d":{"sessionID":"x","pingInterval":1}}"#)
            .await;
        server.send_event(ServerEvent::Service(unread("a", 1))).await;

        let batch = h.batches.recv().await.unwrap();
        assert_eq!(batch.events, vec![unread("a", 1)]);
        assert!(h.handle.status().is_authorized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let started = Instant::now();
        h.handle.connect().await.unwrap();
        let mut server = h.servers.recv().await.unwrap();
        server.open(Headers::new()).await;
        let _ = server.next_operation().await;

        let status = wait_status(&h.handle, ConnectionStatus::is_disconnected).await;
        assert!(started.elapsed() >= crate::config::DEFAULT_HANDSHAKE_TIMEOUT);
        match status {
            ConnectionStatus::Disconnected(DisconnectContext::Error(Some(e))) => {
                assert!(matches!(*e, SocketError::HandshakeTimeout(_)));
            }
            other => panic!("expected handshake timeout, got {other:?}"),
        }
        assert_eq!(server.next_outbound().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_closes_socket() {
        let mut h = harness(MemoryCredentials::new("tok"));
        let mut server = authorize(&mut h, "s1").await;

        let Harness { handle, .. } = h;
        drop(handle);
        assert_eq!(server.next_outbound().await, Some(Outbound::Close));
        assert_eq!(server.next_outbound().await, None);
    }
}

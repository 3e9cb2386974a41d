//! 测试用的假传输层和记录型缓存

use crate::cache::ServiceCache;
use crate::config::SessionConfig;
use crate::error::SocketError;
use crate::protocol::{Operation, ServerEvent, Service, ServiceEvent, ServiceKey};
use crate::status::Headers;
use crate::transport::{Connector, Outbound, TransportEvent, TransportLink, TransportPeer};
use serde_json::Map;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub fn service(id: &str, unread_count: i64) -> Service {
    Service {
        id: id.to_string(),
        name: format!("{id} service"),
        unread_count,
        updated_at: None,
        extra: Map::new(),
    }
}

pub fn created(id: &str, unread_count: i64) -> ServiceEvent {
    ServiceEvent::ServiceCreated {
        service: service(id, unread_count),
    }
}

pub fn unread(id: &str, unread_count: i64) -> ServiceEvent {
    ServiceEvent::UnreadCountChanged {
        service_id: ServiceKey::from(id),
        unread_count,
    }
}

/// 每次 `open` 都把服务端那一头交给测试
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    opened: Mutex<usize>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockServer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                servers: tx,
                opened: Mutex::new(0),
            },
            rx,
        )
    }

    pub fn open_count(&self) -> usize {
        *self.opened.lock().unwrap()
    }
}

impl Connector for MockConnector {
    fn open(&self, config: &SessionConfig) -> TransportLink {
        let (link, peer) = TransportLink::pair(config.outbound_buffer);
        *self.opened.lock().unwrap() += 1;
        let _ = self.servers.send(MockServer {
            peer,
            url: config.url.clone(),
        });
        link
    }
}

pub struct MockServer {
    pub peer: TransportPeer,
    pub url: String,
}

impl MockServer {
    pub async fn open(&self, headers: Headers) {
        self.peer
            .events
            .send(TransportEvent::Opened { headers })
            .await
            .unwrap();
    }

    pub async fn send_event(&self, event: ServerEvent) {
        let text = serde_json::to_string(&event).unwrap();
        self.send_text(text).await;
    }

    pub async fn send_text(&self, text: impl Into<String>) {
        self.peer
            .events
            .send(TransportEvent::Message(text.into()))
            .await
            .unwrap();
    }

    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .peer
            .events
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn fail(&self, cause: Option<SocketError>) {
        let _ = self.peer.events.send(TransportEvent::Failed(cause)).await;
    }

    /// 下一条上行操作包
    pub async fn next_operation(&mut self) -> Operation {
        match self.peer.outbound.recv().await {
            Some(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// 下一条上行指令（文本或关闭），链路被丢弃时返回 None
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.peer.outbound.recv().await
    }

    /// 不等待，取出已经排队的上行指令
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.peer.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// 按应用顺序记录事件
#[derive(Debug, Default)]
pub struct RecordingCache {
    pub applied: Vec<ServiceEvent>,
}

impl ServiceCache for RecordingCache {
    fn upsert(&mut self, _key: &ServiceKey, event: &ServiceEvent) -> anyhow::Result<()> {
        self.applied.push(event.clone());
        Ok(())
    }

    fn current_unread_count(&self) -> i64 {
        0
    }
}

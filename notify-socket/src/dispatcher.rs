//! 事件分发
//!
//! 控制器把解码好的服务事件交给缓存所在的任务，自己不等待应用结果。
//! channel 是无界 FIFO：发送永不阻塞传输循环，顺序与到达顺序一致。

use crate::error::SocketError;
use crate::protocol::ServiceEvent;
use tokio::sync::mpsc;

/// 事件来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOrigin {
    /// 连接期间实时推送
    Live,
    /// 恢复会话后补发
    Replay,
}

/// 一批按顺序应用的事件
///
/// replay 整体作为一批交付，保证它先于之后到达的任何实时事件被应用。
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchBatch {
    pub origin: DispatchOrigin,
    pub events: Vec<ServiceEvent>,
}

#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<DispatchBatch>,
}

impl EventDispatcher {
    pub fn new(tx: mpsc::UnboundedSender<DispatchBatch>) -> Self {
        Self { tx }
    }

    /// 创建分发器和对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DispatchBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn dispatch(&self, event: ServiceEvent) -> Result<(), SocketError> {
        self.send(DispatchBatch {
            origin: DispatchOrigin::Live,
            events: vec![event],
        })
    }

    pub fn dispatch_replay(&self, events: Vec<ServiceEvent>) -> Result<(), SocketError> {
        if events.is_empty() {
            return Ok(());
        }
        self.send(DispatchBatch {
            origin: DispatchOrigin::Replay,
            events,
        })
    }

    fn send(&self, batch: DispatchBatch) -> Result<(), SocketError> {
        self.tx
            .send(batch)
            .map_err(|_| SocketError::CacheClosed)
    }
}

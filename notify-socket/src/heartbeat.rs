//! 心跳调度器
//!
//! 纯定时器，不负责发送，也不做失败升级。由控制器在自己的事件循环里驱动，
//! 因此 `stop()` 返回后不可能再有 tick 被处理。

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Default)]
pub struct HeartbeatScheduler {
    ticker: Option<Interval>,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动（或以新间隔重启），第一次 tick 在一个完整周期之后
    pub fn start(&mut self, period: Duration) {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        // 错过的 tick 不补发
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        debug!("[Heartbeat] Started with period {:?}", period);
    }

    pub fn stop(&mut self) {
        if self.ticker.take().is_some() {
            debug!("[Heartbeat] Stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.ticker.as_ref().map(Interval::period)
    }

    /// 等待下一次心跳，停止状态下永远挂起
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

//! 同步服务层
//!
//! 整合 notify-socket 的控制器和缓存任务，负责断线重连

mod reconnect;
mod service;

pub use reconnect::{BackoffConfig, ExponentialBackoff, NoReconnect, ReconnectPolicy};
pub use service::{SyncExit, SyncService};

//! 本地服务缓存
//!
//! 缓存只归 `CacheWorker` 任务所有。写入通过 `EventDispatcher` 排队进来，
//! 读取把闭包送进同一个任务执行，所以读者看到的总是完整应用后的状态。

use crate::dispatcher::{DispatchBatch, DispatchOrigin, EventDispatcher};
use crate::error::SocketError;
use crate::protocol::{Service, ServiceEvent, ServiceKey};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 本地缓存协作方
pub trait ServiceCache: Send + 'static {
    /// 按 key 幂等地合并一条事件（插入、覆盖或删除）
    ///
    /// 返回 Err 时缓存必须保持原状，不会发出变更通知。
    fn upsert(&mut self, key: &ServiceKey, event: &ServiceEvent) -> Result<()>;

    /// 所有服务的未读总数
    fn current_unread_count(&self) -> i64;
}

/// 缓存中的一条服务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub service: Service,
    /// 本地最后一次应用事件的时间
    pub applied_at: DateTime<Utc>,
}

/// 内存缓存，可选落盘为 JSON
#[derive(Debug, Default)]
pub struct MemoryCache {
    services: BTreeMap<ServiceKey, ServiceRecord>,
    path: Option<PathBuf>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开持久化缓存，文件不存在时从空开始
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let services = if path.exists() {
            let data = fs::read(&path)
                .with_context(|| format!("Failed to read cache file {}", path.display()))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("Failed to parse cache file {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        info!(
            "[MemoryCache] Loaded {} services from {}",
            services.len(),
            path.display()
        );
        Ok(Self {
            services,
            path: Some(path),
        })
    }

    pub fn get(&self, key: &ServiceKey) -> Option<&ServiceRecord> {
        self.services.get(key)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values().map(|r| &r.service)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// 立即写盘，没有文件路径时什么也不做
    pub fn flush(&self) -> Result<()> {
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        // 先写临时文件再 rename，崩溃时不会留下半个文件
        let tmp = tmp_path(path);
        let data = serde_json::to_vec_pretty(&self.services)?;
        fs::write(&tmp, data).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

impl ServiceCache for MemoryCache {
    fn upsert(&mut self, key: &ServiceKey, event: &ServiceEvent) -> Result<()> {
        match event {
            ServiceEvent::ServiceCreated { service } | ServiceEvent::ServiceUpdated { service } => {
                self.services.insert(
                    key.clone(),
                    ServiceRecord {
                        service: service.clone(),
                        applied_at: Utc::now(),
                    },
                );
            }
            ServiceEvent::ServiceDeleted { .. } => {
                self.services.remove(key);
            }
            ServiceEvent::UnreadCountChanged { unread_count, .. } => match self.services.get_mut(key) {
                Some(record) => {
                    record.service.unread_count = *unread_count;
                    record.applied_at = Utc::now();
                }
                None => {
                    debug!("[MemoryCache] Unread count for unknown service {}", key);
                    return Ok(());
                }
            },
        }
        // 内存里已经生效，写盘失败留到下一次写入或 flush 再补
        if let Err(e) = self.persist() {
            warn!("[MemoryCache] Failed to persist after {}: {:#}", key, e);
        }
        Ok(())
    }

    fn current_unread_count(&self) -> i64 {
        self.services.values().map(|r| r.service.unread_count).sum()
    }
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upserted,
    Removed,
    UnreadCount,
}

impl ChangeKind {
    fn of(event: &ServiceEvent) -> Self {
        match event {
            ServiceEvent::ServiceCreated { .. } | ServiceEvent::ServiceUpdated { .. } => Self::Upserted,
            ServiceEvent::ServiceDeleted { .. } => Self::Removed,
            ServiceEvent::UnreadCountChanged { .. } => Self::UnreadCount,
        }
    }
}

/// 一条事件应用完成后的通知
#[derive(Debug, Clone, PartialEq)]
pub struct CacheChange {
    pub key: ServiceKey,
    pub kind: ChangeKind,
    pub origin: DispatchOrigin,
    pub unread_total: i64,
}

type ReadFn<C> = Box<dyn FnOnce(&C) + Send>;

/// 缓存所在的任务
pub struct CacheWorker<C> {
    cache: C,
    batches: mpsc::UnboundedReceiver<DispatchBatch>,
    reads: mpsc::Receiver<ReadFn<C>>,
    changes: broadcast::Sender<CacheChange>,
}

impl<C: ServiceCache> CacheWorker<C> {
    /// 启动任务，返回写入端、读取端和任务句柄（任务结束时交还缓存）
    pub fn spawn(cache: C) -> (EventDispatcher, CacheHandle<C>, JoinHandle<C>) {
        let (dispatcher, batches) = EventDispatcher::channel();
        let (read_tx, reads) = mpsc::channel(32);
        let (changes, _) = broadcast::channel(256);
        let handle = CacheHandle {
            reads: read_tx,
            changes: changes.clone(),
        };
        let worker = Self {
            cache,
            batches,
            reads,
            changes,
        };
        (dispatcher, handle, tokio::spawn(worker.run()))
    }

    async fn run(mut self) -> C {
        debug!("[CacheWorker] Started");
        let mut batches_open = true;
        let mut reads_open = true;
        loop {
            tokio::select! {
                biased;
                batch = self.batches.recv(), if batches_open => match batch {
                    Some(batch) => self.apply(batch),
                    None => batches_open = false,
                },
                read = self.reads.recv(), if reads_open => match read {
                    Some(read) => read(&self.cache),
                    None => reads_open = false,
                },
                else => break,
            }
        }
        debug!("[CacheWorker] All handles dropped, stopping");
        self.cache
    }

    fn apply(&mut self, batch: DispatchBatch) {
        let count = batch.events.len();
        for event in &batch.events {
            let key = event.service_key();
            if let Err(e) = self.cache.upsert(&key, event) {
                warn!("[CacheWorker] Failed to apply event for {}: {:#}", key, e);
                continue;
            }
            let _ = self.changes.send(CacheChange {
                key,
                kind: ChangeKind::of(event),
                origin: batch.origin,
                unread_total: self.cache.current_unread_count(),
            });
        }
        if batch.origin == DispatchOrigin::Replay {
            info!("[CacheWorker] Applied replay of {} events", count);
        }
    }
}

/// 缓存读取端，可以在任意任务里使用
pub struct CacheHandle<C> {
    reads: mpsc::Sender<ReadFn<C>>,
    changes: broadcast::Sender<CacheChange>,
}

impl<C> Clone for CacheHandle<C> {
    fn clone(&self) -> Self {
        Self {
            reads: self.reads.clone(),
            changes: self.changes.clone(),
        }
    }
}

impl<C: ServiceCache> CacheHandle<C> {
    /// 在缓存所在任务里执行只读闭包
    pub async fn read<R, F>(&self, f: F) -> Result<R, SocketError>
    where
        F: FnOnce(&C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: ReadFn<C> = Box::new(move |cache| {
            let _ = tx.send(f(cache));
        });
        self.reads.send(job).await.map_err(|_| SocketError::CacheClosed)?;
        rx.await.map_err(|_| SocketError::CacheClosed)
    }

    pub async fn unread_count(&self) -> Result<i64, SocketError> {
        self.read(|cache| cache.current_unread_count()).await
    }

    /// 订阅变更通知
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }
}

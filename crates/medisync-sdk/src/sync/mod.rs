//! 同步协调器 - 本地写入与远端服务之间的唯一中介
//!
//! 职责：
//! - 两阶段写入：先落本地（本地成功即对调用方成功），在线则顺手
//!   尝试远端，失败静默入队
//! - 连通恢复后按 op_id 顺序单列冲刷挂起队列
//! - 指数退避重试，超限标记终态失败并通知界面层
//! - 冲突按 remote-wins 处理：丢弃排队写入，拉远端副本覆盖本地
//!
//! 读路径（get / list_by）直通 LocalStore：本地库即缓存即事实，
//! 不在内存里另养一份状态。

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod remote;
pub mod retry_policy;

pub use remote::{
    HttpClientConfig, HttpRemoteService, RemoteAck, RemotePage, RemoteService, SessionValidation,
};
pub use retry_policy::{FlushFailureReason, RetryPolicy};

use crate::connectivity::{ConnectivityMonitor, ConnectivitySubscription, TransitionKind};
use crate::error::{MedisyncSDKError, Result};
use crate::events::{EventManager, SdkEvent};
use crate::storage::entities::{EntityRecord, EntityType, OperationKind, PendingOperation};
use crate::storage::{AtomicStore, StorageManager, WriteJournalEntry};

/// 一轮冲刷的结果摘要
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// 成功送达远端的操作数
    pub synced: u64,
    /// 终态失败的操作数
    pub failed: u64,
    /// 被取消的操作数（实体已本地删除）
    pub cancelled: u64,
    /// 按 remote-wins 解决的冲突数
    pub conflicts: u64,
}

struct CoordinatorInner {
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteService>,
    monitor: ConnectivityMonitor,
    events: EventManager,
    retry_policy: RetryPolicy,
    /// 同一时刻只跑一轮冲刷（排序与幂等的根基）
    flush_lock: Mutex<()>,
    /// 手动 sync_now 打断退避等待
    force_notify: Notify,
    flush_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<()>>>,
    started: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    subscription: parking_lot::Mutex<Option<ConnectivitySubscription>>,
}

impl std::fmt::Debug for CoordinatorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorInner")
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

/// 同步协调器
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteService>,
        monitor: ConnectivityMonitor,
        events: EventManager,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                storage,
                remote,
                monitor,
                events,
                retry_policy,
                flush_lock: Mutex::new(()),
                force_notify: Notify::new(),
                flush_tx: parking_lot::Mutex::new(None),
                started: AtomicBool::new(false),
                tasks: parking_lot::Mutex::new(Vec::new()),
                subscription: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// 启动：订阅连通性转换，connected 即触发冲刷；幂等
    pub fn start(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        *self.inner.flush_tx.lock() = Some(tx.clone());

        // connected 转换 → 冲刷触发信号
        let trigger = tx;
        let subscription = self.inner.monitor.subscribe(move |transition| {
            if transition.kind == TransitionKind::Connected {
                let _ = trigger.send(());
            }
        });
        *self.inner.subscription.lock() = Some(subscription);

        // 冲刷执行任务（单消费者，天然串行）
        let inner = Arc::clone(&self.inner);
        let flush_task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                if let Err(e) = inner.flush_pending().await {
                    warn!("冲刷中断: {}", e);
                }
            }
        });
        self.inner.tasks.lock().push(flush_task);
        info!("🔄 同步协调器已启动");
    }

    /// 停止：退订连通性、撤下冲刷任务
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.inner.flush_tx.lock() = None;
        *self.inner.subscription.lock() = None;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!("🔄 同步协调器已停止");
    }

    // -----------------------------------------------------------------------
    // 写路径（界面层的唯一写入口）
    // -----------------------------------------------------------------------

    /// 创建实体：本地先行，在线则立即尝试远端
    ///
    /// 本地写失败 → 整个调用失败，不入队。远端失败/离线 → 静默入队，
    /// 调用方看到的仍是成功（本地已持久化即达成持久性承诺）。
    pub async fn save(&self, entity_type: EntityType, data: Value) -> Result<EntityRecord> {
        let record = self.inner.storage.create(entity_type, data).await?;
        self.inner.after_local_create(entity_type, &record).await?;
        self.inner.refreshed(entity_type, record).await
    }

    /// 更新实体：本地合并 patch 先行，其余同 [`save`](Self::save)
    pub async fn save_update(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: Value,
    ) -> Result<EntityRecord> {
        let record = self.inner.storage.update(entity_type, id, patch).await?;
        self.inner.after_local_update(entity_type, &record).await?;
        self.inner.refreshed(entity_type, record).await
    }

    /// 删除实体：本地删除先行；排队中的 create/update 被取消而非发送
    pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        let record = self.inner.storage.delete(entity_type, id).await?;
        self.inner.after_local_delete(entity_type, &record).await
    }

    /// 复合写入：一组本地写入全有或全无，提交后逐条走远端同步/入队
    ///
    /// 例：建就诊 → 建发票 → 加发票行 → 回写患者最近就诊时间。
    pub async fn run_compound<F, R>(&self, steps: F) -> Result<R>
    where
        F: FnOnce(&AtomicStore<'_>) -> Result<R>,
    {
        let (result, journal) = self.inner.storage.run_atomic_journaled(steps).await?;
        for entry in &journal {
            self.inner.after_journal_entry(entry).await?;
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // 读路径（直通 LocalStore，读穿缓存）
    // -----------------------------------------------------------------------

    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<EntityRecord>> {
        self.inner.storage.get(entity_type, id).await
    }

    pub async fn list_by<F>(&self, entity_type: EntityType, predicate: F) -> Result<Vec<EntityRecord>>
    where
        F: Fn(&EntityRecord) -> bool,
    {
        self.inner.storage.list_by(entity_type, predicate).await
    }

    /// 终态失败的操作（界面层渲染同步错误角标）
    pub async fn failed_operations(&self) -> Result<Vec<PendingOperation>> {
        self.inner.storage.failed_operations().await
    }

    pub async fn pending_count(&self) -> Result<i64> {
        self.inner.storage.pending_count().await
    }

    // -----------------------------------------------------------------------
    // 冲刷
    // -----------------------------------------------------------------------

    /// 手动"立即同步"：强制探测一次，打断退避等待，触发冲刷
    pub async fn sync_now(&self) -> Result<FlushSummary> {
        self.inner.monitor.refresh_status().await;
        self.inner.force_notify.notify_waiters();
        self.inner.flush_pending().await
    }

    /// 按 op_id 顺序排空挂起队列（同一时刻只有一轮在跑）
    pub async fn flush_pending(&self) -> Result<FlushSummary> {
        self.inner.flush_pending().await
    }

    // -----------------------------------------------------------------------
    // 批量导入 / 分页拉取（在线操作）
    // -----------------------------------------------------------------------

    /// 批量导入（如表格导入的患者名单）：本地一笔事务落库，在线则
    /// 用批量端点一次推送；远端失败退化为逐条入队
    pub async fn import_many(
        &self,
        entity_type: EntityType,
        items: Vec<Value>,
    ) -> Result<Vec<EntityRecord>> {
        let (records, _journal) = self
            .inner
            .storage
            .run_atomic_journaled(|store| {
                let mut records = Vec::with_capacity(items.len());
                for item in items {
                    records.push(store.create(entity_type, item)?);
                }
                Ok(records)
            })
            .await?;

        if self.inner.monitor.snapshot().is_connected {
            let payloads: Vec<Value> = records.iter().map(|r| r.to_remote_payload()).collect();
            match self.inner.remote.bulk_import(entity_type, &payloads).await {
                Ok(acks) if acks.len() == records.len() => {
                    for (record, ack) in records.iter().zip(&acks) {
                        self.inner
                            .storage
                            .mark_synced(entity_type, &record.id, &ack.id)
                            .await?;
                    }
                    let mut refreshed = Vec::with_capacity(records.len());
                    for record in records {
                        refreshed.push(self.inner.refreshed(entity_type, record).await?);
                    }
                    return Ok(refreshed);
                }
                Ok(acks) => {
                    warn!(
                        "批量导入回执数不符: 期望 {} 实际 {}，退化为逐条入队",
                        records.len(),
                        acks.len()
                    );
                }
                Err(e) => {
                    debug!("批量导入远端失败，逐条入队: {}", e);
                }
            }
        }

        for record in &records {
            self.inner
                .storage
                .enqueue_create(entity_type, &record.id, &record.to_remote_payload())
                .await?;
        }
        Ok(records)
    }

    /// 分页拉取远端集合（屏幕首次水合用；离线时报网络错误）
    pub async fn pull(
        &self,
        entity_type: EntityType,
        page: u32,
        page_size: u32,
    ) -> Result<RemotePage> {
        if !self.inner.monitor.snapshot().is_connected {
            return Err(MedisyncSDKError::Network("离线状态无法拉取远端集合".to_string()));
        }
        self.inner.remote.list(entity_type, page, page_size).await
    }
}

impl CoordinatorInner {
    /// 重新读一遍记录（立即同步路径可能已盖上 remote_id/synced）
    async fn refreshed(&self, entity_type: EntityType, fallback: EntityRecord) -> Result<EntityRecord> {
        Ok(self
            .storage
            .get_raw(entity_type, &fallback.id)
            .await?
            .unwrap_or(fallback))
    }

    async fn after_journal_entry(&self, entry: &WriteJournalEntry) -> Result<()> {
        match entry.kind {
            OperationKind::Create => self.after_local_create(entry.entity_type, &entry.record).await,
            OperationKind::Update => self.after_local_update(entry.entity_type, &entry.record).await,
            OperationKind::Delete => self.after_local_delete(entry.entity_type, &entry.record).await,
        }
    }

    /// 本地创建已提交：在线试远端，失败/离线入队
    async fn after_local_create(&self, entity_type: EntityType, record: &EntityRecord) -> Result<()> {
        if self.monitor.snapshot().is_connected {
            match self.remote.create(entity_type, &record.to_remote_payload()).await {
                Ok(ack) => {
                    self.storage.mark_synced(entity_type, &record.id, &ack.id).await?;
                    self.events.emit(SdkEvent::OperationSynced {
                        entity_type,
                        entity_id: record.id.clone(),
                        remote_id: ack.id,
                        op_id: None,
                        timestamp: EventManager::now_ms(),
                    });
                    return Ok(());
                }
                Err(e) if e.is_validation() => {
                    return self.enqueue_terminal(entity_type, record, OperationKind::Create, e).await;
                }
                Err(e) => {
                    debug!("远端创建失败，入队: {}", e);
                }
            }
        }
        self.storage
            .enqueue_create(entity_type, &record.id, &record.to_remote_payload())
            .await?;
        Ok(())
    }

    /// 本地更新已提交：有 remote_id 且在线试远端，否则入队
    ///
    /// remote_id 缺位说明 create 还没送达，入队的 update 会折叠进
    /// 挂起 create 的载荷（队列不增长）。
    async fn after_local_update(&self, entity_type: EntityType, record: &EntityRecord) -> Result<()> {
        if let Some(remote_id) = record.remote_id.as_deref() {
            if self.monitor.snapshot().is_connected {
                match self
                    .remote
                    .update(entity_type, remote_id, &record.to_remote_payload())
                    .await
                {
                    Ok(ack) => {
                        self.storage.mark_synced(entity_type, &record.id, &ack.id).await?;
                        self.events.emit(SdkEvent::OperationSynced {
                            entity_type,
                            entity_id: record.id.clone(),
                            remote_id: ack.id,
                            op_id: None,
                            timestamp: EventManager::now_ms(),
                        });
                        return Ok(());
                    }
                    Err(e) if e.is_validation() => {
                        return self
                            .enqueue_terminal(entity_type, record, OperationKind::Update, e)
                            .await;
                    }
                    Err(e) if e.is_conflict() => {
                        // 写路径上的冲突也走 remote-wins，不打扰调用方；
                        // 覆盖失败（如拉取超时）则退回排队，冲刷时再解
                        let payload = record.to_remote_payload();
                        if self
                            .resolve_conflict(entity_type, &record.id, &payload)
                            .await
                            .is_err()
                        {
                            self.storage
                                .enqueue_update(entity_type, &record.id, &payload)
                                .await?;
                        }
                        return Ok(());
                    }
                    Err(e) => {
                        debug!("远端更新失败，入队: {}", e);
                    }
                }
            }
        }
        self.storage
            .enqueue_update(entity_type, &record.id, &record.to_remote_payload())
            .await?;
        Ok(())
    }

    /// 本地删除已提交：先结清队列（取消挂起 create/update），远端
    /// 认识这条记录才需要发送 delete
    async fn after_local_delete(&self, entity_type: EntityType, record: &EntityRecord) -> Result<()> {
        let op_id = self
            .storage
            .enqueue_delete(
                entity_type,
                &record.id,
                &record.to_remote_payload(),
                record.remote_id.is_some(),
            )
            .await?;

        let Some(op_id) = op_id else {
            return Ok(());
        };
        if self.monitor.snapshot().is_connected {
            let remote_id = record.remote_id.as_deref().unwrap_or_default();
            match self.remote.delete(entity_type, remote_id).await {
                Ok(()) => {
                    self.storage.remove_operation(op_id).await?;
                }
                Err(e) if e.is_validation() => {
                    self.storage.mark_operation_failed(op_id, &e.to_string()).await?;
                    self.events.emit(SdkEvent::OperationFailed {
                        entity_type,
                        entity_id: record.id.clone(),
                        op_id,
                        error: e.to_string(),
                        timestamp: EventManager::now_ms(),
                    });
                }
                Err(e) => {
                    debug!("远端删除失败，留队: {}", e);
                }
            }
        }
        Ok(())
    }

    /// 远端校验拒绝：入队后立即标记终态失败（重试只会原样再被拒）
    async fn enqueue_terminal(
        &self,
        entity_type: EntityType,
        record: &EntityRecord,
        kind: OperationKind,
        error: MedisyncSDKError,
    ) -> Result<()> {
        let payload = record.to_remote_payload();
        let op_id = match kind {
            OperationKind::Create => {
                self.storage.enqueue_create(entity_type, &record.id, &payload).await?
            }
            _ => self.storage.enqueue_update(entity_type, &record.id, &payload).await?,
        };
        self.storage.mark_operation_failed(op_id, &error.to_string()).await?;
        self.events.emit(SdkEvent::OperationFailed {
            entity_type,
            entity_id: record.id.clone(),
            op_id,
            error: error.to_string(),
            timestamp: EventManager::now_ms(),
        });
        Ok(())
    }

    /// 排空挂起队列：严格 op_id 顺序、单列、带退避重试
    async fn flush_pending(&self) -> Result<FlushSummary> {
        let _guard = self.flush_lock.lock().await;
        let mut summary = FlushSummary::default();

        loop {
            // 连通又断了就停，队列原地保留
            if !self.monitor.snapshot().is_connected {
                break;
            }
            let Some(op) = self.storage.first_pending().await? else {
                break;
            };

            // 实体已本地删除 → create/update 取消而非发送
            if matches!(op.kind, OperationKind::Create | OperationKind::Update)
                && !self.storage.exists(op.entity_type, &op.entity_id).await?
            {
                self.storage.remove_operation(op.op_id).await?;
                summary.cancelled += 1;
                debug!("↪️ 操作 {} 已取消（实体已删除）", op.op_id);
                continue;
            }

            let outcome = self.dispatch(&op).await;
            let outcome = match outcome {
                Err(e) if e.is_conflict() => {
                    match self
                        .resolve_conflict(op.entity_type, &op.entity_id, &op.payload)
                        .await
                    {
                        Ok(()) => {
                            self.storage.remove_operation(op.op_id).await?;
                            summary.conflicts += 1;
                            continue;
                        }
                        Err(e2) => Err(e2),
                    }
                }
                other => other,
            };

            match outcome {
                Ok(remote_id) => {
                    if let Some(remote_id) = remote_id.as_deref() {
                        match self.storage.mark_synced(op.entity_type, &op.entity_id, remote_id).await {
                            // 冲刷途中被删掉的实体：同步回执无处可盖，忽略
                            Err(MedisyncSDKError::NotFound(_)) => {}
                            other => other?,
                        }
                        self.events.emit(SdkEvent::OperationSynced {
                            entity_type: op.entity_type,
                            entity_id: op.entity_id.clone(),
                            remote_id: remote_id.to_string(),
                            op_id: Some(op.op_id),
                            timestamp: EventManager::now_ms(),
                        });
                    }
                    self.storage.remove_operation(op.op_id).await?;
                    summary.synced += 1;
                }
                // 本地存储错误：中断本轮冲刷并上抛
                Err(e) if e.is_storage_error() => return Err(e),
                Err(e) => {
                    let reason = FlushFailureReason::from(&e);
                    if !reason.is_retryable() {
                        // 校验拒绝等终态：立即离队并通知界面
                        self.storage.mark_operation_failed(op.op_id, &e.to_string()).await?;
                        self.events.emit(SdkEvent::OperationFailed {
                            entity_type: op.entity_type,
                            entity_id: op.entity_id.clone(),
                            op_id: op.op_id,
                            error: e.to_string(),
                            timestamp: EventManager::now_ms(),
                        });
                        summary.failed += 1;
                        continue;
                    }
                    let attempts = self.storage.record_attempt(op.op_id, &e.to_string()).await?;
                    if attempts >= self.retry_policy.max_attempts {
                        self.storage
                            .mark_operation_failed(op.op_id, &format!("重试 {} 次后放弃: {}", attempts, e))
                            .await?;
                        self.events.emit(SdkEvent::OperationFailed {
                            entity_type: op.entity_type,
                            entity_id: op.entity_id.clone(),
                            op_id: op.op_id,
                            error: e.to_string(),
                            timestamp: EventManager::now_ms(),
                        });
                        summary.failed += 1;
                    } else {
                        // 操作留在队首，退避后重试；sync_now 可打断等待
                        let delay = self.retry_policy.backoff_delay(attempts);
                        debug!(
                            "操作 {} 第 {} 次失败（{:?}），{}ms 后重试",
                            op.op_id,
                            attempts,
                            reason,
                            delay.as_millis()
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.force_notify.notified() => {}
                        }
                    }
                }
            }
        }

        if summary != FlushSummary::default() {
            info!(
                "🔄 冲刷完成: 同步 {} / 失败 {} / 取消 {} / 冲突 {}",
                summary.synced, summary.failed, summary.cancelled, summary.conflicts
            );
        }
        self.events.emit(SdkEvent::QueueDrained {
            synced: summary.synced,
            failed: summary.failed,
            timestamp: EventManager::now_ms(),
        });
        Ok(summary)
    }

    /// 把一条挂起操作发给远端；Ok(Some(id)) 为需要盖章的回执
    async fn dispatch(&self, op: &PendingOperation) -> Result<Option<String>> {
        match op.kind {
            OperationKind::Create => {
                let ack = self.remote.create(op.entity_type, &op.payload).await?;
                Ok(Some(ack.id))
            }
            OperationKind::Update => {
                // remote_id 以当前行为准（入队后可能刚被别的回执盖上）
                let remote_id = self
                    .storage
                    .get_raw(op.entity_type, &op.entity_id)
                    .await?
                    .and_then(|r| r.remote_id)
                    .or_else(|| payload_remote_id(&op.payload));
                match remote_id {
                    Some(remote_id) => {
                        let ack = self.remote.update(op.entity_type, &remote_id, &op.payload).await?;
                        Ok(Some(ack.id))
                    }
                    // 远端还不认识这条记录（create 终态失败过）：按创建送
                    None => {
                        let ack = self.remote.create(op.entity_type, &op.payload).await?;
                        Ok(Some(ack.id))
                    }
                }
            }
            OperationKind::Delete => {
                let Some(remote_id) = payload_remote_id(&op.payload) else {
                    return Ok(None);
                };
                self.remote.delete(op.entity_type, &remote_id).await?;
                Ok(None)
            }
        }
    }

    /// remote-wins：丢弃排队写入，拉远端副本覆盖本地并标记已同步
    async fn resolve_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let remote_id = self
            .storage
            .get_raw(entity_type, entity_id)
            .await?
            .and_then(|r| r.remote_id)
            .or_else(|| payload_remote_id(payload))
            .ok_or_else(|| {
                MedisyncSDKError::Validation("冲突但缺少 remote_id，无法拉取远端副本".to_string())
            })?;
        let remote_copy = self.remote.fetch(entity_type, &remote_id).await?;
        let data = remote_copy
            .get("data")
            .cloned()
            .unwrap_or_else(|| remote_copy.clone());
        self.storage
            .overwrite_from_remote(entity_type, entity_id, &data, &remote_id)
            .await?;
        info!("⚖️ 冲突已按 remote-wins 解决: {} {}", entity_type, entity_id);
        self.events.emit(SdkEvent::ConflictResolved {
            entity_type,
            entity_id: entity_id.to_string(),
            remote_id,
            timestamp: EventManager::now_ms(),
        });
        Ok(())
    }
}

fn payload_remote_id(payload: &Value) -> Option<String> {
    payload
        .get("remote_id")
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::test_support::{test_monitor, ScriptedProbe};
    use crate::connectivity::{ConnectivityMonitor, ProbeError, TransitionKind};
    use crate::error::{MedisyncSDKError, Result};
    use crate::events::{EventManager, SdkEvent};
    use crate::storage::entities::{EntityType, OperationKind};
    use crate::storage::StorageManager;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum MockMode {
        Ok,
        NetworkFail,
        Validation,
        Conflict,
    }

    /// 可编排的内存远端：记录调用顺序，按模式回放结果
    #[derive(Debug)]
    struct MockRemote {
        calls: parking_lot::Mutex<Vec<String>>,
        mode: parking_lot::Mutex<MockMode>,
        next_id: AtomicU64,
        fetch_doc: parking_lot::Mutex<Option<Value>>,
    }

    impl MockRemote {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: parking_lot::Mutex::new(Vec::new()),
                mode: parking_lot::Mutex::new(MockMode::Ok),
                next_id: AtomicU64::new(100),
                fetch_doc: parking_lot::Mutex::new(None),
            })
        }

        fn set_mode(&self, mode: MockMode) {
            *self.mode.lock() = mode;
        }

        fn set_fetch_doc(&self, doc: Value) {
            *self.fetch_doc.lock() = Some(doc);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn outcome(&self, call: String) -> Result<String> {
            self.calls.lock().push(call);
            match *self.mode.lock() {
                MockMode::Ok => Ok(format!("R-{}", self.next_id.fetch_add(1, Ordering::SeqCst))),
                MockMode::NetworkFail => {
                    Err(MedisyncSDKError::Network("connection refused".to_string()))
                }
                MockMode::Validation => {
                    Err(MedisyncSDKError::Validation("400: 载荷缺字段".to_string()))
                }
                MockMode::Conflict => {
                    Err(MedisyncSDKError::Conflict("远端版本更新".to_string()))
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl RemoteService for MockRemote {
        async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<RemoteAck> {
            let local_id = payload["local_id"].as_str().unwrap_or("?").to_string();
            self.outcome(format!("create {} {}", entity_type, local_id))
                .map(|id| RemoteAck { id })
        }

        async fn update(
            &self,
            entity_type: EntityType,
            remote_id: &str,
            _payload: &Value,
        ) -> Result<RemoteAck> {
            self.outcome(format!("update {} {}", entity_type, remote_id))
                .map(|_| RemoteAck {
                    id: remote_id.to_string(),
                })
        }

        async fn delete(&self, entity_type: EntityType, remote_id: &str) -> Result<()> {
            self.outcome(format!("delete {} {}", entity_type, remote_id))
                .map(|_| ())
        }

        async fn fetch(&self, entity_type: EntityType, remote_id: &str) -> Result<Value> {
            self.calls
                .lock()
                .push(format!("fetch {} {}", entity_type, remote_id));
            self.fetch_doc
                .lock()
                .clone()
                .ok_or_else(|| MedisyncSDKError::Network("fetch 不可用".to_string()))
        }

        async fn list(&self, _entity_type: EntityType, page: u32, page_size: u32) -> Result<RemotePage> {
            Ok(RemotePage {
                items: Vec::new(),
                page,
                page_size,
                total: 0,
            })
        }

        async fn bulk_import(
            &self,
            entity_type: EntityType,
            payloads: &[Value],
        ) -> Result<Vec<RemoteAck>> {
            self.outcome(format!("bulk {} x{}", entity_type, payloads.len()))?;
            Ok(payloads
                .iter()
                .map(|_| RemoteAck {
                    id: format!("R-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                })
                .collect())
        }

        async fn validate_session(&self, _token: &str) -> Result<SessionValidation> {
            Ok(SessionValidation {
                valid: true,
                token: None,
                licenses: Vec::new(),
                user_module_access: Vec::new(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        storage: Arc<StorageManager>,
        remote: Arc<MockRemote>,
        monitor: ConnectivityMonitor,
        coordinator: SyncCoordinator,
        events: EventManager,
    }

    async fn fixture(probe: Arc<ScriptedProbe>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageManager::new(dir.path()).await.unwrap());
        let remote = MockRemote::new();
        let monitor = test_monitor(probe);
        let events = EventManager::new(64);
        let retry_policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        };
        let coordinator = SyncCoordinator::new(
            storage.clone(),
            remote.clone() as Arc<dyn RemoteService>,
            monitor.clone(),
            events.clone(),
            retry_policy,
        );
        Fixture {
            _dir: dir,
            storage,
            remote,
            monitor,
            coordinator,
            events,
        }
    }

    #[tokio::test]
    async fn test_online_save_syncs_immediately() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        f.monitor.refresh_status().await; // 上线

        let record = f
            .coordinator
            .save(EntityType::Patient, json!({"full_name": "张三"}))
            .await
            .unwrap();
        assert!(record.synced);
        assert_eq!(record.remote_id.as_deref(), Some("R-100"));
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_creates_flush_in_enqueue_order() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        // 离线期间三次创建
        let mut ids = Vec::new();
        for name in ["甲", "乙", "丙"] {
            let record = f
                .coordinator
                .save(EntityType::Patient, json!({"full_name": name}))
                .await
                .unwrap();
            assert!(!record.synced);
            ids.push(record.id);
        }
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 3);
        assert!(f.remote.calls().is_empty(), "离线时不该碰远端");

        // 上线并冲刷
        f.monitor.refresh_status().await;
        let summary = f.coordinator.flush_pending().await.unwrap();
        assert_eq!(summary.synced, 3);

        // 入队顺序即发送顺序
        let calls = f.remote.calls();
        assert_eq!(calls.len(), 3);
        for (call, id) in calls.iter().zip(&ids) {
            assert_eq!(call, &format!("create patient {}", id));
        }

        // 每条记录都拿到 remote_id 且 synced=true，队列清空
        for id in &ids {
            let record = f.storage.get_raw(EntityType::Patient, id).await.unwrap().unwrap();
            assert!(record.synced);
            assert!(record.remote_id.is_some());
        }
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connected_transition_drives_flush_through_subscription() {
        // 端到端走订阅链路：离线建患者 P；探测连续三次 80ms；connected
        // 恰好发一次；冲刷送出 P 的 create；远端回 R-100；本地盖章、队列空
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        f.coordinator.start();

        let record = f
            .coordinator
            .save(EntityType::Patient, json!({"full_name": "P"}))
            .await
            .unwrap();
        assert!(!record.synced);

        let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = transitions.clone();
        let _subscription = f.monitor.subscribe(move |t| sink.lock().push(t.kind));

        for _ in 0..3 {
            f.monitor.refresh_status().await;
        }
        assert_eq!(&*transitions.lock(), &[TransitionKind::Connected]);

        // 等后台冲刷任务完成
        let mut synced = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let current = f.storage.get_raw(EntityType::Patient, &record.id).await.unwrap().unwrap();
            if current.synced {
                synced = true;
                assert_eq!(current.remote_id.as_deref(), Some("R-100"));
                break;
            }
        }
        assert!(synced, "connected 转换后应自动冲刷");
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);
        f.coordinator.stop();
    }

    #[tokio::test]
    async fn test_update_collapses_into_pending_create() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        let record = f
            .coordinator
            .save(EntityType::Patient, json!({"full_name": "旧名"}))
            .await
            .unwrap();
        f.coordinator
            .save_update(EntityType::Patient, &record.id, json!({"full_name": "新名"}))
            .await
            .unwrap();

        // 队列不增长，折叠后的 create 载荷取最新
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 1);
        let head = f.storage.first_pending().await.unwrap().unwrap();
        assert_eq!(head.kind, OperationKind::Create);
        assert_eq!(head.payload["data"]["full_name"], "新名");

        // 冲刷后只有一次远端调用
        f.monitor.refresh_status().await;
        f.coordinator.flush_pending().await.unwrap();
        assert_eq!(f.remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_cancels_pending_create() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        let record = f
            .coordinator
            .save(EntityType::Patient, json!({"full_name": "临时"}))
            .await
            .unwrap();
        f.coordinator.delete(EntityType::Patient, &record.id).await.unwrap();

        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);
        f.monitor.refresh_status().await;
        f.coordinator.flush_pending().await.unwrap();
        assert!(f.remote.calls().is_empty(), "取消的操作不该被发送");
    }

    #[tokio::test]
    async fn test_terminal_failure_after_max_attempts() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        let record = f
            .coordinator
            .save(EntityType::Patient, json!({"full_name": "倒霉"}))
            .await
            .unwrap();

        f.remote.set_mode(MockMode::NetworkFail);
        f.monitor.refresh_status().await;
        let mut events_rx = f.events.subscribe();
        let summary = f.coordinator.flush_pending().await.unwrap();

        // 第 5 次尝试后标记终态失败并离开活动队列
        assert_eq!(summary.failed, 1);
        assert_eq!(f.remote.calls().len(), 5);
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);
        let failed = f.coordinator.failed_operations().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 5);

        // 实体仍在本地可用，只是未同步
        let current = f.storage.get_raw(EntityType::Patient, &record.id).await.unwrap().unwrap();
        assert!(!current.synced);

        // 界面层收到 OperationFailed
        let mut saw_failed = false;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, SdkEvent::OperationFailed { .. }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_validation_rejection_is_not_retried() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        f.remote.set_mode(MockMode::Validation);
        f.monitor.refresh_status().await;

        // 在线写入：本地成功，远端 4xx → 立即终态失败，不占活动队列
        let record = f
            .coordinator
            .save(EntityType::Invoice, json!({"total_cents": -1}))
            .await
            .unwrap();
        assert_eq!(f.remote.calls().len(), 1, "校验拒绝不该重试");
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);
        assert_eq!(f.coordinator.failed_operations().await.unwrap().len(), 1);
        assert!(f.storage.get_raw(EntityType::Invoice, &record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflict_resolves_remote_wins() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        f.monitor.refresh_status().await;

        // 先正常同步一条
        let record = f
            .coordinator
            .save(EntityType::Patient, json!({"full_name": "本地名", "phone": "1"}))
            .await
            .unwrap();
        let remote_id = record.remote_id.clone().unwrap();

        // 离线改名（远端这边同时也改了）
        f.remote.set_mode(MockMode::Conflict);
        f.remote.set_fetch_doc(json!({
            "id": remote_id.as_str(),
            "data": {"full_name": "远端名", "phone": "2"}
        }));
        // 让 update 入队（断网再改）
        f.remote.set_mode(MockMode::NetworkFail);
        f.coordinator
            .save_update(EntityType::Patient, &record.id, json!({"full_name": "本地改名"}))
            .await
            .unwrap();
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 1);

        // 冲刷时远端报冲突 → 拉副本覆盖本地
        f.remote.set_mode(MockMode::Conflict);
        let summary = f.coordinator.flush_pending().await.unwrap();
        assert_eq!(summary.conflicts, 1);
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);

        let current = f.storage.get_raw(EntityType::Patient, &record.id).await.unwrap().unwrap();
        assert!(current.synced);
        assert_eq!(current.data["full_name"], "远端名");
        assert_eq!(current.data["phone"], "2");
    }

    #[tokio::test]
    async fn test_compound_write_queues_every_step_in_order() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        let patient = f
            .coordinator
            .save(EntityType::Patient, json!({"full_name": "张三"}))
            .await
            .unwrap();

        // 离线复合写入：建就诊 → 建发票 → 加发票行 → 回写患者
        let patient_id = patient.id.clone();
        f.coordinator
            .run_compound(move |store| {
                let encounter = store.create(
                    EntityType::Encounter,
                    json!({"patient_id": patient_id.as_str(), "encounter_type": "outpatient"}),
                )?;
                let invoice = store.create(
                    EntityType::Invoice,
                    json!({"patient_id": patient_id.as_str(), "items": [], "total_cents": 0}),
                )?;
                store.update(
                    EntityType::Invoice,
                    &invoice.id,
                    json!({"items": [{"description": "诊查费", "amount_cents": 2000}], "total_cents": 2000}),
                )?;
                store.update(
                    EntityType::Patient,
                    &patient_id,
                    json!({"last_visit_at": 1_700_000_000_000i64}),
                )?;
                Ok(encounter)
            })
            .await
            .unwrap();

        // 折叠不变量作用于整条队列：发票 update 折进发票 create，
        // 患者回写折进患者还没冲刷的 create → 只剩 3 条
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 3);
        let patient_create = f.storage.first_pending().await.unwrap().unwrap();
        assert_eq!(patient_create.kind, OperationKind::Create);
        assert_eq!(
            patient_create.payload["data"]["last_visit_at"],
            json!(1_700_000_000_000i64)
        );

        f.monitor.refresh_status().await;
        f.coordinator.flush_pending().await.unwrap();
        let calls = f.remote.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("create patient"));
        assert!(calls[1].starts_with("create encounter"));
        assert!(calls[2].starts_with("create invoice"));
    }

    #[tokio::test]
    async fn test_flush_stops_when_connection_drops_again() {
        let probe = ScriptedProbe::new(vec![Ok(80)], Err(ProbeError::Timeout));
        let f = fixture(probe).await;
        f.coordinator
            .save(EntityType::Patient, json!({"full_name": "甲"}))
            .await
            .unwrap();

        f.monitor.refresh_status().await; // 上线
        // 三次失败探测把状态打回离线
        for _ in 0..3 {
            f.monitor.refresh_status().await;
        }
        let summary = f.coordinator.flush_pending().await.unwrap();
        assert_eq!(summary.synced, 0);
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 1, "离线时操作原地保留");
    }

    #[tokio::test]
    async fn test_import_many_uses_bulk_endpoint_when_online() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        f.monitor.refresh_status().await;

        let records = f
            .coordinator
            .import_many(
                EntityType::InventoryItem,
                vec![
                    json!({"name": "阿莫西林", "unit": "盒"}),
                    json!({"name": "布洛芬", "unit": "盒"}),
                ],
            )
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.synced && r.remote_id.is_some()));
        let calls = f.remote.calls();
        assert_eq!(calls, vec!["bulk inventory_item x2".to_string()]);
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_import_many_falls_back_to_queue_when_offline() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        let records = f
            .coordinator
            .import_many(
                EntityType::InventoryItem,
                vec![json!({"name": "纱布", "unit": "包"})],
            )
            .await
            .unwrap();
        assert!(!records[0].synced);
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_now_probes_and_flushes() {
        let f = fixture(ScriptedProbe::always_ok(80)).await;
        f.coordinator
            .save(EntityType::Patient, json!({"full_name": "手动"}))
            .await
            .unwrap();
        // 不等周期探测，手动立即同步
        let summary = f.coordinator.sync_now().await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(f.coordinator.pending_count().await.unwrap(), 0);
    }
}

//! 存储模块 - 离线优先客户端的数据持久化层
//!
//! 采用分层架构设计：
//! - StorageManager: 统一的存储管理器，提供高级 API
//! - DAO Layer: 数据访问层，每张表一个专门的操作模块
//! - Entities: 数据实体定义，类型安全的数据传输
//! - KvStore: 会话凭据等敏感小数据的安全区
//!
//! 本层是唯一允许持久化实体与挂起操作队列的组件；界面层不直接碰
//! SQL。所有写入经由单把连接锁串行执行，配合 `run_atomic` 提供
//! 全有或全无的复合写入。

use chrono::{Datelike, Utc};
use rusqlite::Connection;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{MedisyncSDKError, Result};

pub mod dao;
pub mod entities;
pub mod kv;
pub mod sqlite;

pub use entities::*;

use dao::{EntityDao, QueueDao, SequenceDao};
use kv::KvStore;

/// 存储统计信息（诊断用）
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub entity_counts: Vec<(EntityType, i64)>,
    pub pending_operations: i64,
    pub failed_operations: i64,
}

/// 存储管理器 - LocalStore 的统一入口
///
/// 功能特性：
/// - 完全控制所有数据库操作，外部无法直接访问 SQLite
/// - 提供领域 API，而非裸 SQL 操作
/// - 单号生成与插入同事务
/// - 临床记录读取审计
#[derive(Debug)]
pub struct StorageManager {
    #[allow(dead_code)]
    base_path: PathBuf,
    /// 单写者纪律：一把锁串行所有读写，复合写入期间无人插队
    conn: Arc<Mutex<Connection>>,
    kv: Arc<KvStore>,
    /// 当前操作人（读取审计的 last_accessed_by 来源）
    current_user: Arc<RwLock<Option<String>>>,
}

impl StorageManager {
    /// 创建新的存储管理器
    ///
    /// # 参数
    /// - `base_path`: 本设备数据目录（实体库 + KV 安全区都在其下）
    pub async fn new(base_path: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base_path)
            .await
            .map_err(|e| MedisyncSDKError::IO(format!("创建数据目录失败: {}", e)))?;

        let db_path = base_path.join("medisync.db");
        let conn = sqlite::open_database(&db_path)?;
        let kv = KvStore::new(base_path).await?;

        info!("✅ 本地存储已就绪: {}", db_path.display());

        Ok(Self {
            base_path: base_path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
            kv: Arc::new(kv),
            current_user: Arc::new(RwLock::new(None)),
        })
    }

    /// KV 安全区句柄（SessionManager 专用）
    pub fn kv(&self) -> Arc<KvStore> {
        self.kv.clone()
    }

    /// 设置当前操作人（会话恢复/登录成功后由 SessionManager 调用）
    pub async fn set_current_user(&self, user_id: Option<String>) {
        let mut guard = self.current_user.write().await;
        *guard = user_id;
    }

    pub async fn current_user(&self) -> Option<String> {
        self.current_user.read().await.clone()
    }

    // -----------------------------------------------------------------------
    // 实体 CRUD
    // -----------------------------------------------------------------------

    /// 创建实体：分配 id 与单号、打戳、synced=false
    ///
    /// 只会因底层 I/O 失败而报错（业务校验是调用方的事）。
    pub async fn create(&self, entity_type: EntityType, data: Value) -> Result<EntityRecord> {
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;
        let record = {
            let year = Utc::now().year();
            let entity_number = SequenceDao::new(&tx).next_number(entity_type, year)?;
            let record = EntityRecord::new(data, entity_number);
            EntityDao::new(&tx, entity_type).insert(&record)?;
            record
        };
        tx.commit()?;
        debug!("📝 已创建 {} {}", entity_type, record.id);
        Ok(record)
    }

    /// 读取实体；临床记录（患者、就诊）作为副作用记读取审计
    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<EntityRecord>> {
        let accessed_by = self.current_user().await;
        let conn = self.conn.lock().await;
        let dao = EntityDao::new(&conn, entity_type);
        if entity_type.is_clinical() {
            dao.touch_access(id, accessed_by.as_deref())?;
        }
        dao.get(id)
    }

    /// 无审计读取（同步层内部用，不算"查看记录"）
    pub async fn get_raw(&self, entity_type: EntityType, id: &str) -> Result<Option<EntityRecord>> {
        let conn = self.conn.lock().await;
        EntityDao::new(&conn, entity_type).get(id)
    }

    /// 合并 patch 到已存载荷，刷新 updated_at，synced 回退 false
    pub async fn update(&self, entity_type: EntityType, id: &str, patch: Value) -> Result<EntityRecord> {
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;
        let record = {
            let dao = EntityDao::new(&tx, entity_type);
            let existing = dao.get(id)?.ok_or_else(|| {
                MedisyncSDKError::NotFound(format!("{} {}", entity_type, id))
            })?;
            let merged = merge_json(existing.data.clone(), patch);
            let now = Utc::now().timestamp_millis();
            dao.update_payload(id, &merged, now)?;
            EntityRecord {
                data: merged,
                updated_at: now,
                synced: false,
                ..existing
            }
        };
        tx.commit()?;
        Ok(record)
    }

    /// 删除实体，返回删除前的记录（同步层需要知道 remote_id）
    pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<EntityRecord> {
        let conn = self.conn.lock().await;
        let dao = EntityDao::new(&conn, entity_type);
        let existing = dao
            .get(id)?
            .ok_or_else(|| MedisyncSDKError::NotFound(format!("{} {}", entity_type, id)))?;
        dao.delete(id)?;
        Ok(existing)
    }

    pub async fn exists(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        EntityDao::new(&conn, entity_type).exists(id)
    }

    /// 线性扫描查询（屏幕列表用，如按患者过滤就诊）
    pub async fn list_by<F>(&self, entity_type: EntityType, predicate: F) -> Result<Vec<EntityRecord>>
    where
        F: Fn(&EntityRecord) -> bool,
    {
        let conn = self.conn.lock().await;
        let all = EntityDao::new(&conn, entity_type).list_all()?;
        Ok(all.into_iter().filter(|r| predicate(r)).collect())
    }

    /// 远端确认后盖章（SyncCoordinator 专用，唯一的 synced 写入方）
    pub async fn mark_synced(&self, entity_type: EntityType, id: &str, remote_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        EntityDao::new(&conn, entity_type).mark_synced(id, remote_id)
    }

    /// remote-wins：远端副本覆盖本地并标记已同步（SyncCoordinator 专用）
    pub async fn overwrite_from_remote(
        &self,
        entity_type: EntityType,
        id: &str,
        data: &Value,
        remote_id: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let dao = EntityDao::new(&conn, entity_type);
        if dao.exists(id)? {
            dao.overwrite_from_remote(id, data, remote_id)
        } else {
            // 本地已删但远端仍在：按 remote-wins 复活
            let now = Utc::now().timestamp_millis();
            let record = EntityRecord {
                id: id.to_string(),
                entity_number: None,
                remote_id: Some(remote_id.to_string()),
                synced: true,
                created_at: now,
                updated_at: now,
                access_count: 0,
                last_accessed_at: None,
                last_accessed_by: None,
                data: data.clone(),
            };
            dao.insert(&record)
        }
    }

    // -----------------------------------------------------------------------
    // 复合原子写入
    // -----------------------------------------------------------------------

    /// 把一串本地写入当作单个全有或全无的单元执行
    ///
    /// 闭包内通过 [`AtomicStore`] 读写；任何一步返回错误（包括
    /// `require` 前置条件查找失败）都会回滚整个事务，读者看不到
    /// 半成品状态。闭包是同步的：本地写入视为非挂起点。
    pub async fn run_atomic<F, R>(&self, steps: F) -> Result<R>
    where
        F: FnOnce(&AtomicStore<'_>) -> Result<R>,
    {
        self.run_atomic_journaled(steps).await.map(|(result, _)| result)
    }

    /// 同 [`run_atomic`](Self::run_atomic)，另外返回提交成功的写入流水
    /// （SyncCoordinator 据此补做远端同步/入队）
    pub async fn run_atomic_journaled<F, R>(&self, steps: F) -> Result<(R, Vec<WriteJournalEntry>)>
    where
        F: FnOnce(&AtomicStore<'_>) -> Result<R>,
    {
        let accessed_by = self.current_user().await;
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;
        let view = AtomicStore {
            conn: &tx,
            accessed_by,
            journal: std::cell::RefCell::new(Vec::new()),
        };
        match steps(&view) {
            Ok(result) => {
                let journal = view.journal.into_inner();
                tx.commit()?;
                Ok((result, journal))
            }
            Err(e) => {
                // Transaction 默认 Drop 即回滚；显式一点
                drop(tx);
                debug!("↩️ 复合写入回滚: {}", e);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // 挂起操作队列（SyncCoordinator 专用）
    // -----------------------------------------------------------------------

    pub async fn enqueue_create(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).enqueue_create(entity_type, entity_id, payload)
    }

    pub async fn enqueue_update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).enqueue_update(entity_type, entity_id, payload)
    }

    pub async fn enqueue_delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
        known_to_remote: bool,
    ) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).enqueue_delete(entity_type, entity_id, payload, known_to_remote)
    }

    pub async fn first_pending(&self) -> Result<Option<PendingOperation>> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).first_pending()
    }

    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).pending_operations()
    }

    pub async fn failed_operations(&self) -> Result<Vec<PendingOperation>> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).failed_operations()
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).pending_count()
    }

    pub async fn remove_operation(&self, op_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).remove(op_id)
    }

    pub async fn record_attempt(&self, op_id: i64, error: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).record_attempt(op_id, error)
    }

    pub async fn mark_operation_failed(&self, op_id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        QueueDao::new(&conn).mark_failed(op_id, error)
    }

    /// 诊断统计
    pub async fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn.lock().await;
        let mut entity_counts = Vec::new();
        for entity_type in EntityType::all() {
            entity_counts.push((entity_type, EntityDao::new(&conn, entity_type).count()?));
        }
        let queue = QueueDao::new(&conn);
        Ok(StorageStats {
            entity_counts,
            pending_operations: queue.pending_count()?,
            failed_operations: queue.failed_operations()?.len() as i64,
        })
    }
}

/// 复合写入中一步成功的写入（提交后交给同步层处理）
#[derive(Debug, Clone)]
pub struct WriteJournalEntry {
    pub entity_type: EntityType,
    pub kind: OperationKind,
    pub record: EntityRecord,
}

/// 复合写入的事务视图 - 与 StorageManager 同语义的同步 API
///
/// 只在 `run_atomic` 闭包的生命周期内有效。
pub struct AtomicStore<'a> {
    conn: &'a Connection,
    accessed_by: Option<String>,
    journal: std::cell::RefCell<Vec<WriteJournalEntry>>,
}

impl<'a> AtomicStore<'a> {
    fn record_write(&self, entity_type: EntityType, kind: OperationKind, record: &EntityRecord) {
        self.journal.borrow_mut().push(WriteJournalEntry {
            entity_type,
            kind,
            record: record.clone(),
        });
    }

    /// 创建实体（与 [`StorageManager::create`] 同语义）
    pub fn create(&self, entity_type: EntityType, data: Value) -> Result<EntityRecord> {
        let year = Utc::now().year();
        let entity_number = SequenceDao::new(self.conn).next_number(entity_type, year)?;
        let record = EntityRecord::new(data, entity_number);
        EntityDao::new(self.conn, entity_type).insert(&record)?;
        self.record_write(entity_type, OperationKind::Create, &record);
        Ok(record)
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<EntityRecord>> {
        let dao = EntityDao::new(self.conn, entity_type);
        if entity_type.is_clinical() {
            dao.touch_access(id, self.accessed_by.as_deref())?;
        }
        dao.get(id)
    }

    /// 前置条件查找：缺失即 NotFound，使整个复合写入回滚
    pub fn require(&self, entity_type: EntityType, id: &str) -> Result<EntityRecord> {
        self.get(entity_type, id)?
            .ok_or_else(|| MedisyncSDKError::NotFound(format!("{} {}", entity_type, id)))
    }

    pub fn update(&self, entity_type: EntityType, id: &str, patch: Value) -> Result<EntityRecord> {
        let dao = EntityDao::new(self.conn, entity_type);
        let existing = dao
            .get(id)?
            .ok_or_else(|| MedisyncSDKError::NotFound(format!("{} {}", entity_type, id)))?;
        let merged = merge_json(existing.data.clone(), patch);
        let now = Utc::now().timestamp_millis();
        dao.update_payload(id, &merged, now)?;
        let updated = EntityRecord {
            data: merged,
            updated_at: now,
            synced: false,
            ..existing
        };
        self.record_write(entity_type, OperationKind::Update, &updated);
        Ok(updated)
    }

    pub fn delete(&self, entity_type: EntityType, id: &str) -> Result<EntityRecord> {
        let dao = EntityDao::new(self.conn, entity_type);
        let existing = dao
            .get(id)?
            .ok_or_else(|| MedisyncSDKError::NotFound(format!("{} {}", entity_type, id)))?;
        dao.delete(id)?;
        self.record_write(entity_type, OperationKind::Delete, &existing);
        Ok(existing)
    }
}

/// 浅合并：patch 的对象键覆盖进原载荷；非对象则整体替换
fn merge_json(mut base: Value, patch: Value) -> Value {
    match (&mut base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                base_map.insert(key, value);
            }
            base
        }
        (_, replacement) => replacement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MedisyncSDKError;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, StorageManager) {
        let temp_dir = TempDir::new().unwrap();
        let store = StorageManager::new(temp_dir.path()).await.unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_create_assigns_number_and_envelope() {
        let (_dir, store) = test_store().await;
        let record = store
            .create(EntityType::Patient, json!({"full_name": "李四"}))
            .await
            .unwrap();
        assert!(record.entity_number.as_deref().unwrap().starts_with("PT"));
        assert!(!record.synced);

        let second = store
            .create(EntityType::Patient, json!({"full_name": "王五"}))
            .await
            .unwrap();
        assert_ne!(record.entity_number, second.entity_number);
    }

    #[tokio::test]
    async fn test_clinical_read_audits_access() {
        let (_dir, store) = test_store().await;
        store.set_current_user(Some("dr.chen".to_string())).await;
        let record = store
            .create(EntityType::Patient, json!({"full_name": "李四"}))
            .await
            .unwrap();

        let loaded = store.get(EntityType::Patient, &record.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_count, 1);
        assert_eq!(loaded.last_accessed_by.as_deref(), Some("dr.chen"));

        // 非临床实体不记审计
        let invoice = store
            .create(EntityType::Invoice, json!({"total_cents": 0}))
            .await
            .unwrap();
        let loaded = store.get(EntityType::Invoice, &invoice.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_count, 0);
    }

    #[tokio::test]
    async fn test_update_merges_patch() {
        let (_dir, store) = test_store().await;
        let record = store
            .create(EntityType::Patient, json!({"full_name": "李四", "phone": "135"}))
            .await
            .unwrap();
        let updated = store
            .update(EntityType::Patient, &record.id, json!({"phone": "138"}))
            .await
            .unwrap();
        assert_eq!(updated.data["full_name"], "李四");
        assert_eq!(updated.data["phone"], "138");
        assert!(!updated.synced);
        assert!(updated.updated_at >= record.updated_at);
    }

    #[tokio::test]
    async fn test_run_atomic_rolls_back_all_steps() {
        let (_dir, store) = test_store().await;
        let patient = store
            .create(EntityType::Patient, json!({"full_name": "李四"}))
            .await
            .unwrap();

        // 就诊 → 发票 → 发票行 → 回写患者；中途 require 一个不存在的
        // 机构，四步必须一起消失
        let result = store
            .run_atomic(|s| {
                let encounter = s.create(
                    EntityType::Encounter,
                    json!({"patient_id": patient.id.as_str(), "encounter_type": "outpatient"}),
                )?;
                let invoice = s.create(
                    EntityType::Invoice,
                    json!({"patient_id": patient.id.as_str(), "items": [], "total_cents": 0}),
                )?;
                s.update(
                    EntityType::Invoice,
                    &invoice.id,
                    json!({"items": [{"description": "挂号费", "amount_cents": 500}], "total_cents": 500}),
                )?;
                s.update(
                    EntityType::Patient,
                    &patient.id,
                    json!({"last_visit_at": 1_700_000_000_000i64}),
                )?;
                s.require(EntityType::Organization, "missing-org")?;
                Ok(encounter)
            })
            .await;

        assert!(matches!(result, Err(MedisyncSDKError::NotFound(_))));
        let encounters = store.list_by(EntityType::Encounter, |_| true).await.unwrap();
        assert_eq!(encounters.len(), 0, "回滚后不应有就诊记录");
        let invoices = store.list_by(EntityType::Invoice, |_| true).await.unwrap();
        assert_eq!(invoices.len(), 0);
        let reloaded = store.get(EntityType::Patient, &patient.id).await.unwrap().unwrap();
        assert!(reloaded.data.get("last_visit_at").is_none());
    }

    #[tokio::test]
    async fn test_run_atomic_commits_on_success() {
        let (_dir, store) = test_store().await;
        let patient = store
            .create(EntityType::Patient, json!({"full_name": "李四"}))
            .await
            .unwrap();
        store
            .run_atomic(|s| {
                s.create(
                    EntityType::Encounter,
                    json!({"patient_id": patient.id.as_str(), "encounter_type": "outpatient"}),
                )?;
                s.update(
                    EntityType::Patient,
                    &patient.id,
                    json!({"last_visit_at": 1_700_000_000_000i64}),
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let encounters = store.list_by(EntityType::Encounter, |_| true).await.unwrap();
        assert_eq!(encounters.len(), 1);
    }

    #[tokio::test]
    async fn test_list_by_predicate_filters() {
        let (_dir, store) = test_store().await;
        let p1 = store
            .create(EntityType::Patient, json!({"full_name": "a"}))
            .await
            .unwrap();
        store
            .create(EntityType::Encounter, json!({"patient_id": p1.id.as_str()}))
            .await
            .unwrap();
        store
            .create(EntityType::Encounter, json!({"patient_id": "someone-else"}))
            .await
            .unwrap();

        let for_p1 = store
            .list_by(EntityType::Encounter, |r| r.data["patient_id"] == json!(p1.id.clone()))
            .await
            .unwrap();
        assert_eq!(for_p1.len(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_from_remote_resurrects_deleted_row() {
        let (_dir, store) = test_store().await;
        let record = store
            .create(EntityType::Invoice, json!({"status": "draft"}))
            .await
            .unwrap();
        store.delete(EntityType::Invoice, &record.id).await.unwrap();

        store
            .overwrite_from_remote(EntityType::Invoice, &record.id, &json!({"status": "paid"}), "R-9")
            .await
            .unwrap();
        let restored = store.get(EntityType::Invoice, &record.id).await.unwrap().unwrap();
        assert!(restored.synced);
        assert_eq!(restored.remote_id.as_deref(), Some("R-9"));
        assert_eq!(restored.data["status"], "paid");
    }
}

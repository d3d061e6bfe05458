//! 挂起操作队列访问层 - 同步队列的持久化形态
//!
//! 队列只由 SyncCoordinator 驱动；本模块负责：
//! - 入队（含 create 折叠不变量）
//! - 按 op_id 顺序取队首
//! - 重试计数与终态失败标记
//!
//! 折叠不变量：同一实体最多一条挂起 create；create 尚未冲刷时入队的
//! update 直接替换该 create 的载荷（op_id 与 kind 不变），远端看到的
//! 请求数不会多于本地必需的不同状态数。

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{MedisyncSDKError, Result};
use crate::storage::entities::{
    EntityType, OperationKind, OperationStatus, PendingOperation,
};

pub struct QueueDao<'a> {
    conn: &'a Connection,
}

impl<'a> QueueDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
        let entity_type_text: String = row.get(1)?;
        let kind_text: String = row.get(3)?;
        let status_text: String = row.get(7)?;
        let payload_text: String = row.get(4)?;

        let parse_err = |idx: usize, msg: &str| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                msg.to_string().into(),
            )
        };

        Ok(PendingOperation {
            op_id: row.get(0)?,
            entity_type: EntityType::from_str(&entity_type_text)
                .map_err(|_| parse_err(1, "未知实体类型"))?,
            entity_id: row.get(2)?,
            kind: OperationKind::from_str(&kind_text).map_err(|_| parse_err(3, "未知操作类型"))?,
            payload: serde_json::from_str::<Value>(&payload_text)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                ))?,
            attempts: row.get::<_, i64>(5)? as u32,
            last_error: row.get(6)?,
            status: OperationStatus::from_str(&status_text)
                .map_err(|_| parse_err(7, "未知操作状态"))?,
            enqueued_at: row.get(8)?,
        })
    }

    const COLUMNS: &'static str =
        "op_id, entity_type, entity_id, kind, payload, attempts, last_error, status, enqueued_at";

    fn insert(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: OperationKind,
        payload: &Value,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO pending_operations (entity_type, entity_id, kind, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entity_type.as_str(),
                entity_id,
                kind.as_str(),
                serde_json::to_string(payload)?,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// 该实体是否有挂起 create，有则返回其 op_id
    pub fn find_pending_create(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT op_id FROM pending_operations
                 WHERE entity_type = ?1 AND entity_id = ?2 AND kind = 'create' AND status = 'pending'",
                params![entity_type.as_str(), entity_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// 入队 create（调用方保证同一实体不会重复 create）
    pub fn enqueue_create(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<i64> {
        if self.find_pending_create(entity_type, entity_id)?.is_some() {
            return Err(MedisyncSDKError::AlreadyExists(format!(
                "pending create for {} {}",
                entity_type, entity_id
            )));
        }
        self.insert(entity_type, entity_id, OperationKind::Create, payload)
    }

    /// 入队 update；若存在挂起 create 则折叠进去（替换载荷，队列不增长）
    pub fn enqueue_update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
    ) -> Result<i64> {
        if let Some(create_op_id) = self.find_pending_create(entity_type, entity_id)? {
            self.conn.execute(
                "UPDATE pending_operations SET payload = ?2 WHERE op_id = ?1",
                params![create_op_id, serde_json::to_string(payload)?],
            )?;
            return Ok(create_op_id);
        }
        self.insert(entity_type, entity_id, OperationKind::Update, payload)
    }

    /// 入队 delete：先取消该实体所有挂起 create/update；若远端从未见过
    /// 这条记录（create 被取消），delete 本身也无需发送，返回 None。
    pub fn enqueue_delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
        known_to_remote: bool,
    ) -> Result<Option<i64>> {
        let had_pending_create = self.find_pending_create(entity_type, entity_id)?.is_some();
        self.conn.execute(
            "DELETE FROM pending_operations
             WHERE entity_type = ?1 AND entity_id = ?2 AND status = 'pending'",
            params![entity_type.as_str(), entity_id],
        )?;

        if !known_to_remote || had_pending_create {
            return Ok(None);
        }
        Ok(Some(self.insert(
            entity_type,
            entity_id,
            OperationKind::Delete,
            payload,
        )?))
    }

    /// 活动队列队首（op_id 最小的 pending 行）
    pub fn first_pending(&self) -> Result<Option<PendingOperation>> {
        let sql = format!(
            "SELECT {} FROM pending_operations WHERE status = 'pending' ORDER BY op_id LIMIT 1",
            Self::COLUMNS
        );
        Ok(self.conn.query_row(&sql, [], Self::map_row).optional()?)
    }

    /// 全部活动操作（按冲刷顺序）
    pub fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        let sql = format!(
            "SELECT {} FROM pending_operations WHERE status = 'pending' ORDER BY op_id",
            Self::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_row)?;
        let mut ops = Vec::new();
        for row in rows {
            ops.push(row?);
        }
        Ok(ops)
    }

    /// 终态失败的操作（界面层展示同步错误用）
    pub fn failed_operations(&self) -> Result<Vec<PendingOperation>> {
        let sql = format!(
            "SELECT {} FROM pending_operations WHERE status = 'failed' ORDER BY op_id",
            Self::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_row)?;
        let mut ops = Vec::new();
        for row in rows {
            ops.push(row?);
        }
        Ok(ops)
    }

    pub fn pending_count(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?)
    }

    /// 冲刷尝试失败：attempts 自增并记录错误，返回新的尝试次数
    pub fn record_attempt(&self, op_id: i64, error: &str) -> Result<u32> {
        let changed = self.conn.execute(
            "UPDATE pending_operations SET attempts = attempts + 1, last_error = ?2 WHERE op_id = ?1",
            params![op_id, error],
        )?;
        if changed == 0 {
            return Err(MedisyncSDKError::NotFound(format!("operation {}", op_id)));
        }
        Ok(self.conn.query_row(
            "SELECT attempts FROM pending_operations WHERE op_id = ?1",
            params![op_id],
            |row| row.get::<_, i64>(0),
        )? as u32)
    }

    /// 标记终态失败：离开活动队列但保留行供界面查询
    pub fn mark_failed(&self, op_id: i64, error: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE pending_operations SET status = 'failed', last_error = ?2 WHERE op_id = ?1",
            params![op_id, error],
        )?;
        if changed == 0 {
            return Err(MedisyncSDKError::NotFound(format!("operation {}", op_id)));
        }
        Ok(())
    }

    /// 冲刷成功（或操作被取消）后移除
    pub fn remove(&self, op_id: i64) -> Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM pending_operations WHERE op_id = ?1", params![op_id])?
            > 0)
    }
}

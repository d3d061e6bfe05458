//! 实体信封表访问层 - 封装所有实体行的数据库操作
//!
//! 功能包括：
//! - 信封记录的增删改查
//! - 读取审计（access_count / last_accessed_*）
//! - 同步回执落库（remote_id / synced）
//! - remote-wins 覆盖写入

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::{MedisyncSDKError, Result};
use crate::storage::entities::{EntityRecord, EntityType};

/// 实体信封数据访问对象（一个实例绑定一类实体）
pub struct EntityDao<'a> {
    conn: &'a Connection,
    entity_type: EntityType,
}

impl<'a> EntityDao<'a> {
    pub fn new(conn: &'a Connection, entity_type: EntityType) -> Self {
        Self { conn, entity_type }
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<EntityRecord> {
        let data_text: String = row.get(9)?;
        let data: Value = serde_json::from_str(&data_text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(EntityRecord {
            id: row.get(0)?,
            entity_number: row.get(1)?,
            remote_id: row.get(2)?,
            synced: row.get::<_, i64>(3)? != 0,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            access_count: row.get(6)?,
            last_accessed_at: row.get(7)?,
            last_accessed_by: row.get(8)?,
            data,
        })
    }

    const COLUMNS: &'static str = "id, entity_number, remote_id, synced, created_at, updated_at, \
                                   access_count, last_accessed_at, last_accessed_by, data";

    /// 插入新信封记录
    pub fn insert(&self, record: &EntityRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            self.entity_type.table_name(),
            Self::COLUMNS
        );
        self.conn.execute(
            &sql,
            params![
                record.id,
                record.entity_number,
                record.remote_id,
                record.synced as i64,
                record.created_at,
                record.updated_at,
                record.access_count,
                record.last_accessed_at,
                record.last_accessed_by,
                serde_json::to_string(&record.data)?,
            ],
        )?;
        Ok(())
    }

    /// 按 id 读取，不触发审计
    pub fn get(&self, id: &str) -> Result<Option<EntityRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            Self::COLUMNS,
            self.entity_type.table_name()
        );
        Ok(self
            .conn
            .query_row(&sql, params![id], Self::map_row)
            .optional()?)
    }

    /// 记读取审计：access_count 自增、刷新最后访问时间与访问人
    pub fn touch_access(&self, id: &str, accessed_by: Option<&str>) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET access_count = access_count + 1,
                           last_accessed_at = ?2,
                           last_accessed_by = COALESCE(?3, last_accessed_by)
             WHERE id = ?1",
            self.entity_type.table_name()
        );
        self.conn
            .execute(&sql, params![id, Utc::now().timestamp_millis(), accessed_by])?;
        Ok(())
    }

    /// 本地变更载荷：刷新 updated_at、回退 synced=false
    pub fn update_payload(&self, id: &str, data: &Value, updated_at: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET data = ?2, updated_at = ?3, synced = 0 WHERE id = ?1",
            self.entity_type.table_name()
        );
        let changed = self
            .conn
            .execute(&sql, params![id, serde_json::to_string(data)?, updated_at])?;
        if changed == 0 {
            return Err(MedisyncSDKError::NotFound(format!(
                "{} {}",
                self.entity_type, id
            )));
        }
        Ok(())
    }

    /// 远端确认后盖章：remote_id + synced=true
    pub fn mark_synced(&self, id: &str, remote_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET remote_id = ?2, synced = 1 WHERE id = ?1",
            self.entity_type.table_name()
        );
        let changed = self.conn.execute(&sql, params![id, remote_id])?;
        if changed == 0 {
            return Err(MedisyncSDKError::NotFound(format!(
                "{} {}",
                self.entity_type, id
            )));
        }
        Ok(())
    }

    /// remote-wins 冲突处理：远端副本整体覆盖本地载荷，并标记已同步
    pub fn overwrite_from_remote(&self, id: &str, data: &Value, remote_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET data = ?2, remote_id = ?3, synced = 1, updated_at = ?4 WHERE id = ?1",
            self.entity_type.table_name()
        );
        let changed = self.conn.execute(
            &sql,
            params![
                id,
                serde_json::to_string(data)?,
                remote_id,
                Utc::now().timestamp_millis()
            ],
        )?;
        if changed == 0 {
            return Err(MedisyncSDKError::NotFound(format!(
                "{} {}",
                self.entity_type, id
            )));
        }
        Ok(())
    }

    /// 删除记录，返回是否确实删到了行
    pub fn delete(&self, id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.entity_type.table_name());
        Ok(self.conn.execute(&sql, params![id])? > 0)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE id = ?1",
            self.entity_type.table_name()
        );
        Ok(self
            .conn
            .query_row(&sql, params![id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// 全表扫描（屏幕查询在上层用谓词过滤）
    pub fn list_all(&self) -> Result<Vec<EntityRecord>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY created_at",
            Self::COLUMNS,
            self.entity_type.table_name()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.entity_type.table_name());
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }
}

//! SQLite 基础设施 - 建库、建表与连接参数
//!
//! 本层 schema 固定（每类实体一张信封表 + 挂起操作队列 + 单号计数器），
//! 启动时用 `CREATE TABLE IF NOT EXISTS` 引导，不走迁移链。

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::storage::entities::EntityType;

/// 当前 schema 版本（记录在 user_version，升级时校验）
pub const SCHEMA_VERSION: i64 = 1;

/// 打开（或创建）本地数据库并完成引导
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // WAL 模式：读不阻塞写；journal_mode pragma 会返回一行结果
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;

    create_tables(&conn)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    Ok(conn)
}

/// 建表：实体信封表（每类一张）、挂起操作队列、单号计数器
pub fn create_tables(conn: &Connection) -> Result<()> {
    for entity_type in EntityType::all() {
        // 信封列固定，业务载荷整体放 data（JSON 文本）
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id               TEXT PRIMARY KEY,
                entity_number    TEXT,
                remote_id        TEXT,
                synced           INTEGER NOT NULL DEFAULT 0,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL,
                access_count     INTEGER NOT NULL DEFAULT 0,
                last_accessed_at INTEGER,
                last_accessed_by TEXT,
                data             TEXT NOT NULL
            )",
            entity_type.table_name()
        );
        conn.execute(&sql, [])?;

        let index_sql = format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_synced ON {t} (synced)",
            t = entity_type.table_name()
        );
        conn.execute(&index_sql, [])?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pending_operations (
            op_id       INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id   TEXT NOT NULL,
            kind        TEXT NOT NULL,
            payload     TEXT NOT NULL,
            attempts    INTEGER NOT NULL DEFAULT 0,
            last_error  TEXT,
            status      TEXT NOT NULL DEFAULT 'pending',
            enqueued_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pending_entity
         ON pending_operations (entity_type, entity_id, status)",
        [],
    )?;

    // 单号计数器：按实体类型 + 两位年独立计数
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sequences (
            entity_type TEXT NOT NULL,
            year        INTEGER NOT NULL,
            counter     INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entity_type, year)
        )",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_database_creates_all_tables() {
        let temp_dir = TempDir::new().unwrap();
        let conn = open_database(&temp_dir.path().join("medisync.db")).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        for entity_type in EntityType::all() {
            assert!(
                tables.contains(&entity_type.table_name().to_string()),
                "缺少实体表: {}",
                entity_type
            );
        }
        assert!(tables.contains(&"pending_operations".to_string()));
        assert!(tables.contains(&"sequences".to_string()));
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("medisync.db");
        drop(open_database(&path).unwrap());
        // 第二次打开走 IF NOT EXISTS，不应报错
        let conn = open_database(&path).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}

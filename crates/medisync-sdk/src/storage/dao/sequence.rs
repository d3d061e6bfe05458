//! 单号计数器访问层 - 面向人的序列编号
//!
//! 编号形如 `PT26-00042`：前缀 + 两位年 + 零填充计数。计数按
//! （实体类型，年份）独立，只保证本地存储内唯一；多设备同机构
//! 离线并行可能撞号（无中央分配器），远端 id 才是权威身份。

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::storage::entities::EntityType;

pub struct SequenceDao<'a> {
    conn: &'a Connection,
}

impl<'a> SequenceDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 取下一个计数值（调用方须在事务内使用，保证与插入同生共死）
    pub fn next_counter(&self, entity_type: EntityType, year: i32) -> Result<i64> {
        let changed = self.conn.execute(
            "UPDATE sequences SET counter = counter + 1 WHERE entity_type = ?1 AND year = ?2",
            params![entity_type.as_str(), year],
        )?;
        if changed == 0 {
            self.conn.execute(
                "INSERT INTO sequences (entity_type, year, counter) VALUES (?1, ?2, 1)",
                params![entity_type.as_str(), year],
            )?;
        }
        Ok(self.conn.query_row(
            "SELECT counter FROM sequences WHERE entity_type = ?1 AND year = ?2",
            params![entity_type.as_str(), year],
            |row| row.get(0),
        )?)
    }

    /// 生成格式化单号；该类实体不编号时返回 None
    pub fn next_number(&self, entity_type: EntityType, year: i32) -> Result<Option<String>> {
        let Some(prefix) = entity_type.number_prefix() else {
            return Ok(None);
        };
        let counter = self.next_counter(entity_type, year)?;
        Ok(Some(format!("{}{:02}-{:05}", prefix, year % 100, counter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::EntityType;
    use crate::storage::sqlite::open_database;
    use tempfile::TempDir;

    #[test]
    fn test_counter_is_per_type_per_year() {
        let temp_dir = TempDir::new().unwrap();
        let conn = open_database(&temp_dir.path().join("test.db")).unwrap();
        let dao = SequenceDao::new(&conn);

        assert_eq!(
            dao.next_number(EntityType::Patient, 2026).unwrap().unwrap(),
            "PT26-00001"
        );
        assert_eq!(
            dao.next_number(EntityType::Patient, 2026).unwrap().unwrap(),
            "PT26-00002"
        );
        // 不同实体类型、不同年份各自独立
        assert_eq!(
            dao.next_number(EntityType::Invoice, 2026).unwrap().unwrap(),
            "INV26-00001"
        );
        assert_eq!(
            dao.next_number(EntityType::Patient, 2027).unwrap().unwrap(),
            "PT27-00001"
        );
    }

    #[test]
    fn test_unnumbered_types_get_none() {
        let temp_dir = TempDir::new().unwrap();
        let conn = open_database(&temp_dir.path().join("test.db")).unwrap();
        let dao = SequenceDao::new(&conn);
        assert!(dao
            .next_number(EntityType::Organization, 2026)
            .unwrap()
            .is_none());
    }
}

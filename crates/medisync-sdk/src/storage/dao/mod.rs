//! 数据访问层 - 每张表一个专门的操作模块
//!
//! DAO 只做 SQL 与行映射，不做业务决策；全部以 `&Connection` 借用方式
//! 工作，事务边界由上层 StorageManager 控制。

pub mod entity;
pub mod queue;
pub mod sequence;

pub use entity::EntityDao;
pub use queue::QueueDao;
pub use sequence::SequenceDao;

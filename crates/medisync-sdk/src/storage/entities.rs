//! 数据实体定义 - 类型安全的数据传输
//!
//! 同步层只理解实体信封（envelope）：本地 id、远端 id、synced 标记、
//! 时间戳与读取审计字段。业务载荷（患者、就诊、发票等）对本层是
//! 不透明的 JSON，由上层界面/表单负责解释。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// 实体类型（受控枚举，新增需同时升级本地 schema 与服务端集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Patient,
    Encounter,
    Invoice,
    InventoryItem,
    License,
    Organization,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Encounter => "encounter",
            Self::Invoice => "invoice",
            Self::InventoryItem => "inventory_item",
            Self::License => "license",
            Self::Organization => "organization",
        }
    }

    /// 本地 SQLite 表名（每类实体一张信封表）
    pub fn table_name(self) -> &'static str {
        self.as_str()
    }

    /// 远端 REST 集合路径（`/api/{collection}`）
    pub fn collection(self) -> &'static str {
        match self {
            Self::Patient => "patients",
            Self::Encounter => "encounters",
            Self::Invoice => "invoices",
            Self::InventoryItem => "inventory-items",
            Self::License => "licenses",
            Self::Organization => "organizations",
        }
    }

    /// 面向人的单号前缀；None 表示该类实体不编号
    pub fn number_prefix(self) -> Option<&'static str> {
        match self {
            Self::Patient => Some("PT"),
            Self::Encounter => Some("EN"),
            Self::Invoice => Some("INV"),
            _ => None,
        }
    }

    /// 临床记录在读取时记审计（access_count / last_accessed_*）
    pub fn is_clinical(self) -> bool {
        matches!(self, Self::Patient | Self::Encounter)
    }

    /// 全部实体类型（建表与遍历用）
    pub fn all() -> [EntityType; 6] {
        [
            Self::Patient,
            Self::Encounter,
            Self::Invoice,
            Self::InventoryItem,
            Self::License,
            Self::Organization,
        ]
    }
}

impl FromStr for EntityType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Self::Patient),
            "encounter" => Ok(Self::Encounter),
            "invoice" => Ok(Self::Invoice),
            "inventory_item" => Ok(Self::InventoryItem),
            "license" => Ok(Self::License),
            "organization" => Ok(Self::Organization),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 实体信封记录 - 本地存储的统一形态
///
/// `data` 是入库时的完整业务载荷快照，同步层原样透传给远端。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    /// 本地生成的 id（uuid v4），创建时分配，不可变
    pub id: String,
    /// 面向人的单号（如 PT26-00042），仅部分实体类型有
    pub entity_number: Option<String>,
    /// 远端服务确认后分配的 id
    pub remote_id: Option<String>,
    /// 远端是否已确认当前本地版本
    pub synced: bool,
    /// 创建时间（UTC 毫秒）
    pub created_at: i64,
    /// 最后一次本地变更时间（UTC 毫秒）
    pub updated_at: i64,
    /// 读取审计：累计访问次数
    pub access_count: i64,
    /// 读取审计：最后访问时间（UTC 毫秒）
    pub last_accessed_at: Option<i64>,
    /// 读取审计：最后访问人
    pub last_accessed_by: Option<String>,
    /// 业务载荷（对同步层不透明）
    pub data: Value,
}

impl EntityRecord {
    /// 组装一条新记录：分配 id、打时间戳、synced=false
    pub fn new(data: Value, entity_number: Option<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            entity_number,
            remote_id: None,
            synced: false,
            created_at: now,
            updated_at: now,
            access_count: 0,
            last_accessed_at: None,
            last_accessed_by: None,
            data,
        }
    }

    /// 发往远端的完整快照（本地 id 随行，服务端用于幂等去重；
    /// remote_id 一并携带，delete 操作冲刷时实体行已不在）
    pub fn to_remote_payload(&self) -> Value {
        serde_json::json!({
            "local_id": self.id,
            "entity_number": self.entity_number,
            "remote_id": self.remote_id,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
            "data": self.data,
        })
    }
}

/// 挂起操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 挂起操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// 在活动队列中等待冲刷
    Pending,
    /// 终态失败（超过最大重试或远端校验拒绝），离开活动队列但保留可查
    Failed,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// 同步队列的基本单元 - 一次尚未送达远端的持久化变更
///
/// `op_id` 来自 SQLite 自增主键，单调递增，定义冲刷顺序。
/// `payload` 是入队时刻的完整实体快照（不是 diff）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub op_id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: OperationKind,
    pub payload: Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: OperationStatus,
    pub enqueued_at: i64,
}

// ---------------------------------------------------------------------------
// 领域载荷类型 - 提供给界面层/会话层的强类型表，序列化进信封的 data 字段
// ---------------------------------------------------------------------------

/// 患者档案
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub full_name: String,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    /// 最近一次就诊时间（UTC 毫秒），由就诊流程回写
    pub last_visit_at: Option<i64>,
    pub allergies: Vec<String>,
    pub notes: Option<String>,
}

/// 就诊记录（诊断、体征、处方均为界面层语义，对同步层不透明）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encounter {
    pub patient_id: String,
    pub encounter_type: String,
    pub chief_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub vitals: Option<Value>,
    pub prescriptions: Vec<Value>,
    pub attending: Option<String>,
}

/// 发票行项目（随发票载荷整体存储）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub amount_cents: i64,
}

/// 发票
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub patient_id: String,
    pub encounter_id: Option<String>,
    pub items: Vec<InvoiceItem>,
    pub total_cents: i64,
    pub status: String,
}

impl Invoice {
    /// 追加行项目并重算合计
    pub fn push_item(&mut self, item: InvoiceItem) {
        self.total_cents += item.amount_cents;
        self.items.push(item);
    }
}

/// 库存批次（随库存项载荷整体存储）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockBatch {
    pub batch_number: String,
    pub quantity: i64,
    pub expires_at: Option<String>,
}

/// 库存项（药品/耗材）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub name: String,
    pub sku: Option<String>,
    pub unit: String,
    pub batches: Vec<StockBatch>,
    pub reorder_level: Option<i64>,
}

/// 许可证（模块授权）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub license_key_digest: String,
    pub module: String,
    pub valid_until: Option<i64>,
    pub seats: Option<i64>,
}

/// 机构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub org_type: String,
    pub address: Option<String>,
    pub contact_phone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_roundtrip() {
        for entity_type in EntityType::all() {
            let parsed: EntityType = entity_type.as_str().parse().unwrap();
            assert_eq!(parsed, entity_type);
        }
        assert!("ward".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_number_prefix_assignment() {
        assert_eq!(EntityType::Patient.number_prefix(), Some("PT"));
        assert_eq!(EntityType::Invoice.number_prefix(), Some("INV"));
        assert_eq!(EntityType::Organization.number_prefix(), None);
        assert!(EntityType::Patient.is_clinical());
        assert!(!EntityType::Invoice.is_clinical());
    }

    #[test]
    fn test_new_record_envelope() {
        let record = EntityRecord::new(serde_json::json!({"full_name": "测试患者"}), None);
        assert!(!record.synced);
        assert!(record.remote_id.is_none());
        assert_eq!(record.access_count, 0);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn test_invoice_push_item_recalculates_total() {
        let mut invoice = Invoice {
            patient_id: "p1".to_string(),
            encounter_id: None,
            items: Vec::new(),
            total_cents: 0,
            status: "draft".to_string(),
        };
        invoice.push_item(InvoiceItem {
            description: "阿莫西林".to_string(),
            quantity: 2,
            unit_price_cents: 1500,
            amount_cents: 3000,
        });
        assert_eq!(invoice.total_cents, 3000);
        assert_eq!(invoice.items.len(), 1);
    }
}

//! Medisync SDK - 医院/药房管理客户端的离线优先持久化与同步层
//!
//! 本 SDK 提供界面层之下的全部数据通路，包括：
//! - 💾 本地持久化：实体信封存储、单号生成、读取审计、复合原子写入
//! - 🔄 储存转发同步：挂起操作队列、顺序冲刷、指数退避、remote-wins 冲突处理
//! - 📡 连通性监控：周期探测、质量分类、去抖的状态转换事件
//! - 🔐 会话管理：离线宽限期内凭缓存凭据重建会话
//! - ⚙️ 事件系统：同步角标与状态横幅的统一通知机制
//!
//! 断网不阻塞任何写入：本地落盘即对调用方成功，远端同步在连通
//! 恢复后按原始顺序补做，不丢写、不重写。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use medisync_sdk::{MedisyncConfig, MedisyncSDK};
//! use medisync_sdk::storage::entities::EntityType;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置 SDK
//!     let config = MedisyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://api.clinic.example.com")
//!         .activation_key("LIC-XXXX")
//!         .build();
//!
//!     // 初始化（进程内构造一次，注入界面层）
//!     let sdk = MedisyncSDK::initialize(config).await?;
//!
//!     // 恢复会话（离线也能用缓存凭据）
//!     let session = sdk.restore_session().await?;
//!     println!("会话恢复: {}", session.success);
//!
//!     // 写入走两阶段：本地先行，远端尾随
//!     let patient = sdk
//!         .sync()
//!         .save(EntityType::Patient, serde_json::json!({"full_name": "张三"}))
//!         .await?;
//!     println!("患者号: {:?}", patient.entity_number);
//!
//!     // 状态横幅
//!     let snapshot = sdk.connectivity().snapshot();
//!     println!("在线: {} 质量: {}", snapshot.is_connected, snapshot.quality);
//!
//!     sdk.shutdown().await;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod connectivity;
pub mod error;
pub mod events;
pub mod sdk;
pub mod session;
pub mod storage;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use connectivity::{
    ConnectionQuality, ConnectivityMonitor, ConnectivitySnapshot, ConnectivitySubscription,
    ConnectivityTransition, HttpReachabilityProbe, InterfaceSignal, NoopSignalSource, ProbeConfig,
    ProbeError, ReachabilityProbe, ReachabilitySignalSource, TransitionKind,
};
pub use error::{MedisyncSDKError, Result};
pub use events::{EventManager, SdkEvent};
pub use sdk::{MedisyncConfig, MedisyncConfigBuilder, MedisyncSDK};
pub use session::{CachedSession, SessionConfig, SessionManager, SessionRestore, UserProfile};
pub use storage::entities::{
    EntityRecord, EntityType, OperationKind, OperationStatus, PendingOperation,
};
pub use storage::{AtomicStore, StorageManager, StorageStats, WriteJournalEntry};
pub use sync::{
    FlushFailureReason, FlushSummary, HttpClientConfig, HttpRemoteService, RemoteAck, RemotePage,
    RemoteService, RetryPolicy, SessionValidation, SyncCoordinator,
};
pub use version::SDK_VERSION;

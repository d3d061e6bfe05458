//! 事件系统模块 - 同步层对界面层的单向通知
//!
//! 功能包括：
//! - 同步成功/终态失败/冲突覆盖事件（界面据此渲染同步角标）
//! - 连通性转换事件（状态横幅）
//! - 事件广播和订阅机制
//!
//! 事件是尽力而为的通知：没有订阅者时直接丢弃，绝不阻塞同步路径。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::connectivity::ConnectionQuality;
use crate::storage::entities::EntityType;

/// SDK 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SdkEvent {
    /// 本地记录已获远端确认（op_id 为 None 表示写入路径上的立即同步）
    OperationSynced {
        entity_type: EntityType,
        entity_id: String,
        remote_id: String,
        op_id: Option<i64>,
        timestamp: i64,
    },
    /// 一条挂起操作终态失败（超过最大重试或远端校验拒绝）
    OperationFailed {
        entity_type: EntityType,
        entity_id: String,
        op_id: i64,
        error: String,
        timestamp: i64,
    },
    /// 冲突按 remote-wins 解决，本地副本已被远端覆盖
    ConflictResolved {
        entity_type: EntityType,
        entity_id: String,
        remote_id: String,
        timestamp: i64,
    },
    /// 一轮冲刷结束
    QueueDrained {
        synced: u64,
        failed: u64,
        timestamp: i64,
    },
    /// 连通性转换（connected / disconnected）
    ConnectivityChanged {
        connected: bool,
        quality: ConnectionQuality,
        timestamp: i64,
    },
}

/// 事件管理器（broadcast 扇出，订阅者各拿一个 Receiver）
#[derive(Debug, Clone)]
pub struct EventManager {
    sender: broadcast::Sender<SdkEvent>,
}

impl EventManager {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }

    /// 广播事件（无订阅者时丢弃）
    pub fn emit(&self, event: SdkEvent) {
        debug!("📣 事件: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}

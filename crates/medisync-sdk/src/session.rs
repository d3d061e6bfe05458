//! 会话管理 - 进程启动时不依赖网络地重建认证会话
//!
//! 流程：
//! 1. 从 KV 安全区读缓存凭据；没有即无会话
//! 2. 在线则对远端做静默续期；明确作废立即清缓存
//! 3. 离线或续期瞬态失败时，在宽限期内回退缓存会话
//!
//! 激活密钥本身绝不落盘，只存 sha-256 指纹；换了密钥视为换了
//! 部署，缓存会话作废。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::storage::kv::{namespaces, KvStore};
use crate::storage::StorageManager;
use crate::sync::RemoteService;

const SESSION_KEY: &str = "current";
const FINGERPRINT_KEY: &str = "activation_fingerprint";

/// 会话配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 离线宽限期（毫秒）：距上次成功续期超过该时长则缓存会话失效
    pub grace_period_ms: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 7 * 24 * 3_600 * 1_000, // 7 天
        }
    }
}

/// 用户概要
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub role: Option<String>,
}

/// 缓存的会话（KV 安全区的持久化形态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSession {
    pub token: String,
    pub user: UserProfile,
    pub organization: Value,
    pub licenses: Vec<Value>,
    pub user_module_access: Vec<String>,
    pub cached_at: i64,
    /// 最近一次远端确认本会话有效的时间（宽限期从这里起算）
    pub last_validated_at: i64,
}

/// 会话恢复结果
#[derive(Debug, Clone, Default)]
pub struct SessionRestore {
    pub success: bool,
    pub user: Option<UserProfile>,
    pub organization: Option<Value>,
    pub licenses: Vec<Value>,
    pub user_module_access: Vec<String>,
}

impl SessionRestore {
    fn failure() -> Self {
        Self::default()
    }

    fn from_session(session: &CachedSession) -> Self {
        Self {
            success: true,
            user: Some(session.user.clone()),
            organization: Some(session.organization.clone()),
            licenses: session.licenses.clone(),
            user_module_access: session.user_module_access.clone(),
        }
    }
}

/// 会话管理器
#[derive(Debug)]
pub struct SessionManager {
    kv: Arc<KvStore>,
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteService>,
    monitor: ConnectivityMonitor,
    config: SessionConfig,
    /// 激活密钥的 sha-256 十六进制指纹
    activation_fingerprint: String,
}

impl SessionManager {
    pub fn new(
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteService>,
        monitor: ConnectivityMonitor,
        activation_key: &str,
        config: SessionConfig,
    ) -> Self {
        Self {
            kv: storage.kv(),
            storage,
            remote,
            monitor,
            config,
            activation_fingerprint: fingerprint(activation_key),
        }
    }

    /// 登录成功后持久化会话（token 与刷新后的授权集合）
    pub async fn persist_session(&self, session: CachedSession) -> Result<()> {
        self.kv.put(namespaces::SESSION, SESSION_KEY, &session)?;
        self.kv
            .put(namespaces::DEVICE, FINGERPRINT_KEY, &self.activation_fingerprint)?;
        self.storage
            .set_current_user(Some(session.user.user_id.clone()))
            .await;
        info!("🔐 会话已持久化: 用户 {}", session.user.user_id);
        Ok(())
    }

    /// 清除缓存会话（登出或作废）
    pub async fn clear_session(&self) -> Result<()> {
        self.kv.remove(namespaces::SESSION, SESSION_KEY)?;
        self.storage.set_current_user(None).await;
        Ok(())
    }

    /// 启动时恢复会话（§流程见模块注释）
    pub async fn restore_session(&self) -> Result<SessionRestore> {
        // 0. 激活指纹对不上 = 换了部署，缓存会话作废
        let stored_fingerprint: Option<String> =
            self.kv.get(namespaces::DEVICE, FINGERPRINT_KEY)?;
        if let Some(stored) = stored_fingerprint {
            if stored != self.activation_fingerprint {
                warn!("激活密钥指纹不匹配，清除缓存会话");
                self.clear_session().await?;
                return Ok(SessionRestore::failure());
            }
        }

        // 1. 读缓存凭据
        let cached: Option<CachedSession> = self.kv.get(namespaces::SESSION, SESSION_KEY)?;
        let Some(session) = cached else {
            debug!("无缓存会话");
            return Ok(SessionRestore::failure());
        };

        // 2. 在线则静默续期
        if self.monitor.snapshot().is_connected {
            match self.remote.validate_session(&session.token).await {
                Ok(validation) if validation.valid => {
                    let now = Utc::now().timestamp_millis();
                    let refreshed = CachedSession {
                        token: validation.token.unwrap_or_else(|| session.token.clone()),
                        licenses: if validation.licenses.is_empty() {
                            session.licenses.clone()
                        } else {
                            validation.licenses
                        },
                        user_module_access: if validation.user_module_access.is_empty() {
                            session.user_module_access.clone()
                        } else {
                            validation.user_module_access
                        },
                        last_validated_at: now,
                        ..session
                    };
                    self.persist_session(refreshed.clone()).await?;
                    info!("🔐 会话静默续期成功");
                    return Ok(SessionRestore::from_session(&refreshed));
                }
                Ok(_) => {
                    // 远端明确作废，不走宽限期
                    info!("🔐 远端已作废会话，清除缓存");
                    self.clear_session().await?;
                    return Ok(SessionRestore::failure());
                }
                Err(e) => {
                    debug!("会话续期瞬态失败，回退缓存: {}", e);
                }
            }
        }

        // 3. 离线/瞬态失败：宽限期内用缓存会话
        let now = Utc::now().timestamp_millis();
        if now - session.last_validated_at <= self.config.grace_period_ms {
            self.storage
                .set_current_user(Some(session.user.user_id.clone()))
                .await;
            info!("🔐 离线恢复缓存会话: 用户 {}", session.user.user_id);
            Ok(SessionRestore::from_session(&session))
        } else {
            warn!("缓存会话超出宽限期，需要重新登录");
            self.clear_session().await?;
            Ok(SessionRestore::failure())
        }
    }
}

/// sha-256 十六进制指纹
fn fingerprint(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

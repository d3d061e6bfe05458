//! 远端服务客户端 - HTTPS REST / JSON
//!
//! SyncCoordinator 是唯一允许和远端对话的组件，而它只通过
//! [`RemoteService`] trait 对话；HTTP 细节（路径、状态码到错误
//! 分类的映射）都收在本模块，测试可注入内存实现。
//!
//! 资源路径约定：
//! - `POST   /api/{collection}`               创建
//! - `PUT    /api/{collection}/{remote_id}`   更新
//! - `DELETE /api/{collection}/{remote_id}`   删除
//! - `GET    /api/{collection}/{remote_id}`   单条拉取
//! - `GET    /api/{collection}?page=&page_size=` 分页列表
//! - `POST   /api/{collection}/bulk`          批量导入（数组载荷）
//! - `POST   /api/sessions/validate`          会话静默续期
//! - `GET    /health`                         可达性探测端点

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{MedisyncSDKError, Result};
use crate::storage::entities::EntityType;

/// 远端确认回执
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAck {
    /// 远端分配的 id
    pub id: String,
}

/// 分页列表响应
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePage {
    pub items: Vec<Value>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

/// 会话校验结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionValidation {
    /// false 表示远端明确作废了该会话（区别于网络失败）
    pub valid: bool,
    /// 续期后的新 token
    #[serde(default)]
    pub token: Option<String>,
    /// 刷新后的许可证/模块授权集合（远端为准）
    #[serde(default)]
    pub licenses: Vec<Value>,
    #[serde(default)]
    pub user_module_access: Vec<String>,
}

/// 远端服务接口（同步层对后端的全部要求）
#[async_trait]
pub trait RemoteService: Send + Sync + std::fmt::Debug {
    async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<RemoteAck>;

    async fn update(&self, entity_type: EntityType, remote_id: &str, payload: &Value)
        -> Result<RemoteAck>;

    async fn delete(&self, entity_type: EntityType, remote_id: &str) -> Result<()>;

    async fn fetch(&self, entity_type: EntityType, remote_id: &str) -> Result<Value>;

    async fn list(&self, entity_type: EntityType, page: u32, page_size: u32) -> Result<RemotePage>;

    /// 批量导入（一次请求推送同类型多条记录）
    async fn bulk_import(&self, entity_type: EntityType, payloads: &[Value])
        -> Result<Vec<RemoteAck>>;

    /// 会话静默续期（SessionManager 专用）
    async fn validate_session(&self, token: &str) -> Result<SessionValidation>;
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 单次请求超时（秒）；超时等同网络错误，只延迟同步不伤本地状态
    pub request_timeout_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 15,
        }
    }
}

/// 默认远端实现：reqwest + JSON
#[derive(Debug)]
pub struct HttpRemoteService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteService {
    pub fn new(base_url: &str, config: &HttpClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MedisyncSDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/api/{}", self.base_url, entity_type.collection())
    }

    fn resource_url(&self, entity_type: EntityType, remote_id: &str) -> String {
        format!("{}/api/{}/{}", self.base_url, entity_type.collection(), remote_id)
    }

    /// 状态码 → 错误分类
    ///
    /// 409 冲突、非 409 的 4xx 视为校验拒绝（不重试）、5xx 视为
    /// 瞬态网络层失败（退避重试）。
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_else(|_| "无法读取错误信息".to_string());
        error!("❌ 远端返回 {}: {}", status, body);
        let status_code = status.as_u16();
        if status_code == 409 {
            Err(MedisyncSDKError::Conflict(body))
        } else if (400..500).contains(&status_code) {
            Err(MedisyncSDKError::Validation(format!("{}: {}", status, body)))
        } else {
            Err(MedisyncSDKError::Network(format!("{}: {}", status, body)))
        }
    }
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<RemoteAck> {
        let url = self.collection_url(entity_type);
        debug!("📤 POST {}", url);
        let response = self.client.post(&url).json(payload).send().await?;
        let response = Self::check_status(response).await?;
        let ack: RemoteAck = response
            .json()
            .await
            .map_err(|e| MedisyncSDKError::Serialization(format!("解析创建回执失败: {}", e)))?;
        Ok(ack)
    }

    async fn update(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        payload: &Value,
    ) -> Result<RemoteAck> {
        let url = self.resource_url(entity_type, remote_id);
        debug!("📤 PUT {}", url);
        let response = self.client.put(&url).json(payload).send().await?;
        let response = Self::check_status(response).await?;
        let ack: RemoteAck = response
            .json()
            .await
            .map_err(|e| MedisyncSDKError::Serialization(format!("解析更新回执失败: {}", e)))?;
        Ok(ack)
    }

    async fn delete(&self, entity_type: EntityType, remote_id: &str) -> Result<()> {
        let url = self.resource_url(entity_type, remote_id);
        debug!("📤 DELETE {}", url);
        let response = self.client.delete(&url).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn fetch(&self, entity_type: EntityType, remote_id: &str) -> Result<Value> {
        let url = self.resource_url(entity_type, remote_id);
        debug!("📥 GET {}", url);
        let response = self.client.get(&url).send().await?;
        let response = Self::check_status(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| MedisyncSDKError::Serialization(format!("解析实体响应失败: {}", e)))?;
        Ok(body)
    }

    async fn list(&self, entity_type: EntityType, page: u32, page_size: u32) -> Result<RemotePage> {
        let url = format!(
            "{}?page={}&page_size={}",
            self.collection_url(entity_type),
            page,
            page_size
        );
        debug!("📥 GET {}", url);
        let response = self.client.get(&url).send().await?;
        let response = Self::check_status(response).await?;
        let body: RemotePage = response
            .json()
            .await
            .map_err(|e| MedisyncSDKError::Serialization(format!("解析列表响应失败: {}", e)))?;
        Ok(body)
    }

    async fn bulk_import(
        &self,
        entity_type: EntityType,
        payloads: &[Value],
    ) -> Result<Vec<RemoteAck>> {
        let url = format!("{}/bulk", self.collection_url(entity_type));
        debug!("📤 POST {} ({} 条)", url, payloads.len());
        let response = self.client.post(&url).json(payloads).send().await?;
        let response = Self::check_status(response).await?;
        let acks: Vec<RemoteAck> = response
            .json()
            .await
            .map_err(|e| MedisyncSDKError::Serialization(format!("解析批量回执失败: {}", e)))?;
        Ok(acks)
    }

    async fn validate_session(&self, token: &str) -> Result<SessionValidation> {
        let url = format!("{}/api/sessions/validate", self.base_url);
        debug!("📤 POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;

        // 401 是明确作废，不是网络失败
        if response.status().as_u16() == 401 {
            return Ok(SessionValidation {
                valid: false,
                token: None,
                licenses: Vec::new(),
                user_module_access: Vec::new(),
            });
        }
        let response = Self::check_status(response).await?;
        let validation: SessionValidation = response
            .json()
            .await
            .map_err(|e| MedisyncSDKError::Serialization(format!("解析会话校验响应失败: {}", e)))?;
        Ok(validation)
    }
}

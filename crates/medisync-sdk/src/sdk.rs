//! 统一 SDK 接口 - MedisyncSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! MedisyncSDK (装配层)
//!   ├── SyncCoordinator (同步协调层)
//!   ├── StorageManager (存储管理层)
//!   ├── SessionManager (会话层)
//!   ├── ConnectivityMonitor (连通性监控层)
//!   └── EventManager (事件系统层)
//! ```
//!
//! 设计原则：
//! - 显式初始化：进程启动时构造一次，引用注入给界面层，无隐藏全局态
//! - 异步优先：主要 API 使用 async/await
//! - 分层清晰：界面层只碰 SyncCoordinator / ConnectivityMonitor / 事件总线

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::connectivity::{
    ConnectivityMonitor, ConnectivitySubscription, HttpReachabilityProbe, NoopSignalSource,
    ProbeConfig, ReachabilityProbe, ReachabilitySignalSource,
};
use crate::error::{MedisyncSDKError, Result};
use crate::events::{EventManager, SdkEvent};
use crate::session::{SessionConfig, SessionManager, SessionRestore};
use crate::storage::StorageManager;
use crate::sync::{HttpClientConfig, HttpRemoteService, RemoteService, RetryPolicy, SyncCoordinator};
use crate::version::SDK_VERSION;

/// Medisync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedisyncConfig {
    /// 本设备数据目录
    pub data_dir: PathBuf,
    /// 远端服务 API 基础 URL（如 https://api.clinic.example.com）
    pub api_base_url: String,
    /// 许可证激活密钥（只存指纹，原文不落盘）
    pub activation_key: String,
    /// 连通性探测配置
    pub probe_config: ProbeConfig,
    /// 冲刷重试策略
    pub retry_policy: RetryPolicy,
    /// HTTP 客户端配置
    pub http_client_config: HttpClientConfig,
    /// 会话配置
    pub session_config: SessionConfig,
    /// 事件总线缓冲区大小
    pub event_buffer_size: usize,
}

impl Default for MedisyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_base_url: String::new(),
            activation_key: String::new(),
            probe_config: ProbeConfig::default(),
            retry_policy: RetryPolicy::default(),
            http_client_config: HttpClientConfig::default(),
            session_config: SessionConfig::default(),
            event_buffer_size: 256,
        }
    }
}

impl MedisyncConfig {
    pub fn builder() -> MedisyncConfigBuilder {
        MedisyncConfigBuilder::new()
    }

    fn validate(&self) -> Result<()> {
        if self.api_base_url.is_empty() {
            return Err(MedisyncSDKError::Config("api_base_url 不能为空".to_string()));
        }
        if self.activation_key.is_empty() {
            return Err(MedisyncSDKError::Config("activation_key 不能为空".to_string()));
        }
        Ok(())
    }
}

/// 获取默认数据目录 ~/.medisync/
fn default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".medisync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".medisync")
    } else {
        PathBuf::from("./medisync_data")
    }
}

/// Medisync SDK 配置构建器
pub struct MedisyncConfigBuilder {
    config: MedisyncConfig,
}

impl MedisyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MedisyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn activation_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.activation_key = key.into();
        self
    }

    pub fn probe_config(mut self, probe_config: ProbeConfig) -> Self {
        self.config.probe_config = probe_config;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    pub fn http_client_config(mut self, http_client_config: HttpClientConfig) -> Self {
        self.config.http_client_config = http_client_config;
        self
    }

    pub fn session_config(mut self, session_config: SessionConfig) -> Self {
        self.config.session_config = session_config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn build(self) -> MedisyncConfig {
        self.config
    }
}

impl Default for MedisyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Medisync SDK - 进程级单实例，启动时构造一次后注入界面层
#[derive(Debug)]
pub struct MedisyncSDK {
    storage: Arc<StorageManager>,
    monitor: ConnectivityMonitor,
    coordinator: SyncCoordinator,
    session: Arc<SessionManager>,
    events: EventManager,
    /// 连通性转换 → 事件总线的桥（随 SDK 存活）
    _banner_subscription: ConnectivitySubscription,
}

impl MedisyncSDK {
    /// 用默认组件初始化（真实 HTTP 远端 + HTTP 探测）
    pub async fn initialize(config: MedisyncConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let probe = Arc::new(HttpReachabilityProbe::new(
            &config.api_base_url,
            Duration::from_millis(config.probe_config.probe_timeout_ms),
        )?);
        let remote = Arc::new(HttpRemoteService::new(
            &config.api_base_url,
            &config.http_client_config,
        )?);
        Self::initialize_with_components(
            config,
            remote,
            probe,
            Arc::new(NoopSignalSource::default()),
        )
        .await
    }

    /// 注入式初始化（平台层提供接口信号源；测试注入内存远端/探测）
    pub async fn initialize_with_components(
        config: MedisyncConfig,
        remote: Arc<dyn RemoteService>,
        probe: Arc<dyn ReachabilityProbe>,
        signal_source: Arc<dyn ReachabilitySignalSource>,
    ) -> Result<Arc<Self>> {
        let storage = Arc::new(StorageManager::new(&config.data_dir).await?);
        let events = EventManager::new(config.event_buffer_size);
        let monitor = ConnectivityMonitor::new(probe, signal_source, config.probe_config.clone());
        let coordinator = SyncCoordinator::new(
            storage.clone(),
            remote.clone(),
            monitor.clone(),
            events.clone(),
            config.retry_policy.clone(),
        );
        let session = Arc::new(SessionManager::new(
            storage.clone(),
            remote,
            monitor.clone(),
            &config.activation_key,
            config.session_config.clone(),
        ));

        // 连通性转换转发到事件总线（界面层状态横幅）
        let banner_events = events.clone();
        let banner_subscription = monitor.subscribe(move |transition| {
            banner_events.emit(SdkEvent::ConnectivityChanged {
                connected: transition.snapshot.is_connected,
                quality: transition.snapshot.quality,
                timestamp: transition.snapshot.timestamp,
            });
        });

        monitor.start().await?;
        coordinator.start();

        info!("✅ MediSync SDK v{} 初始化完成", SDK_VERSION);

        Ok(Arc::new(Self {
            storage,
            monitor,
            coordinator,
            session,
            events,
            _banner_subscription: banner_subscription,
        }))
    }

    /// 启动时恢复会话（离线可用，见 [`SessionManager`]）
    pub async fn restore_session(&self) -> Result<SessionRestore> {
        self.session.restore_session().await
    }

    /// 同步协调器（界面层的 save / get / list_by / delete 入口）
    pub fn sync(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// 连通性监控（状态横幅的 subscribe / snapshot 入口）
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// 会话管理器
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// 存储统计等诊断入口
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// 订阅 SDK 事件流（同步角标、冲突通知、连通性横幅）
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SdkEvent> {
        self.events.subscribe()
    }

    /// 关闭 SDK：停同步、停探测（本地数据已随每次写入落盘）
    pub async fn shutdown(&self) {
        self.coordinator.stop();
        self.monitor.stop().await;
        info!("👋 MediSync SDK 已关闭");
    }
}

//! 连通性监控 - "能不能到达后端，质量如何"的唯一事实来源
//!
//! 提供：
//! - 周期探测循环（对轻量可达性端点测往返延迟）
//! - 延迟分桶的连接质量分类
//! - 去抖的 connected / disconnected 转换事件
//! - 有界历史环形缓冲与累计离线时长
//!
//! 系统级接口信号只作早期信号：接口消失视为权威离线；接口出现
//! 不可信（强制门户、无外网的 Wi-Fi），必须由一次成功探测确认。

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// 质量分桶阈值（毫秒）
const EXCELLENT_BELOW_MS: u64 = 150;
const GOOD_BELOW_MS: u64 = 400;
const POOR_BELOW_MS: u64 = 1000;

/// 连接质量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    /// 离线（探测失败、超时，或往返 ≥ 1000ms —— 与探测超时边界重合）
    Offline,
    /// 差（400ms ≤ 往返 < 1000ms）
    Poor,
    /// 良（150ms ≤ 往返 < 400ms）
    Good,
    /// 优（往返 < 150ms）
    Excellent,
}

impl ConnectionQuality {
    /// 按测得的往返延迟分桶
    pub fn from_latency(latency_ms: u64) -> Self {
        if latency_ms < EXCELLENT_BELOW_MS {
            ConnectionQuality::Excellent
        } else if latency_ms < GOOD_BELOW_MS {
            ConnectionQuality::Good
        } else if latency_ms < POOR_BELOW_MS {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Offline
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionQuality::Offline => write!(f, "offline"),
            ConnectionQuality::Poor => write!(f, "poor"),
            ConnectionQuality::Good => write!(f, "good"),
            ConnectionQuality::Excellent => write!(f, "excellent"),
        }
    }
}

/// 连通性快照 - 每次探测与每个接口信号都会重算
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySnapshot {
    /// 去抖后的已发布状态（单次探测失败不立刻翻转）
    pub is_connected: bool,
    /// 本次探测的质量分类
    pub quality: ConnectionQuality,
    /// 本次探测的往返延迟（失败为 None）
    pub latency_ms: Option<u64>,
    /// 快照时间（UTC 毫秒）
    pub timestamp: i64,
}

/// 转换类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    Connected,
    Disconnected,
}

/// 连通性转换事件（只在状态翻转时发出，不随每个探测 tick 刷屏）
#[derive(Debug, Clone)]
pub struct ConnectivityTransition {
    pub kind: TransitionKind,
    pub snapshot: ConnectivitySnapshot,
}

/// 探测错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("探测超时")]
    Timeout,
    #[error("网络错误: {0}")]
    Network(String),
}

/// 可达性探测器（平台/传输无关的缝）
///
/// 返回到可达性端点的往返延迟（毫秒）。实现自身不必强制超时，
/// 监控器会用配置的 probe_timeout 统一包一层。
#[async_trait::async_trait]
pub trait ReachabilityProbe: Send + Sync + std::fmt::Debug {
    async fn probe(&self) -> std::result::Result<u64, ProbeError>;
}

/// 默认探测器：对 `<base>/health` 发短超时 GET 并计时
#[derive(Debug)]
pub struct HttpReachabilityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpReachabilityProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::MedisyncSDKError::Config(format!("创建探测客户端失败: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for HttpReachabilityProbe {
    async fn probe(&self) -> std::result::Result<u64, ProbeError> {
        let started = std::time::Instant::now();
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;
        if !response.status().is_success() {
            return Err(ProbeError::Network(format!(
                "可达性端点返回 {}",
                response.status()
            )));
        }
        Ok(started.elapsed().as_millis() as u64)
    }
}

/// 系统级接口信号
#[derive(Debug, Clone)]
pub struct InterfaceSignal {
    /// 是否有网络接口（up=false 视为权威离线）
    pub up: bool,
    pub timestamp: i64,
}

/// 接口信号源 trait（由平台层实现，如 Android/iOS/桌面）
#[async_trait::async_trait]
pub trait ReachabilitySignalSource: Send + Sync + std::fmt::Debug {
    /// 开始监听，返回信号接收端
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<InterfaceSignal>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 默认信号源（无系统集成时使用，从不发信号，一切交给探测循环）
#[derive(Debug)]
pub struct NoopSignalSource {
    sender: broadcast::Sender<InterfaceSignal>,
}

impl Default for NoopSignalSource {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }
}

#[async_trait::async_trait]
impl ReachabilitySignalSource for NoopSignalSource {
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<InterfaceSignal>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}

/// 探测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// 周期探测间隔（毫秒）
    pub probe_interval_ms: u64,
    /// 单次探测超时（毫秒）；与 Offline 质量边界一致
    pub probe_timeout_ms: u64,
    /// 判离线所需的连续失败次数（去抖）
    pub offline_threshold: u32,
    /// 历史环形缓冲容量
    pub history_limit: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            probe_timeout_ms: 1_000,
            offline_threshold: 3,
            history_limit: 120,
        }
    }
}

type TransitionHandler = Arc<dyn Fn(&ConnectivityTransition) + Send + Sync>;

/// 监控器内部状态
struct MonitorState {
    snapshot: ConnectivitySnapshot,
    history: VecDeque<ConnectivitySnapshot>,
    consecutive_failures: u32,
    /// 最近一次 disconnected 转换的时间戳（在线时为 None）
    offline_since: Option<i64>,
    total_offline_ms: i64,
}

struct MonitorInner {
    probe: Arc<dyn ReachabilityProbe>,
    signal_source: Arc<dyn ReachabilitySignalSource>,
    config: ProbeConfig,
    state: RwLock<MonitorState>,
    subscribers: Arc<RwLock<HashMap<u64, TransitionHandler>>>,
    next_subscription_id: AtomicU64,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MonitorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorInner")
            .field("probe", &self.probe)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

/// 连通性订阅凭据 - Drop 即退订，生命周期归调用方所有
pub struct ConnectivitySubscription {
    id: u64,
    subscribers: Weak<RwLock<HashMap<u64, TransitionHandler>>>,
}

impl ConnectivitySubscription {
    /// 显式退订（等价于 drop）
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for ConnectivitySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivitySubscription")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ConnectivitySubscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.write().remove(&self.id);
        }
    }
}

/// 连通性监控器
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        signal_source: Arc<dyn ReachabilitySignalSource>,
        config: ProbeConfig,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        let initial = ConnectivitySnapshot {
            is_connected: false,
            quality: ConnectionQuality::Offline,
            latency_ms: None,
            timestamp: now,
        };
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                signal_source,
                config,
                state: RwLock::new(MonitorState {
                    snapshot: initial,
                    history: VecDeque::new(),
                    consecutive_failures: 0,
                    offline_since: None,
                    total_offline_ms: 0,
                }),
                subscribers: Arc::new(RwLock::new(HashMap::new())),
                next_subscription_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 启动周期探测与信号监听；幂等，重复调用是 no-op
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("连通性监控已在运行，忽略重复 start");
            return Ok(());
        }

        info!(
            "📡 连通性监控启动: 间隔 {}ms, 超时 {}ms, 去抖 {} 次",
            self.inner.config.probe_interval_ms,
            self.inner.config.probe_timeout_ms,
            self.inner.config.offline_threshold
        );

        // 周期探测循环
        let inner = Arc::clone(&self.inner);
        let probe_task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(inner.config.probe_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let outcome = inner.probe_once().await;
                inner.process_probe_outcome(outcome);
            }
        });

        // 接口信号监听（早期信号）
        let inner = Arc::clone(&self.inner);
        let signal_task = match inner.signal_source.start_monitoring().await {
            Ok(mut receiver) => Some(tokio::spawn(async move {
                while let Ok(signal) = receiver.recv().await {
                    if !signal.up {
                        // 无接口 = 权威离线，绕过去抖
                        inner.force_offline(signal.timestamp);
                    } else {
                        // 接口出现不可信，立即补一次探测确认
                        let outcome = inner.probe_once().await;
                        inner.process_probe_outcome(outcome);
                    }
                }
            })),
            Err(e) => {
                warn!("接口信号源启动失败，仅靠周期探测: {}", e);
                None
            }
        };

        let mut tasks = self.inner.tasks.lock();
        tasks.push(probe_task);
        if let Some(task) = signal_task {
            tasks.push(task);
        }
        Ok(())
    }

    /// 停止监控（探测循环与信号监听一并撤下）
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.signal_source.stop_monitoring().await;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!("📡 连通性监控已停止");
    }

    /// 规律节奏之外的即时探测（界面发起同步前要同步答案时用）
    ///
    /// 永远解析出一个快照，探测错误被吞进质量分类，不外抛。
    pub async fn refresh_status(&self) -> ConnectivitySnapshot {
        let outcome = self.inner.probe_once().await;
        self.inner.process_probe_outcome(outcome)
    }

    /// 注册转换回调；返回的凭据 Drop 即退订
    ///
    /// 回调只在 connected/disconnected 翻转时触发，不随 tick 触发。
    pub fn subscribe<F>(&self, handler: F) -> ConnectivitySubscription
    where
        F: Fn(&ConnectivityTransition) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.write().insert(id, Arc::new(handler));
        ConnectivitySubscription {
            id,
            subscribers: Arc::downgrade(&self.inner.subscribers),
        }
    }

    /// 当前快照（纯读）
    pub fn snapshot(&self) -> ConnectivitySnapshot {
        self.inner.state.read().snapshot.clone()
    }

    /// 探测历史（诊断用，有界）
    pub fn history(&self) -> Vec<ConnectivitySnapshot> {
        self.inner.state.read().history.iter().cloned().collect()
    }

    /// 累计离线时长（毫秒），每次 connected 转换时累加上一段
    pub fn total_offline_ms(&self) -> i64 {
        self.inner.state.read().total_offline_ms
    }
}

impl MonitorInner {
    /// 发起一次探测，统一套上配置超时
    async fn probe_once(&self) -> std::result::Result<u64, ProbeError> {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        match tokio::time::timeout(timeout, self.probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        }
    }

    /// 把一次探测结果灌进状态机，必要时发转换事件；返回新快照
    fn process_probe_outcome(
        &self,
        outcome: std::result::Result<u64, ProbeError>,
    ) -> ConnectivitySnapshot {
        let now = Utc::now().timestamp_millis();
        match outcome {
            Ok(latency_ms) => {
                let quality = ConnectionQuality::from_latency(latency_ms);
                if quality == ConnectionQuality::Offline {
                    // 测得 ≥ 超时边界，等同失败
                    self.note_failure(now, false)
                } else {
                    self.note_success(now, latency_ms, quality)
                }
            }
            Err(e) => {
                debug!("探测失败: {}", e);
                self.note_failure(now, false)
            }
        }
    }

    /// 接口消失：权威离线，绕过去抖
    fn force_offline(&self, timestamp: i64) {
        self.note_failure(timestamp, true);
    }

    fn note_success(&self, now: i64, latency_ms: u64, quality: ConnectionQuality) -> ConnectivitySnapshot {
        let (snapshot, transition) = {
            let mut state = self.state.write();
            state.consecutive_failures = 0;
            let was_connected = state.snapshot.is_connected;
            let snapshot = ConnectivitySnapshot {
                is_connected: true,
                quality,
                latency_ms: Some(latency_ms),
                timestamp: now,
            };
            state.snapshot = snapshot.clone();
            Self::push_history(&mut state, snapshot.clone(), self.config.history_limit);

            let transition = if !was_connected {
                if let Some(since) = state.offline_since.take() {
                    state.total_offline_ms += now - since;
                }
                Some(ConnectivityTransition {
                    kind: TransitionKind::Connected,
                    snapshot: snapshot.clone(),
                })
            } else {
                None
            };
            (snapshot, transition)
        };
        if let Some(transition) = transition {
            info!("🔌 连通性转换: connected ({})", transition.snapshot.quality);
            self.fire(&transition);
        }
        snapshot
    }

    fn note_failure(&self, now: i64, authoritative: bool) -> ConnectivitySnapshot {
        let (snapshot, transition) = {
            let mut state = self.state.write();
            state.consecutive_failures += 1;
            let was_connected = state.snapshot.is_connected;
            let crossed_threshold =
                authoritative || state.consecutive_failures >= self.config.offline_threshold;
            let is_connected = was_connected && !crossed_threshold;
            let snapshot = ConnectivitySnapshot {
                is_connected,
                quality: ConnectionQuality::Offline,
                latency_ms: None,
                timestamp: now,
            };
            state.snapshot = snapshot.clone();
            Self::push_history(&mut state, snapshot.clone(), self.config.history_limit);

            let transition = if was_connected && !is_connected {
                state.offline_since = Some(now);
                Some(ConnectivityTransition {
                    kind: TransitionKind::Disconnected,
                    snapshot: snapshot.clone(),
                })
            } else {
                None
            };
            (snapshot, transition)
        };
        if let Some(transition) = transition {
            info!("🔌 连通性转换: disconnected");
            self.fire(&transition);
        }
        snapshot
    }

    fn push_history(state: &mut MonitorState, snapshot: ConnectivitySnapshot, limit: usize) {
        if state.history.len() >= limit {
            state.history.pop_front();
        }
        state.history.push_back(snapshot);
    }

    /// 触发订阅回调（先取出快照锁外调用，回调内可安全读监控器）
    fn fire(&self, transition: &ConnectivityTransition) {
        let handlers: Vec<TransitionHandler> =
            self.subscribers.read().values().cloned().collect();
        for handler in handlers {
            handler(transition);
        }
    }
}

/// 测试辅助：照脚本回放探测结果
#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct ScriptedProbe {
        script: Mutex<VecDeque<std::result::Result<u64, ProbeError>>>,
        /// 脚本放完后的默认结果
        fallback: std::result::Result<u64, ProbeError>,
    }

    impl ScriptedProbe {
        pub fn new(
            script: Vec<std::result::Result<u64, ProbeError>>,
            fallback: std::result::Result<u64, ProbeError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
            })
        }

        pub fn always_ok(latency_ms: u64) -> Arc<Self> {
            Self::new(Vec::new(), Ok(latency_ms))
        }
    }

    #[async_trait::async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn probe(&self) -> std::result::Result<u64, ProbeError> {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub fn test_monitor(probe: Arc<dyn ReachabilityProbe>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            probe,
            Arc::new(NoopSignalSource::default()),
            ProbeConfig {
                probe_interval_ms: 50,
                probe_timeout_ms: 1_000,
                offline_threshold: 3,
                history_limit: 16,
            },
        )
    }
}

use std::fmt;
use rusqlite;

#[derive(Debug)]
pub enum MedisyncSDKError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    InvalidArgument(String),
    NotFound(String),
    AlreadyExists(String),
    Storage(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    Network(String),        // 网络错误（含超时），可重试
    Conflict(String),       // 远端版本冲突（HTTP 409），按 remote-wins 策略处理
    Validation(String),     // 远端拒绝载荷（HTTP 4xx），不重试
    Session(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
    Other(String),
}

impl fmt::Display for MedisyncSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MedisyncSDKError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            MedisyncSDKError::JsonError(e) => write!(f, "JSON error: {}", e),
            MedisyncSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            MedisyncSDKError::NotFound(e) => write!(f, "Not found: {}", e),
            MedisyncSDKError::AlreadyExists(e) => write!(f, "Already exists: {}", e),
            MedisyncSDKError::Storage(e) => write!(f, "Storage error: {}", e),
            MedisyncSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            MedisyncSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MedisyncSDKError::IO(e) => write!(f, "IO error: {}", e),
            MedisyncSDKError::Network(e) => write!(f, "Network error: {}", e),
            MedisyncSDKError::Conflict(e) => write!(f, "Conflict: {}", e),
            MedisyncSDKError::Validation(e) => write!(f, "Validation rejected: {}", e),
            MedisyncSDKError::Session(e) => write!(f, "Session error: {}", e),
            MedisyncSDKError::Config(e) => write!(f, "Config error: {}", e),
            MedisyncSDKError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            MedisyncSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            MedisyncSDKError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for MedisyncSDKError {}

impl From<rusqlite::Error> for MedisyncSDKError {
    fn from(error: rusqlite::Error) -> Self {
        MedisyncSDKError::SqliteError(error)
    }
}

impl From<serde_json::Error> for MedisyncSDKError {
    fn from(error: serde_json::Error) -> Self {
        MedisyncSDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for MedisyncSDKError {
    fn from(error: std::io::Error) -> Self {
        MedisyncSDKError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for MedisyncSDKError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            MedisyncSDKError::Network(format!("timeout: {}", error))
        } else {
            MedisyncSDKError::Network(error.to_string())
        }
    }
}

impl MedisyncSDKError {
    /// 判断是否为本地存储失败（同步失败给调用方，绝不入队）
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            MedisyncSDKError::SqliteError(_)
                | MedisyncSDKError::Storage(_)
                | MedisyncSDKError::KvStore(_)
                | MedisyncSDKError::IO(_)
        )
    }

    /// 判断是否为瞬态网络失败（入队等待重试，不上抛给调用方）
    pub fn is_transient(&self) -> bool {
        matches!(self, MedisyncSDKError::Network(_))
    }

    /// 判断是否为远端版本冲突
    pub fn is_conflict(&self) -> bool {
        matches!(self, MedisyncSDKError::Conflict(_))
    }

    /// 判断是否为远端校验拒绝（不重试，直接标记终态失败）
    pub fn is_validation(&self) -> bool {
        matches!(self, MedisyncSDKError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, MedisyncSDKError>;

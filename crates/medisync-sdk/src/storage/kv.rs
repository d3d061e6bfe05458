//! KV 存储模块 - 基于 sled 的安全小数据区
//!
//! 本模块提供：
//! - 会话凭据等敏感小数据的持久化（与实体库物理分离）
//! - 命名空间隔离的 Tree
//! - JSON 序列化的读写原语

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{MedisyncSDKError, Result};

/// 安全区命名空间
pub mod namespaces {
    /// 会话凭据（token、缓存的用户/机构/许可证集合）
    pub const SESSION: &str = "session";
    /// 激活指纹等设备级元数据
    pub const DEVICE: &str = "device";
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    db: Arc<Db>,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| MedisyncSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（上个进程实例可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            MedisyncSDKError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
        })
    }

    fn tree(&self, namespace: &str) -> Result<Tree> {
        self.db
            .open_tree(namespace)
            .map_err(|e| MedisyncSDKError::KvStore(format!("打开命名空间 {} 失败: {}", namespace, e)))
    }

    /// 写入（JSON 序列化后落盘并 flush）
    pub fn put<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        let tree = self.tree(namespace)?;
        let bytes = serde_json::to_vec(value)
            .map_err(|e| MedisyncSDKError::Serialization(e.to_string()))?;
        tree.insert(key, bytes)
            .map_err(|e| MedisyncSDKError::KvStore(format!("写入 {}/{} 失败: {}", namespace, key, e)))?;
        tree.flush()
            .map_err(|e| MedisyncSDKError::KvStore(format!("flush 失败: {}", e)))?;
        Ok(())
    }

    /// 读取（不存在返回 None）
    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        let tree = self.tree(namespace)?;
        let Some(bytes) = tree
            .get(key)
            .map_err(|e| MedisyncSDKError::KvStore(format!("读取 {}/{} 失败: {}", namespace, key, e)))?
        else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| MedisyncSDKError::Serialization(e.to_string()))?;
        Ok(Some(value))
    }

    /// 删除，返回是否确实删到了值
    pub fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let tree = self.tree(namespace)?;
        let removed = tree
            .remove(key)
            .map_err(|e| MedisyncSDKError::KvStore(format!("删除 {}/{} 失败: {}", namespace, key, e)))?
            .is_some();
        tree.flush()
            .map_err(|e| MedisyncSDKError::KvStore(format!("flush 失败: {}", e)))?;
        Ok(removed)
    }
}

//! KV 存储模块 - 基于 sled 的本地持久化
//!
//! 浏览器里对应 IndexedDB：按来源隔离、跨页面重载存活。
//! 这里持有：
//! - `meta` 树：会话令牌、用户资料、快照同步时间
//! - 每个缓存表一棵树（由 cache 模块管理）
//! - `pending` 树：待发账本（由 ledger 模块管理）

use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use crate::error::{DropsheetSDKError, Result};

/// meta 树中的键
mod keys {
    pub const TOKEN: &str = "token";
    pub const USER: &str = "user";
    pub const SYNC_TIME: &str = "sync_time";
}

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    db: Arc<Db>,
    meta: Tree,
}

impl KvStore {
    /// 打开（或创建）本地存储
    pub fn open(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        std::fs::create_dir_all(&kv_path)
            .map_err(|e| DropsheetSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 页面重载后旧实例可能刚释放锁，重试多次带退避
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
                        std::thread::sleep(std::time::Duration::from_millis(
                            RETRY_DELAY_MS * (1 << attempt),
                        ));
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            DropsheetSDKError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let meta = db
            .open_tree("meta")
            .map_err(|e| DropsheetSDKError::KvStore(format!("打开 meta 树失败: {}", e)))?;

        Ok(Self {
            db: Arc::new(db),
            meta,
        })
    }

    pub(crate) fn db(&self) -> Arc<Db> {
        self.db.clone()
    }

    fn get_meta<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.meta.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| DropsheetSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set_meta<V: Serialize>(&self, key: &str, value: Option<&V>) -> Result<()> {
        match value {
            Some(v) => {
                let bytes = serde_json::to_vec(v)
                    .map_err(|e| DropsheetSDKError::Serialization(format!("序列化值失败: {}", e)))?;
                self.meta.insert(key, bytes)?;
            }
            None => {
                self.meta.remove(key)?;
            }
        }
        Ok(())
    }

    /// 当前会话令牌（持久化，离线重载后免登录）
    pub fn token(&self) -> Result<Option<String>> {
        self.get_meta(keys::TOKEN)
    }

    pub fn set_token(&self, token: Option<&str>) -> Result<()> {
        self.set_meta(keys::TOKEN, token.as_ref())
    }

    /// 当前用户资料（服务端 UPDATE_USER 下发的原样 JSON）
    pub fn user(&self) -> Result<Option<serde_json::Value>> {
        self.get_meta(keys::USER)
    }

    pub fn set_user(&self, user: Option<&serde_json::Value>) -> Result<()> {
        self.set_meta(keys::USER, user)
    }

    /// 快照同步时间（ISO-8601）；None 表示从未全量同步过
    pub fn sync_time(&self) -> Result<Option<String>> {
        self.get_meta(keys::SYNC_TIME)
    }

    pub fn set_sync_time(&self, sync_time: &str) -> Result<()> {
        self.set_meta(keys::SYNC_TIME, Some(&sync_time))
    }
}

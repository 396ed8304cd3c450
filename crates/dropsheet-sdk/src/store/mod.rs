//! 存储模块 - 会话元数据、缓存快照与待发账本
//!
//! 三个组件共享同一个 sled 数据库（一个目录一个实例）：
//! - [`kv::KvStore`]：令牌 / 用户资料 / 快照同步时间
//! - [`cache::CacheStore`]：按表存放的点时快照与离线查询引擎
//! - [`ledger::PendingLedger`]：离线写操作的持久化账本
//! - [`patch`]：jsondiffpatch 增量补丁应用

pub mod cache;
pub mod kv;
pub mod ledger;
pub mod patch;

use std::path::Path;

use crate::error::Result;

/// 存储管理器
#[derive(Debug, Clone)]
pub struct StorageManager {
    pub kv: kv::KvStore,
    pub cache: cache::CacheStore,
    pub ledger: ledger::PendingLedger,
}

impl StorageManager {
    /// 打开（或创建）指定目录下的全部存储组件
    pub fn new(base_path: &Path) -> Result<Self> {
        let kv = kv::KvStore::open(base_path)?;
        let cache = cache::CacheStore::new(kv.db());
        let ledger = ledger::PendingLedger::new(kv.db())?;
        Ok(Self { kv, cache, ledger })
    }
}

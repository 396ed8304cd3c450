//! 待发账本
//!
//! 离线期间的每个写操作在这里留一条持久化条目，键为 `表名@记录ID`；
//! 同键后写覆盖先写（记录级 last-write-wins），条目按加入顺序重放。
//! 条目只在两种情况下消失：服务端确认（RESPONSE / ERROR 按关联 ID 路由
//! 回来），或其它标签页广播 PENDING_RESOLVED。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::sync::Arc;

use crate::error::{DropsheetSDKError, Result};
use crate::protocol::{PendingKey, Request};

/// 同一条目两次重发之间的最小间隔
pub const RESEND_THROTTLE_MS: i64 = 5_000;

/// 一条待发条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// 账本键（`表名@记录ID` 编码形式）
    pub key: String,
    /// 加入顺序序号（重放顺序依据）
    pub seq: u64,
    /// 待重放的原始请求
    pub request: Request,
    /// 首次入账时间（ISO-8601）
    pub created_at: String,
    /// 上次发送时间（epoch 毫秒）；None 表示从未发送
    pub last_sent_at: Option<i64>,
}

impl PendingEntry {
    pub fn pending_key(&self) -> Option<PendingKey> {
        PendingKey::parse(&self.key)
    }
}

/// 待发账本存储
///
/// sled 树键是 8 字节大端序号，天然按加入顺序迭代。
/// 账本条目数量级是"离线一小时攒下的表单提交"，按键查找直接线性扫。
#[derive(Debug, Clone)]
pub struct PendingLedger {
    db: Arc<Db>,
    tree: Tree,
}

impl PendingLedger {
    pub fn new(db: Arc<Db>) -> Result<Self> {
        let tree = db
            .open_tree("pending")
            .map_err(|e| DropsheetSDKError::KvStore(format!("打开 pending 树失败: {}", e)))?;
        Ok(Self { db, tree })
    }

    fn decode(bytes: &[u8]) -> Result<PendingEntry> {
        serde_json::from_slice(bytes)
            .map_err(|e| DropsheetSDKError::Serialization(format!("反序列化账本条目失败: {}", e)))
    }

    fn write(&self, entry: &PendingEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)
            .map_err(|e| DropsheetSDKError::Serialization(format!("序列化账本条目失败: {}", e)))?;
        self.tree.insert(entry.seq.to_be_bytes(), bytes)?;
        Ok(())
    }

    fn find(&self, key: &PendingKey) -> Result<Option<PendingEntry>> {
        let encoded = key.encode();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let entry = Self::decode(&bytes)?;
            if entry.key == encoded {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// 入账：同键条目被替换并挪到队尾
    pub fn append(&self, key: &PendingKey, request: Request) -> Result<PendingEntry> {
        if let Some(existing) = self.find(key)? {
            self.tree.remove(existing.seq.to_be_bytes())?;
        }
        let entry = PendingEntry {
            key: key.encode(),
            seq: self.db.generate_id()?,
            request,
            created_at: Utc::now().to_rfc3339(),
            last_sent_at: None,
        };
        self.write(&entry)?;
        Ok(entry)
    }

    pub fn get(&self, key: &PendingKey) -> Result<Option<PendingEntry>> {
        self.find(key)
    }

    /// 出账；返回是否确有该条目
    pub fn remove(&self, key: &PendingKey) -> Result<bool> {
        match self.find(key)? {
            Some(entry) => {
                self.tree.remove(entry.seq.to_be_bytes())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 按加入顺序取出全部条目
    pub fn list_all(&self) -> Result<Vec<PendingEntry>> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            entries.push(Self::decode(&bytes)?);
        }
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// 重发节流：距上次发送不足 5 秒返回 false（本次不发）
    ///
    /// 返回 true 时已把 last_sent_at 更新为当前时间。
    pub fn mark_sent(&self, key: &PendingKey) -> Result<bool> {
        let Some(mut entry) = self.find(key)? else {
            return Ok(false);
        };
        let now = Utc::now().timestamp_millis();
        if let Some(last) = entry.last_sent_at {
            if now - last < RESEND_THROTTLE_MS {
                return Ok(false);
            }
        }
        entry.last_sent_at = Some(now);
        self.write(&entry)?;
        Ok(true)
    }
}

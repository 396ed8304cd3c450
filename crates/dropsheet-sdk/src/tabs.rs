//! 跨标签页广播通道
//!
//! 同源的多个标签页共享一个 best-effort 的发布/订阅通道（浏览器里是
//! BroadcastChannel）。没有顺序和投递保证，消息可能重复或丢失，
//! 消费方必须幂等——缓存条目失效两次是无害的。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// 跨标签页消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabMessage {
    /// 某条记录的缓存已失效，各标签页应逐出对应条目
    InvalidateCache { table: String, id: String },
    /// 请求各标签页上报诊断日志
    RequestLogs,
    /// 上报诊断日志（client 标识来源标签页）
    SendLogs { client: String, log: Value },
    /// 某个账本条目已在其它标签页得到服务端确认
    PendingResolved { key: String },
}

/// 跨标签页广播 trait（浏览器由 BroadcastChannel 实现）
///
/// 发布是 fire-and-forget；本标签页不会收到自己发布的消息。
#[async_trait]
pub trait BroadcastBus: Send + Sync + std::fmt::Debug {
    /// 发布一条消息给其它标签页
    async fn publish(&self, message: TabMessage) -> Result<()>;

    /// 订阅其它标签页发布的消息
    fn subscribe(&self) -> broadcast::Receiver<TabMessage>;
}

/// 测试用：内存广播通道
///
/// `publish` 记录已发出的消息供断言；`inject` 模拟其它标签页发来的消息。
#[derive(Debug)]
pub struct MemoryBus {
    inbound: broadcast::Sender<TabMessage>,
    published: tokio::sync::RwLock<Vec<TabMessage>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        let (inbound, _) = broadcast::channel(256);
        Self {
            inbound,
            published: tokio::sync::RwLock::new(Vec::new()),
        }
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟其它标签页发布一条消息
    pub fn inject(&self, message: TabMessage) {
        let _ = self.inbound.send(message);
    }

    /// 取出本标签页已发布的消息（清空内部记录）
    pub async fn published_messages(&self) -> Vec<TabMessage> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl BroadcastBus for MemoryBus {
    async fn publish(&self, message: TabMessage) -> Result<()> {
        self.published.write().await.push(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TabMessage> {
        self.inbound.subscribe()
    }
}

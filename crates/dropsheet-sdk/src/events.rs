//! 客户端事件流
//!
//! SDK 对上层（UI / 状态容器，不在本 crate 范围内）的出站事件。
//! 请求级的结果由 `dispatch` 的返回值一对一交付；这里是旁路广播：
//! 会话事件（UPDATE_USER）、状态快照，以及请求结果的只读副本。

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::status::Status;

/// 出站事件
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// 一个请求得到响应（id 为关联 ID 的线上形式）
    Response { id: String, response: Value },
    /// 一个请求得到错误
    Error {
        id: Option<String>,
        status: String,
        substatus: Option<String>,
    },
    /// 服务端下发的用户资料（None 表示登出）
    UpdateUser(Option<Value>),
    /// 聚合状态快照
    Status(Status),
}

/// 事件管理器
#[derive(Debug)]
pub struct EventManager {
    sender: broadcast::Sender<ClientEvent>,
    emitted: AtomicU64,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            emitted: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// 广播一个事件（没有订阅方时静默丢弃）
    pub fn emit(&self, event: ClientEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(event);
    }

    /// 已广播的事件总数（诊断用）
    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}

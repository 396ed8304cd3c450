//! 传输层抽象
//!
//! 浏览器环境里这是一个自动重连的 WebSocket；核心状态机不关心具体实现，
//! 只依赖注入的 `Transport` trait（由平台层实现），自身用内存假件即可测试。
//! 重连与退避策略是传输实现的职责，核心层只观察 Opened / Closed 事件。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::error::{DropsheetSDKError, Result};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// 连接中
    Connecting,
    /// 已连接
    Open,
    /// 已断开（传输层会自行重连）
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// 传输层生命周期事件
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// 连接（或重连）建立
    Opened,
    /// 连接断开
    Closed,
    /// 收到一帧文本（JSON）
    Message(String),
}

/// 传输层 trait（由平台层实现，如浏览器 WebSocket 封装）
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// 开始建立连接，返回生命周期事件流
    ///
    /// 重复调用应返回同一事件流的新订阅。
    async fn start(&self) -> Result<broadcast::Receiver<TransportEvent>>;

    /// 发送一帧文本
    ///
    /// 连接不可用时返回 `Transport` 错误，不做内部排队——排队是调度器的职责。
    async fn send(&self, frame: String) -> Result<()>;

    /// 主动关闭连接
    async fn close(&self);
}

/// 测试与演示用：内存传输
///
/// 一端是 SDK，另一端由测试代码扮演服务端：
/// - `open()` / `drop_connection()` 模拟连接建立与断开
/// - `deliver()` 模拟服务端下行消息
/// - `sent_frames()` 取出 SDK 已发送的所有帧
#[derive(Debug)]
pub struct MemoryTransport {
    events: broadcast::Sender<TransportEvent>,
    connected: Arc<RwLock<bool>>,
    sent: Arc<RwLock<Vec<String>>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            connected: Arc::new(RwLock::new(false)),
            sent: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟连接建立
    pub async fn open(&self) {
        *self.connected.write().await = true;
        let _ = self.events.send(TransportEvent::Opened);
    }

    /// 模拟连接断开
    pub async fn drop_connection(&self) {
        *self.connected.write().await = false;
        let _ = self.events.send(TransportEvent::Closed);
    }

    /// 模拟服务端下行一帧
    pub async fn deliver(&self, frame: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(frame.into()));
    }

    /// 取出 SDK 已发送的帧（清空内部记录）
    pub async fn sent_frames(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent.write().await)
    }

    /// 已发送帧数量（不清空）
    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<broadcast::Receiver<TransportEvent>> {
        Ok(self.events.subscribe())
    }

    async fn send(&self, frame: String) -> Result<()> {
        if !*self.connected.read().await {
            return Err(DropsheetSDKError::Transport(
                "memory transport not connected".to_string(),
            ));
        }
        self.sent.write().await.push(frame);
        Ok(())
    }

    async fn close(&self) {
        *self.connected.write().await = false;
        let _ = self.events.send(TransportEvent::Closed);
    }
}

//! 连接管理
//!
//! 持有注入的传输实现，跟踪连接状态，把传输层生命周期事件泵给
//! 调度器（通过 [`ConnectionSink`] 解耦）。重连由传输实现负责，
//! 这里只观察 Opened / Closed 并据此驱动重放与状态广播。

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::error::Result;
use crate::transport::{ConnectionState, Transport, TransportEvent};

/// 连接事件的消费方（由调度器实现）
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// 连接（或重连）建立
    async fn handle_open(&self);
    /// 连接断开
    async fn handle_close(&self);
    /// 收到一帧下行消息
    async fn handle_frame(&self, frame: &str);
}

/// 连接管理器
#[derive(Debug)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            state: RwLock::new(ConnectionState::Closed),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_open(&self) -> bool {
        *self.state.read().await == ConnectionState::Open
    }

    /// 发送一帧；连接不可用时由传输实现报错
    pub async fn send(&self, frame: String) -> Result<()> {
        self.transport.send(frame).await
    }

    /// 启动事件泵
    pub async fn start(self: &Arc<Self>, sink: Arc<dyn ConnectionSink>) -> Result<()> {
        let mut events = self.transport.start().await?;
        *self.state.write().await = ConnectionState::Connecting;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Opened) => {
                        info!("连接已建立");
                        *manager.state.write().await = ConnectionState::Open;
                        sink.handle_open().await;
                    }
                    Ok(TransportEvent::Closed) => {
                        info!("连接已断开");
                        *manager.state.write().await = ConnectionState::Closed;
                        sink.handle_close().await;
                    }
                    Ok(TransportEvent::Message(frame)) => {
                        sink.handle_frame(&frame).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(count, "传输事件消费滞后，丢失事件");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    /// 主动关闭连接
    pub async fn shutdown(&self) {
        self.transport.close().await;
        *self.state.write().await = ConnectionState::Closed;
    }
}

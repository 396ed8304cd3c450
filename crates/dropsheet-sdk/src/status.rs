//! 状态快照
//!
//! 调用方（UI 的联网指示、待同步角标、登录态）订阅的聚合状态。
//! 每次相关事实变化后同步重算并广播完整快照，不做防抖——
//! 订阅方拿到的永远是当前事实，不是增量。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// 缓存快照信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// 最近一次全量同步的时间（ISO-8601）
    pub sync_time: String,
}

/// 聚合状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// 连接是否已建立
    pub connected: bool,
    /// 是否处于显式离线模式
    pub offline: bool,
    /// 待发账本中的条目数
    pub pending_count: usize,
    /// 缓存快照信息；None 表示从未全量同步
    pub cache: Option<CacheStatus>,
    /// 当前会话令牌
    pub current_token: Option<String>,
    /// 登录状态（认证失败时为 AUTHENTICATION_FAILED）
    pub login_status: Option<String>,
}

/// 状态广播器
#[derive(Debug)]
pub struct StatusEmitter {
    sender: broadcast::Sender<Status>,
}

impl Default for StatusEmitter {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl StatusEmitter {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Status> {
        self.sender.subscribe()
    }

    /// 广播一份快照（没有订阅方时静默丢弃）
    pub fn emit(&self, status: Status) {
        let _ = self.sender.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_emit_and_subscribe() {
        let emitter = StatusEmitter::default();
        let mut rx = emitter.subscribe();

        let status = Status {
            connected: false,
            offline: true,
            pending_count: 2,
            cache: Some(CacheStatus {
                sync_time: "2026-08-26T10:00:00Z".to_string(),
            }),
            current_token: Some("tok".to_string()),
            login_status: None,
        };
        emitter.emit(status.clone());
        assert_eq!(rx.recv().await.unwrap(), status);
    }

    #[test]
    fn test_status_wire_shape() {
        let status = Status {
            connected: true,
            offline: false,
            pending_count: 0,
            cache: None,
            current_token: None,
            login_status: Some("AUTHENTICATION_FAILED".to_string()),
        };
        let wire = serde_json::to_value(&status).unwrap();
        assert_eq!(wire["pendingCount"], 0);
        assert_eq!(wire["loginStatus"], "AUTHENTICATION_FAILED");
    }
}

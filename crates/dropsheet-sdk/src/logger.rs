//! 诊断日志环 - 跨标签页日志收集的数据源
//!
//! 与面向人的 `tracing` 日志互补：这里按固定容量保留最近的结构化事件，
//! 其它标签页通过广播 REQUEST_LOGS 时整体打包上报（SEND_LOGS）。

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// 默认保留的事件条数
const DEFAULT_CAPACITY: usize = 500;

/// 一条诊断事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// 事件标签（如 "SERVER_MESSAGE" / "CLIENT_MESSAGE" / "broadcast"）
    pub tag: String,
    /// 事件数据（原样保留的 JSON）
    pub data: Value,
    /// 记录时间（ISO-8601）
    pub at: String,
}

/// 有界诊断日志环
#[derive(Debug)]
pub struct LogRing {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LogRing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// 记录一条事件，超出容量时丢弃最旧的
    pub fn record(&self, tag: &str, data: Value) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            tag: tag.to_string(),
            data,
            at: Utc::now().to_rfc3339(),
        });
    }

    /// 打包当前全部事件（不清空——同一份日志可能被多次请求）
    pub fn grab(&self) -> Value {
        let entries = self.entries.read();
        serde_json::to_value(entries.iter().cloned().collect::<Vec<_>>())
            .unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_ring_bounded() {
        let ring = LogRing::with_capacity(3);
        for i in 0..5 {
            ring.record("test", json!({ "i": i }));
        }
        assert_eq!(ring.len(), 3);

        let grabbed = ring.grab();
        let entries = grabbed.as_array().unwrap();
        // 最旧的两条已被丢弃
        assert_eq!(entries[0]["data"]["i"], 2);
        assert_eq!(entries[2]["data"]["i"], 4);
    }

    #[test]
    fn test_log_ring_grab_does_not_clear() {
        let ring = LogRing::default();
        ring.record("broadcast", json!({"type": "REQUEST_LOGS"}));
        assert_eq!(ring.grab().as_array().unwrap().len(), 1);
        assert_eq!(ring.grab().as_array().unwrap().len(), 1);
    }
}

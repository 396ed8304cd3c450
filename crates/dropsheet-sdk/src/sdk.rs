//! Dropsheet SDK 主入口
//!
//! 负责把各组件装配起来：存储、连接、调度器、跨标签页通道、状态广播。
//! 平台相关的传输与广播实现由调用方注入（浏览器壳提供 WebSocket /
//! BroadcastChannel 封装，测试注入内存假件）。

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::connection::{ConnectionManager, ConnectionSink};
use crate::dispatcher::{DispatchOutcome, RequestDispatcher};
use crate::error::{DropsheetSDKError, Result};
use crate::events::{ClientEvent, EventManager};
use crate::logger::LogRing;
use crate::protocol::Request;
use crate::status::{Status, StatusEmitter};
use crate::store::StorageManager;
use crate::tabs::{BroadcastBus, TabMessage};
use crate::transport::Transport;
use crate::version;

/// SDK 配置
#[derive(Debug, Clone)]
pub struct DropsheetConfig {
    /// 本地存储目录
    pub data_dir: PathBuf,
    /// 显式离线模式（对应 URL `?offline` 开关）
    pub offline_mode: bool,
    /// 快照过期阈值（小时），超过后自动触发全量同步
    pub stale_after_hours: i64,
    /// 事件广播缓冲大小
    pub event_buffer: usize,
    /// 跨标签页日志上报时的来源标识
    pub client_name: String,
}

impl DropsheetConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            offline_mode: false,
            stale_after_hours: 1,
            event_buffer: 256,
            client_name: "shared-worker".to_string(),
        }
    }

    pub fn builder(data_dir: impl AsRef<Path>) -> DropsheetConfigBuilder {
        DropsheetConfigBuilder {
            config: Self::new(data_dir),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(DropsheetSDKError::Config(
                "event_buffer 必须大于 0".to_string(),
            ));
        }
        if self.stale_after_hours <= 0 {
            return Err(DropsheetSDKError::Config(
                "stale_after_hours 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug)]
pub struct DropsheetConfigBuilder {
    config: DropsheetConfig,
}

impl DropsheetConfigBuilder {
    pub fn offline_mode(mut self, offline_mode: bool) -> Self {
        self.config.offline_mode = offline_mode;
        self
    }

    pub fn stale_after_hours(mut self, hours: i64) -> Self {
        self.config.stale_after_hours = hours;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    pub fn build(self) -> Result<DropsheetConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Dropsheet SDK
pub struct DropsheetSDK {
    config: DropsheetConfig,
    storage: StorageManager,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<RequestDispatcher>,
    emitter: Arc<StatusEmitter>,
    events: Arc<EventManager>,
    log: Arc<LogRing>,
}

impl DropsheetSDK {
    /// 装配并启动全部组件
    ///
    /// 启动即广播一次持久化的用户资料与初始状态快照，
    /// 让 UI 在连接建立前就能渲染离线会话。
    pub async fn initialize(
        config: DropsheetConfig,
        transport: Arc<dyn Transport>,
        bus: Arc<dyn BroadcastBus>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            version = version::SDK_VERSION,
            data_dir = %config.data_dir.display(),
            offline = config.offline_mode,
            "初始化 Dropsheet SDK"
        );

        let storage = StorageManager::new(&config.data_dir)?;
        let connection = ConnectionManager::new(transport);
        let emitter = Arc::new(StatusEmitter::default());
        let events = Arc::new(EventManager::new(config.event_buffer));
        let log = Arc::new(LogRing::default());

        let dispatcher = RequestDispatcher::new(
            storage.clone(),
            connection.clone(),
            bus.clone(),
            emitter.clone(),
            events.clone(),
            log.clone(),
            config.offline_mode,
            config.stale_after_hours,
        )?;
        connection
            .start(dispatcher.clone() as Arc<dyn ConnectionSink>)
            .await?;

        Self::spawn_bus_pump(
            bus,
            dispatcher.clone(),
            log.clone(),
            config.client_name.clone(),
        );

        let sdk = Self {
            config,
            storage,
            connection,
            dispatcher,
            emitter,
            events,
            log,
        };

        sdk.events
            .emit(ClientEvent::UpdateUser(sdk.storage.kv.user()?));
        sdk.dispatcher.refresh_status().await;
        Ok(sdk)
    }

    /// 消费其它标签页的广播
    fn spawn_bus_pump(
        bus: Arc<dyn BroadcastBus>,
        dispatcher: Arc<RequestDispatcher>,
        log: Arc<LogRing>,
        client_name: String,
    ) {
        let mut messages = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        if !matches!(message, TabMessage::SendLogs { .. }) {
                            log.record(
                                "broadcast",
                                serde_json::to_value(&message).unwrap_or(json!(null)),
                            );
                        }
                        match message {
                            TabMessage::RequestLogs => {
                                let reply = TabMessage::SendLogs {
                                    client: client_name.clone(),
                                    log: log.grab(),
                                };
                                if let Err(e) = bus.publish(reply).await {
                                    warn!(error = %e, "上报日志失败");
                                }
                            }
                            TabMessage::PendingResolved { key } => {
                                dispatcher.on_peer_resolved(&key).await;
                            }
                            // 缓存失效消费方在 UI 层；存储本身是共享的
                            TabMessage::InvalidateCache { .. } | TabMessage::SendLogs { .. } => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(count, "跨标签页消息消费滞后");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// 调度一个请求
    pub async fn dispatch(&self, request: Request) -> DispatchOutcome {
        self.dispatcher.dispatch(request).await
    }

    /// 请求一次全量同步
    pub async fn request_sync(&self) -> DispatchOutcome {
        self.dispatcher.request_sync().await
    }

    /// 订阅出站事件流
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// 订阅状态快照
    pub fn subscribe_status(&self) -> broadcast::Receiver<Status> {
        self.emitter.subscribe()
    }

    /// 当前持久化的会话令牌
    pub fn current_token(&self) -> Result<Option<String>> {
        self.storage.kv.token()
    }

    /// 当前持久化的用户资料
    pub fn current_user(&self) -> Result<Option<serde_json::Value>> {
        self.storage.kv.user()
    }

    pub fn config(&self) -> &DropsheetConfig {
        &self.config
    }

    /// 打包当前的诊断日志（与跨标签页 SEND_LOGS 同一份数据）
    pub fn grab_logs(&self) -> serde_json::Value {
        self.log.grab()
    }

    pub fn version() -> &'static str {
        version::SDK_VERSION
    }

    /// 关闭连接（存储随 Drop 落盘）
    pub async fn shutdown(&self) {
        info!("关闭 Dropsheet SDK");
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabs::MemoryBus;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use tempfile::TempDir;

    async fn sdk(offline_mode: bool) -> (TempDir, DropsheetSDK, Arc<MemoryTransport>, Arc<MemoryBus>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = TempDir::new().unwrap();
        let config = DropsheetConfig::builder(dir.path())
            .offline_mode(offline_mode)
            .client_name("test-tab")
            .build()
            .unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let bus = Arc::new(MemoryBus::new());
        let sdk = DropsheetSDK::initialize(
            config,
            transport.clone() as Arc<dyn Transport>,
            bus.clone() as Arc<dyn BroadcastBus>,
        )
        .await
        .unwrap();
        (dir, sdk, transport, bus)
    }

    #[test]
    fn test_config_builder_validation() {
        assert!(DropsheetConfig::builder("/tmp/x").event_buffer(0).build().is_err());
        assert!(DropsheetConfig::builder("/tmp/x")
            .stale_after_hours(0)
            .build()
            .is_err());
        let config = DropsheetConfig::builder("/tmp/x")
            .offline_mode(true)
            .build()
            .unwrap();
        assert!(config.offline_mode);
        assert_eq!(config.stale_after_hours, 1);
    }

    #[tokio::test]
    async fn test_startup_emits_persisted_user_and_status() {
        let dir = TempDir::new().unwrap();
        {
            let storage = StorageManager::new(dir.path()).unwrap();
            storage
                .kv
                .set_user(Some(&json!({"email": "painter@example.com"})))
                .unwrap();
        }
        let config = DropsheetConfig::new(dir.path());
        let transport = Arc::new(MemoryTransport::new());
        let bus = Arc::new(MemoryBus::new());

        // 先拿不到事件流，用初始化后的首批广播验证
        let sdk = DropsheetSDK::initialize(
            config,
            transport as Arc<dyn Transport>,
            bus as Arc<dyn BroadcastBus>,
        )
        .await
        .unwrap();
        assert_eq!(
            sdk.current_user().unwrap().unwrap()["email"],
            "painter@example.com"
        );
    }

    #[tokio::test]
    async fn test_request_logs_answered_over_bus() {
        let (_dir, sdk, _transport, bus) = sdk(true).await;
        sdk.dispatch(Request::Records {
            table_name: "project".to_string(),
        })
        .await;

        bus.inject(TabMessage::RequestLogs);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let replies = bus.published_messages().await;
        let logs = replies.iter().find_map(|m| match m {
            TabMessage::SendLogs { client, log } => Some((client.clone(), log.clone())),
            _ => None,
        });
        let (client, log) = logs.expect("no SEND_LOGS reply");
        assert_eq!(client, "test-tab");
        assert!(!log.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_offline_dispatch() {
        let (_dir, sdk, _transport, _bus) = sdk(true).await;
        let outcome = sdk
            .dispatch(Request::Store {
                table_name: "invoice".to_string(),
                form: "f".to_string(),
                record: json!({"id": "r1", "total": "10.00"}),
            })
            .await;
        assert!(matches!(outcome, DispatchOutcome::Response(_)));

        let outcome = sdk
            .dispatch(Request::Record {
                table_name: "invoice".to_string(),
                record_id: "r1".to_string(),
            })
            .await;
        match outcome {
            DispatchOutcome::Response(response) => assert_eq!(response["record"]["id"], "r1"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}

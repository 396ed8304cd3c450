//! Dropsheet SDK - 离线优先的同步/请求层
//!
//! Dropsheet 客户端的核心状态机，包括：
//! - 📡 连接管理与断线重连后的账本重放
//! - 📦 本地缓存快照与离线查询引擎
//! - 📝 待发账本：离线写操作持久化，重连后按序重放
//! - 🔀 请求调度：在线/离线路由、关联 ID 匹配、全量同步单飞守卫
//! - 📢 跨标签页广播：缓存失效、待发确认、日志收集
//! - 📊 聚合状态快照：连接、离线、待发数、同步时间、登录态
//!
//! 浏览器平台能力（WebSocket / IndexedDB / BroadcastChannel）以注入的
//! trait 对象建模，核心逻辑可在原生环境直接运行与测试。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dropsheet_sdk::{
//!     BroadcastBus, DropsheetConfig, DropsheetSDK, MemoryBus, MemoryTransport, Request,
//!     Transport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DropsheetConfig::builder("/path/to/data")
//!         .offline_mode(false)
//!         .build()?;
//!
//!     // 平台层注入传输与广播实现（这里用内存假件演示）
//!     let transport = Arc::new(MemoryTransport::new());
//!     let bus = Arc::new(MemoryBus::new());
//!     let sdk = DropsheetSDK::initialize(
//!         config,
//!         transport as Arc<dyn Transport>,
//!         bus as Arc<dyn BroadcastBus>,
//!     )
//!     .await?;
//!
//!     // 调度一个请求：在线上网络，离线由缓存应答
//!     let outcome = sdk
//!         .dispatch(Request::Records {
//!             table_name: "project".to_string(),
//!         })
//!         .await;
//!     println!("结果: {:?}", outcome);
//!
//!     sdk.shutdown().await;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logger;
pub mod offline;
pub mod protocol;
pub mod sdk;
pub mod status;
pub mod store;
pub mod tabs;
pub mod transport;
pub mod version;

// 重新导出核心类型，方便使用
pub use connection::{ConnectionManager, ConnectionSink};
pub use dispatcher::{DispatchOutcome, RequestDispatcher};
pub use error::{DropsheetSDKError, Result};
pub use events::{ClientEvent, EventManager};
pub use logger::{LogEntry, LogRing};
pub use offline::LocalResponder;
pub use protocol::{
    ClientMessage, CorrelationId, FilterDetail, FilterSpec, PendingKey, Request, ServerMessage,
};
pub use sdk::{DropsheetConfig, DropsheetConfigBuilder, DropsheetSDK};
pub use status::{CacheStatus, Status, StatusEmitter};
pub use store::{
    cache::CacheStore, kv::KvStore, ledger::PendingEntry, ledger::PendingLedger, StorageManager,
};
pub use tabs::{BroadcastBus, MemoryBus, TabMessage};
pub use transport::{ConnectionState, MemoryTransport, Transport, TransportEvent};

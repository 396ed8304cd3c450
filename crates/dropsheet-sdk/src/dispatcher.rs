//! 请求调度
//!
//! 核心路由规则：显式离线模式、连接未建立或没有会话令牌时走本地路径
//! （缓存应答 + 账本入账 + 立即合成成功）；否则上网络并等待按关联 ID
//! 匹配的 RESPONSE / ERROR。每次 `dispatch` 恰好交付一个结果。
//!
//! 其它职责：
//! - 连接建立时重新认证并重放整个账本
//! - 写请求上网络前先冲刷同键/同表的待发条目（顺序一致性）
//! - 全量同步的单飞守卫：同一时刻至多一个 OFFLINE 在途，并发调用
//!   共享同一个结果
//! - 重放确认按键出账；PATCH 支持部分确认（只销已应用的补丁）
//! - 重放被拒绝时把条目转成 ChangeRejected 记录入账，内容不丢
//! - 每次成功写操作（本地或远端）广播缓存失效
//! - 认证失败清令牌并标记登录态

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{ConnectionManager, ConnectionSink};
use crate::error::{DropsheetSDKError, Result};
use crate::events::{ClientEvent, EventManager};
use crate::logger::LogRing;
use crate::offline::{LocalResponder, PRINT_TABLE};
use crate::protocol::{
    ClientMessage, CorrelationId, PendingKey, Request, ServerMessage, AUTHENTICATION_FAILED,
    LOCAL_ERROR,
};
use crate::status::{CacheStatus, Status, StatusEmitter};
use crate::store::ledger::PendingEntry;
use crate::store::StorageManager;
use crate::tabs::{BroadcastBus, TabMessage};

/// 冲刷待发条目时等待确认的上限（超时后重试整轮）
const PENDING_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// 被拒绝变更的归档表
const CHANGE_REJECTED_TABLE: &str = "ChangeRejected";

/// 一次 dispatch 的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Response(Value),
    Error {
        status: String,
        substatus: Option<String>,
    },
}

impl DispatchOutcome {
    fn local_error(detail: impl Into<String>) -> Self {
        DispatchOutcome::Error {
            status: LOCAL_ERROR.to_string(),
            substatus: Some(detail.into()),
        }
    }
}

/// 会话状态（显式结构体，不散落在模块全局里）
#[derive(Debug)]
struct SessionState {
    token: Option<String>,
    login_status: Option<String>,
    /// 全量同步单飞守卫；只在对应响应落地时清除
    cache_asked: bool,
}

struct PendingHandler {
    request: Request,
    tx: oneshot::Sender<DispatchOutcome>,
}

/// 请求调度器
pub struct RequestDispatcher {
    storage: StorageManager,
    responder: LocalResponder,
    connection: Arc<ConnectionManager>,
    bus: Arc<dyn BroadcastBus>,
    emitter: Arc<StatusEmitter>,
    events: Arc<EventManager>,
    log: Arc<LogRing>,
    /// 显式离线模式（用户 / URL 驱动，区别于单纯掉线）
    offline_mode: bool,
    /// 快照超过该小时数即自动触发全量同步
    stale_after_hours: i64,
    session: RwLock<SessionState>,
    handlers: Mutex<HashMap<String, PendingHandler>>,
    sync_waiters: Mutex<Vec<oneshot::Sender<DispatchOutcome>>>,
    /// 账本条目得到确认（本地或其它标签页）的通知
    resolved: broadcast::Sender<String>,
}

impl RequestDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: StorageManager,
        connection: Arc<ConnectionManager>,
        bus: Arc<dyn BroadcastBus>,
        emitter: Arc<StatusEmitter>,
        events: Arc<EventManager>,
        log: Arc<LogRing>,
        offline_mode: bool,
        stale_after_hours: i64,
    ) -> Result<Arc<Self>> {
        let token = storage.kv.token()?;
        let responder = LocalResponder::new(storage.clone());
        let (resolved, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            storage,
            responder,
            connection,
            bus,
            emitter,
            events,
            log,
            offline_mode,
            stale_after_hours,
            session: RwLock::new(SessionState {
                token,
                login_status: None,
                cache_asked: false,
            }),
            handlers: Mutex::new(HashMap::new()),
            sync_waiters: Mutex::new(Vec::new()),
            resolved,
        }))
    }

    /// 调度一个请求，交付恰好一个结果
    pub async fn dispatch(&self, request: Request) -> DispatchOutcome {
        self.log.record(
            "CLIENT_MESSAGE",
            serde_json::to_value(&request).unwrap_or(Value::Null),
        );
        match request {
            Request::SetUser { token } => self.set_user(token).await,
            Request::Logout => self.logout().await,
            Request::Offline => self.request_sync().await,
            Request::Timeout { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                DispatchOutcome::Response(json!({"status": "OK"}))
            }
            // 浏览器壳信号：本地完成，不上线、不入账
            Request::RedirectHash { .. } | Request::OpenHash { .. } | Request::Finished => {
                DispatchOutcome::Response(json!({"status": "OK"}))
            }
            request @ (Request::LocalStore { .. } | Request::LocalPatch { .. }) => {
                self.local(request).await
            }
            request => {
                if self.use_local_path().await {
                    self.local(request).await
                } else {
                    self.network(request).await
                }
            }
        }
    }

    async fn use_local_path(&self) -> bool {
        if self.offline_mode {
            return true;
        }
        if !self.connection.is_open().await {
            return true;
        }
        self.session.read().await.token.is_none()
    }

    /// 本地路径：缓存应答，失败包装成 Local Error
    async fn local(&self, request: Request) -> DispatchOutcome {
        let outcome = match self.responder.respond(&request) {
            Ok(response) => DispatchOutcome::Response(response),
            Err(e) => {
                warn!(kind = request.kind(), error = %e, "本地应答失败");
                DispatchOutcome::local_error(e.to_string())
            }
        };
        if matches!(outcome, DispatchOutcome::Response(_)) {
            self.broadcast_invalidation(&request).await;
        }
        self.refresh_status().await;
        outcome
    }

    /// 网络路径：冲刷同键待发条目后发送，等待关联响应
    async fn network(&self, request: Request) -> DispatchOutcome {
        self.flush_pending(&request).await;

        let id = CorrelationId::fresh();
        let frame = match ClientMessage::envelope(&id, request.clone()).to_frame() {
            Ok(frame) => frame,
            Err(e) => return DispatchOutcome::local_error(e.to_string()),
        };

        let (tx, rx) = oneshot::channel();
        self.handlers
            .lock()
            .await
            .insert(id.encode(), PendingHandler {
                request: request.clone(),
                tx,
            });

        if let Err(e) = self.connection.send(frame).await {
            // 发送失败视同连接不可用，回退本地路径
            warn!(error = %e, "发送失败，回退本地应答");
            self.handlers.lock().await.remove(&id.encode());
            return self.local(request).await;
        }
        self.refresh_status().await;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => DispatchOutcome::local_error("调度器已关闭"),
        }
    }

    async fn set_user(&self, token: Option<String>) -> DispatchOutcome {
        if let Err(e) = self.storage.kv.set_token(token.as_deref()) {
            return DispatchOutcome::local_error(e.to_string());
        }
        {
            let mut session = self.session.write().await;
            session.token = token.clone();
            session.login_status = None;
        }
        self.refresh_status().await;

        if !self.offline_mode && self.connection.is_open().await {
            match ClientMessage::Bare(Request::SetUser { token }).to_frame() {
                Ok(frame) => {
                    if let Err(e) = self.connection.send(frame).await {
                        warn!(error = %e, "发送 SET_USER 失败");
                    } else {
                        self.replay_pending().await;
                    }
                }
                Err(e) => warn!(error = %e, "序列化 SET_USER 失败"),
            }
        }
        DispatchOutcome::Response(json!({"status": "OK"}))
    }

    async fn logout(&self) -> DispatchOutcome {
        if let Err(e) = self.storage.kv.set_token(None) {
            return DispatchOutcome::local_error(e.to_string());
        }
        self.session.write().await.token = None;
        if !self.offline_mode && self.connection.is_open().await {
            match ClientMessage::Bare(Request::Logout).to_frame() {
                Ok(frame) => {
                    if let Err(e) = self.connection.send(frame).await {
                        warn!(error = %e, "发送 LOGOUT 失败");
                    }
                }
                Err(e) => warn!(error = %e, "序列化 LOGOUT 失败"),
            }
        }
        self.refresh_status().await;
        DispatchOutcome::Response(json!({"status": "OK"}))
    }

    /// 全量同步：单飞守卫，并发调用共享同一个结果
    pub async fn request_sync(&self) -> DispatchOutcome {
        if self.offline_mode || !self.connection.is_open().await {
            return DispatchOutcome::local_error("离线状态下无法全量同步");
        }

        let (tx, rx) = oneshot::channel();
        let need_start = {
            let mut session = self.session.write().await;
            self.sync_waiters.lock().await.push(tx);
            if session.cache_asked {
                false
            } else {
                session.cache_asked = true;
                true
            }
        };

        if need_start {
            if let Err(e) = self.start_sync().await {
                self.session.write().await.cache_asked = false;
                let outcome = DispatchOutcome::local_error(e.to_string());
                for waiter in self.sync_waiters.lock().await.drain(..) {
                    let _ = waiter.send(outcome.clone());
                }
                return outcome;
            }
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => DispatchOutcome::local_error("调度器已关闭"),
        }
    }

    /// 发出同步请求（守卫由调用方置位）
    async fn start_sync(&self) -> Result<()> {
        info!("请求全量同步");
        self.replay_pending().await;
        let frame = ClientMessage::envelope(&CorrelationId::Sync, Request::Offline).to_frame()?;
        self.connection.send(frame).await
    }

    /// 重放整个账本
    ///
    /// 有真实数据变更时 PRINT 占位条目靠后：先只发数据变更，
    /// 等下一轮（它们确认后）再发 PRINT。
    pub async fn replay_pending(&self) {
        let entries = match self.storage.ledger.list_all() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "读取账本失败");
                return;
            }
        };
        let print_prefix = format!("{}@", PRINT_TABLE);
        let data_changes: Vec<&PendingEntry> = entries
            .iter()
            .filter(|entry| !entry.key.starts_with(&print_prefix))
            .collect();
        let targets: Vec<&PendingEntry> = if data_changes.is_empty() {
            entries.iter().collect()
        } else {
            data_changes
        };

        for entry in targets {
            let Some(key) = entry.pending_key() else {
                warn!(key = %entry.key, "账本键无法解析，跳过");
                continue;
            };
            match self.storage.ledger.mark_sent(&key) {
                Ok(true) => {
                    if let Err(e) = self.send_replay(entry).await {
                        warn!(key = %entry.key, error = %e, "重放条目失败");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(key = %entry.key, error = %e, "标记重发失败"),
            }
        }
    }

    async fn send_replay(&self, entry: &PendingEntry) -> Result<()> {
        let key = entry
            .pending_key()
            .ok_or_else(|| DropsheetSDKError::InvalidData(format!("非法账本键: {}", entry.key)))?;
        let id = CorrelationId::Replay {
            key,
            kind: entry.request.kind().to_string(),
        };
        let frame = ClientMessage::envelope(&id, entry.request.clone()).to_frame()?;
        self.connection.send(frame).await
    }

    /// 上网络前冲刷与该请求同键（写）或同表（读）的待发条目
    ///
    /// 循环到没有相关条目为止；每轮重发（带 5 秒节流）并等待确认，
    /// 超时后重试整轮。保证服务端按本地发生顺序看到变更。
    async fn flush_pending(&self, request: &Request) {
        loop {
            let keys = match self.flush_candidates(request) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(error = %e, "读取待发条目失败");
                    return;
                }
            };
            if keys.is_empty() {
                return;
            }

            let mut resolved = self.resolved.subscribe();
            for key in &keys {
                match self.storage.ledger.mark_sent(key) {
                    Ok(true) => match self.storage.ledger.get(key) {
                        Ok(Some(entry)) => {
                            if let Err(e) = self.send_replay(&entry).await {
                                warn!(key = %key, error = %e, "冲刷重发失败");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(key = %key, error = %e, "读取账本条目失败"),
                    },
                    Ok(false) => {}
                    Err(e) => warn!(key = %key, error = %e, "标记重发失败"),
                }
            }

            let mut remaining: HashSet<String> = keys.iter().map(PendingKey::encode).collect();
            let deadline = tokio::time::Instant::now() + PENDING_FLUSH_TIMEOUT;
            while !remaining.is_empty() {
                match tokio::time::timeout_at(deadline, resolved.recv()).await {
                    Ok(Ok(key)) => {
                        remaining.remove(&key);
                    }
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            if !remaining.is_empty() {
                // 超时重试前加抖动，避免多个等待方同步重发
                let jitter = rand::thread_rng().gen_range(0..250);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
        }
    }

    fn flush_candidates(&self, request: &Request) -> Result<Vec<PendingKey>> {
        match request {
            Request::Record { .. }
            | Request::Store { .. }
            | Request::Delete { .. }
            | Request::Patch { .. } => match request.pending_key() {
                Some(key) if self.storage.ledger.get(&key)?.is_some() => Ok(vec![key]),
                _ => Ok(Vec::new()),
            },
            Request::Query { table_name, .. } | Request::Records { table_name } => {
                let mut keys = Vec::new();
                for entry in self.storage.ledger.list_all()? {
                    if let Some(key) = entry.pending_key() {
                        if key.table == *table_name {
                            keys.push(key);
                        }
                    }
                }
                Ok(keys)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// 处理服务端下行消息
    pub async fn handle_server_message(&self, message: ServerMessage) {
        self.log.record(
            "SERVER_MESSAGE",
            serde_json::to_value(&message).unwrap_or(Value::Null),
        );
        match message {
            ServerMessage::Response { id, response } => match CorrelationId::parse(&id) {
                CorrelationId::Sync => self.finish_sync(response).await,
                CorrelationId::Replay { key, kind } => {
                    self.pending_return(&key, &kind, &response).await;
                    self.refresh_status().await;
                }
                CorrelationId::Fresh(raw) => self.resolve_fresh(&raw, Ok(response)).await,
            },
            ServerMessage::Error {
                id: Some(id),
                status,
                substatus,
            } => match CorrelationId::parse(&id) {
                CorrelationId::Sync => {
                    self.session.write().await.cache_asked = false;
                    self.drain_sync_waiters(DispatchOutcome::Error { status, substatus })
                        .await;
                    self.refresh_status().await;
                }
                CorrelationId::Replay { key, .. } => {
                    self.pending_rejected(&key).await;
                    self.refresh_status().await;
                }
                CorrelationId::Fresh(raw) => {
                    self.resolve_fresh(&raw, Err((status, substatus))).await
                }
            },
            ServerMessage::Error {
                id: None,
                status,
                substatus,
            } => {
                if status == AUTHENTICATION_FAILED {
                    if let Err(e) = self.storage.kv.set_token(None) {
                        warn!(error = %e, "清除令牌失败");
                    }
                    {
                        let mut session = self.session.write().await;
                        session.token = None;
                        session.login_status =
                            Some(substatus.clone().unwrap_or_else(|| status.clone()));
                    }
                    info!("认证失败，会话令牌已清除");
                    self.refresh_status().await;
                } else {
                    error!(status = %status, ?substatus, "会话级服务端错误");
                }
            }
            ServerMessage::UpdateUser { user } => {
                if let Err(e) = self.storage.kv.set_user(user.as_ref()) {
                    warn!(error = %e, "持久化用户资料失败");
                }
                self.events.emit(ClientEvent::UpdateUser(user));
            }
        }
    }

    /// 普通请求的响应 / 错误按关联 ID 交付；无主消息静默丢弃
    async fn resolve_fresh(
        &self,
        raw: &str,
        result: std::result::Result<Value, (String, Option<String>)>,
    ) {
        let handler = self.handlers.lock().await.remove(raw);
        let Some(handler) = handler else {
            debug!(id = raw, "无主关联 ID，丢弃");
            return;
        };
        match result {
            Ok(response) => {
                if let Err(e) = self.storage.cache.peek_refresh(&handler.request, &response) {
                    warn!(error = %e, "缓存顺带刷新失败");
                }
                self.broadcast_invalidation(&handler.request).await;
                self.events.emit(ClientEvent::Response {
                    id: raw.to_string(),
                    response: response.clone(),
                });
                let _ = handler.tx.send(DispatchOutcome::Response(response));
            }
            Err((status, substatus)) => {
                self.events.emit(ClientEvent::Error {
                    id: Some(raw.to_string()),
                    status: status.clone(),
                    substatus: substatus.clone(),
                });
                let _ = handler.tx.send(DispatchOutcome::Error { status, substatus });
            }
        }
    }

    /// 全量同步响应落地：整表替换快照，最后推进同步时间
    async fn finish_sync(&self, response: Value) {
        let outcome = match response.get("records").and_then(Value::as_object) {
            Some(records) => match self.storage.cache.apply_snapshot(records) {
                Ok(count) => {
                    let now = Utc::now().to_rfc3339();
                    if let Err(e) = self.storage.kv.set_sync_time(&now) {
                        warn!(error = %e, "写入同步时间失败");
                    }
                    info!(count, "全量同步完成");
                    DispatchOutcome::Response(response.clone())
                }
                Err(e) => {
                    warn!(error = %e, "应用全量快照失败");
                    DispatchOutcome::local_error(e.to_string())
                }
            },
            None => DispatchOutcome::local_error("同步响应缺少 records"),
        };
        self.session.write().await.cache_asked = false;
        self.drain_sync_waiters(outcome).await;
        self.refresh_status().await;
    }

    async fn drain_sync_waiters(&self, outcome: DispatchOutcome) {
        for waiter in self.sync_waiters.lock().await.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// 重放确认：纯按键出账，从不比对内容（last-write-wins）
    async fn pending_return(&self, key: &PendingKey, kind: &str, response: &Value) {
        match self.storage.ledger.get(key) {
            Ok(Some(entry)) if entry.request.kind() == kind => match &entry.request {
                Request::Patch { .. } => self.settle_patch_ack(key, entry, response).await,
                _ => {
                    if let Err(e) = self.storage.ledger.remove(key) {
                        warn!(key = %key, error = %e, "出账失败");
                    }
                }
            },
            Ok(_) => {}
            Err(e) => warn!(key = %key, error = %e, "读取账本条目失败"),
        }
        self.notify_resolved(key).await;
    }

    /// PATCH 部分确认：只销服务端报告已应用的补丁，剩余重新入账
    async fn settle_patch_ack(&self, key: &PendingKey, entry: PendingEntry, response: &Value) {
        let applied: HashSet<&str> = response
            .get("appliedPatches")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        if let Request::Patch {
            table_name,
            form,
            id,
            overwrite,
            patches,
            patch_ids,
        } = entry.request
        {
            let mut left_patches = Vec::new();
            let mut left_ids = Vec::new();
            for (patch, patch_id) in patches.into_iter().zip(patch_ids.into_iter()) {
                if !applied.contains(patch_id.as_str()) {
                    left_patches.push(patch);
                    left_ids.push(patch_id);
                }
            }
            let result = if left_patches.is_empty() {
                self.storage.ledger.remove(key).map(|_| ())
            } else {
                // 重新入账（重发节流随之重置）
                self.storage
                    .ledger
                    .append(key, Request::Patch {
                        table_name,
                        form,
                        id,
                        overwrite,
                        patches: left_patches,
                        patch_ids: left_ids,
                    })
                    .map(|_| ())
            };
            if let Err(e) = result {
                warn!(key = %key, error = %e, "处理补丁确认失败");
            }
        }
    }

    /// 重放被服务端拒绝：出账并归档成 ChangeRejected 记录
    async fn pending_rejected(&self, key: &PendingKey) {
        let entry = match self.storage.ledger.get(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "读取账本条目失败");
                None
            }
        };
        if let Err(e) = self.storage.ledger.remove(key) {
            warn!(key = %key, error = %e, "出账失败");
        }

        let rejected_id = Uuid::new_v4().simple().to_string();
        let detail = entry
            .as_ref()
            .and_then(|entry| serde_json::to_string(&entry.request).ok())
            .unwrap_or_default();
        let store = Request::Store {
            table_name: CHANGE_REJECTED_TABLE.to_string(),
            form: "pending change".to_string(),
            record: json!({
                "id": rejected_id,
                "recordVersion": null,
                "addedBy": null,
                "addedDateTime": null,
                "tableName": "",
                "recordId": null,
                "detail": detail,
            }),
        };
        match self.responder.respond(&store) {
            Ok(_) => {
                warn!(key = %key, "重放被拒绝，已归档为 ChangeRejected");
                if self.connection.is_open().await {
                    if let Some(new_key) = store.pending_key() {
                        if let (Ok(true), Ok(Some(new_entry))) = (
                            self.storage.ledger.mark_sent(&new_key),
                            self.storage.ledger.get(&new_key),
                        ) {
                            if let Err(e) = self.send_replay(&new_entry).await {
                                warn!(error = %e, "发送 ChangeRejected 失败");
                            }
                        }
                    }
                }
            }
            Err(e) => warn!(key = %key, error = %e, "归档被拒绝变更失败"),
        }
        self.notify_resolved(key).await;
    }

    /// 账本条目已确认：解除本地等待并通知其它标签页
    async fn notify_resolved(&self, key: &PendingKey) {
        let encoded = key.encode();
        let _ = self.resolved.send(encoded.clone());
        if let Err(e) = self
            .bus
            .publish(TabMessage::PendingResolved { key: encoded })
            .await
        {
            warn!(error = %e, "广播 PENDING_RESOLVED 失败");
        }
    }

    /// 其它标签页确认了某个条目（共享存储里已出账）
    pub async fn on_peer_resolved(&self, key: &str) {
        let _ = self.resolved.send(key.to_string());
        self.refresh_status().await;
    }

    async fn broadcast_invalidation(&self, request: &Request) {
        if let Some((table, id)) = request.invalidation_target() {
            if let Err(e) = self
                .bus
                .publish(TabMessage::InvalidateCache { table, id })
                .await
            {
                warn!(error = %e, "广播缓存失效失败");
            }
        }
    }

    /// 同步重算并广播状态快照；顺带检查快照是否过期
    pub async fn refresh_status(&self) {
        let connected = self.connection.is_open().await;
        let sync_time = match self.storage.kv.sync_time() {
            Ok(sync_time) => sync_time,
            Err(e) => {
                warn!(error = %e, "读取同步时间失败");
                None
            }
        };

        if connected && !self.offline_mode {
            if let Some(raw) = &sync_time {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                    let age = Utc::now().signed_duration_since(parsed.with_timezone(&Utc));
                    if age >= chrono::Duration::hours(self.stale_after_hours) {
                        let need_start = {
                            let mut session = self.session.write().await;
                            if session.cache_asked {
                                false
                            } else {
                                session.cache_asked = true;
                                true
                            }
                        };
                        if need_start {
                            if let Err(e) = self.start_sync().await {
                                warn!(error = %e, "自动同步失败");
                                self.session.write().await.cache_asked = false;
                            }
                        }
                    }
                }
            }
        }

        let session = self.session.read().await;
        let status = Status {
            connected,
            offline: self.offline_mode,
            pending_count: self.storage.ledger.len(),
            cache: sync_time.map(|sync_time| CacheStatus { sync_time }),
            current_token: session.token.clone(),
            login_status: session.login_status.clone(),
        };
        drop(session);
        self.emitter.emit(status.clone());
        self.events.emit(ClientEvent::Status(status));
    }
}

#[async_trait]
impl ConnectionSink for RequestDispatcher {
    async fn handle_open(&self) {
        let token = self.session.read().await.token.clone();
        if let Some(token) = token {
            // 重新认证后重放账本
            match ClientMessage::Bare(Request::SetUser { token: Some(token) }).to_frame() {
                Ok(frame) => {
                    if self.connection.send(frame).await.is_ok() {
                        self.replay_pending().await;
                    }
                }
                Err(e) => warn!(error = %e, "序列化 SET_USER 失败"),
            }
        }
        self.refresh_status().await;
    }

    async fn handle_close(&self) {
        self.refresh_status().await;
    }

    async fn handle_frame(&self, frame: &str) {
        match serde_json::from_str::<ServerMessage>(frame) {
            Ok(message) => self.handle_server_message(message).await,
            Err(e) => warn!(error = %e, "无法解析的下行帧"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusEmitter;
    use crate::tabs::MemoryBus;
    use crate::transport::MemoryTransport;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        transport: Arc<MemoryTransport>,
        bus: Arc<MemoryBus>,
        dispatcher: Arc<RequestDispatcher>,
        storage: StorageManager,
        emitter: Arc<StatusEmitter>,
    }

    async fn harness(offline_mode: bool) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let connection = ConnectionManager::new(transport.clone());
        let bus = Arc::new(MemoryBus::new());
        let emitter = Arc::new(StatusEmitter::default());
        let events = Arc::new(EventManager::default());
        let log = Arc::new(LogRing::default());
        let dispatcher = RequestDispatcher::new(
            storage.clone(),
            connection.clone(),
            bus.clone(),
            emitter.clone(),
            events,
            log,
            offline_mode,
            1,
        )
        .unwrap();
        connection
            .start(dispatcher.clone() as Arc<dyn ConnectionSink>)
            .await
            .unwrap();
        Harness {
            _dir: dir,
            transport,
            bus,
            dispatcher,
            storage,
            emitter,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn store_request(table: &str, id: &str) -> Request {
        Request::Store {
            table_name: table.to_string(),
            form: "f".to_string(),
            record: json!({"id": id}),
        }
    }

    fn latest_status(rx: &mut broadcast::Receiver<Status>) -> Status {
        let mut latest = None;
        while let Ok(status) = rx.try_recv() {
            latest = Some(status);
        }
        latest.expect("no status emitted")
    }

    #[tokio::test]
    async fn test_offline_store_round_trip() {
        let h = harness(true).await;

        let outcome = h.dispatcher.dispatch(store_request("X", "r1")).await;
        match outcome {
            DispatchOutcome::Response(response) => assert_eq!(response["status"], "OK"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(h.storage.ledger.len(), 1);
        let invalidations: Vec<TabMessage> = h
            .bus
            .published_messages()
            .await
            .into_iter()
            .filter(|m| matches!(m, TabMessage::InvalidateCache { .. }))
            .collect();
        assert_eq!(invalidations, vec![TabMessage::InvalidateCache {
            table: "X".to_string(),
            id: "r1".to_string(),
        }]);
    }

    #[tokio::test]
    async fn test_replay_on_open_then_ack_clears_ledger() {
        let h = harness(false).await;

        // 断连状态下写入，走本地路径
        h.dispatcher
            .dispatch(Request::SetUser {
                token: Some("tok".to_string()),
            })
            .await;
        let outcome = h.dispatcher.dispatch(store_request("X", "r1")).await;
        assert!(matches!(outcome, DispatchOutcome::Response(_)));
        assert_eq!(h.storage.ledger.len(), 1);

        // 连接建立：重新认证 + 恰好一次重放
        h.transport.open().await;
        settle().await;
        let frames = h.transport.sent_frames().await;
        assert_eq!(frames.len(), 2);
        let auth: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(auth["type"], "SET_USER");
        let replay: Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(replay["id"], "pending@X@r1@STORE");
        assert_eq!(replay["request"]["type"], "STORE");

        // 服务端确认后出账
        h.transport
            .deliver(
                json!({"type": "RESPONSE", "id": "pending@X@r1@STORE", "response": {"status": "OK"}})
                    .to_string(),
            )
            .await;
        settle().await;
        assert_eq!(h.storage.ledger.len(), 0);
        assert!(h
            .bus
            .published_messages()
            .await
            .contains(&TabMessage::PendingResolved {
                key: "X@r1".to_string()
            }));
    }

    #[tokio::test]
    async fn test_replay_resends_exactly_n_entries() {
        let h = harness(false).await;
        h.storage.kv.set_token(Some("tok")).unwrap();
        for index in 0..3 {
            h.storage
                .ledger
                .append(
                    &PendingKey::new("X", format!("r{}", index)),
                    store_request("X", &format!("r{}", index)),
                )
                .unwrap();
        }
        // 令牌在构造时装载，重新构造调度器以读到它
        let h2 = {
            let transport = Arc::new(MemoryTransport::new());
            let connection = ConnectionManager::new(transport.clone());
            let dispatcher = RequestDispatcher::new(
                h.storage.clone(),
                connection.clone(),
                Arc::new(MemoryBus::new()),
                Arc::new(StatusEmitter::default()),
                Arc::new(EventManager::default()),
                Arc::new(LogRing::default()),
                false,
                1,
            )
            .unwrap();
            connection
                .start(dispatcher.clone() as Arc<dyn ConnectionSink>)
                .await
                .unwrap();
            (transport, dispatcher)
        };

        h2.0.open().await;
        settle().await;
        let frames = h2.0.sent_frames().await;
        // SET_USER + 恰好 3 条重放，无重复无遗漏
        assert_eq!(frames.len(), 4);
        let mut replay_ids: Vec<String> = frames[1..]
            .iter()
            .map(|f| {
                serde_json::from_str::<Value>(f).unwrap()["id"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        replay_ids.sort();
        assert_eq!(replay_ids, vec![
            "pending@X@r0@STORE",
            "pending@X@r1@STORE",
            "pending@X@r2@STORE",
        ]);
    }

    #[tokio::test]
    async fn test_correlation_matching_out_of_order() {
        let h = harness(false).await;
        h.transport.open().await;
        settle().await;
        h.dispatcher
            .dispatch(Request::SetUser {
                token: Some("tok".to_string()),
            })
            .await;
        h.transport.sent_frames().await;

        let mut tasks = Vec::new();
        for index in 0..3 {
            let dispatcher = h.dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .dispatch(Request::Record {
                        table_name: "X".to_string(),
                        record_id: format!("r{}", index),
                    })
                    .await
            }));
        }
        settle().await;

        let frames = h.transport.sent_frames().await;
        assert_eq!(frames.len(), 3);
        let sent: Vec<(String, String)> = frames
            .iter()
            .map(|f| {
                let v: Value = serde_json::from_str(f).unwrap();
                (
                    v["id"].as_str().unwrap().to_string(),
                    v["request"]["recordId"].as_str().unwrap().to_string(),
                )
            })
            .collect();

        // 逆序投递响应，每个调用方仍拿到自己的结果
        for (id, record_id) in sent.iter().rev() {
            h.transport
                .deliver(
                    json!({
                        "type": "RESPONSE",
                        "id": id,
                        "response": {"status": "OK", "record": {"id": record_id}},
                    })
                    .to_string(),
                )
                .await;
        }
        for (index, task) in tasks.into_iter().enumerate() {
            match task.await.unwrap() {
                DispatchOutcome::Response(response) => {
                    assert_eq!(response["record"]["id"], format!("r{}", index));
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_sync_single_flight_shares_result() {
        let h = harness(false).await;
        h.transport.open().await;
        settle().await;

        let d1 = h.dispatcher.clone();
        let t1 = tokio::spawn(async move { d1.dispatch(Request::Offline).await });
        let d2 = h.dispatcher.clone();
        let t2 = tokio::spawn(async move { d2.dispatch(Request::Offline).await });
        settle().await;

        // 恰好一次网络发送
        let sync_frames: Vec<String> = h
            .transport
            .sent_frames()
            .await
            .into_iter()
            .filter(|f| f.contains("\"OFFLINE\""))
            .collect();
        assert_eq!(sync_frames.len(), 1);

        h.transport
            .deliver(
                json!({
                    "type": "RESPONSE",
                    "id": "cache",
                    "response": {"status": "OK", "records": {"project": [{"id": "p1"}]}},
                })
                .to_string(),
            )
            .await;

        // 两个调用方共享同一个结果
        assert!(matches!(t1.await.unwrap(), DispatchOutcome::Response(_)));
        assert!(matches!(t2.await.unwrap(), DispatchOutcome::Response(_)));
        assert_eq!(h.storage.cache.all_records("project").unwrap().len(), 1);
        assert!(h.storage.kv.sync_time().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_atomic_replace() {
        let h = harness(false).await;
        h.transport.open().await;
        settle().await;
        // 上一代快照
        h.storage
            .cache
            .apply_snapshot(
                json!({"project": [{"id": "old1"}, {"id": "old2"}]})
                    .as_object()
                    .unwrap(),
            )
            .unwrap();

        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.dispatch(Request::Offline).await });
        settle().await;
        h.transport
            .deliver(
                json!({
                    "type": "RESPONSE",
                    "id": "cache",
                    "response": {"status": "OK", "records": {"project": [
                        {"id": "n1"}, {"id": "n2"}, {"id": "n3"},
                    ]}},
                })
                .to_string(),
            )
            .await;
        task.await.unwrap();

        // 新快照恰好 3 条，无混代记录
        let records = h.storage.cache.all_records("project").unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r["id"].as_str().unwrap().starts_with('n')));
    }

    #[tokio::test]
    async fn test_flush_pending_before_online_write() {
        let h = harness(false).await;
        h.dispatcher
            .dispatch(Request::SetUser {
                token: Some("tok".to_string()),
            })
            .await;
        // 离线写入一条
        h.dispatcher.dispatch(store_request("X", "r1")).await;
        assert_eq!(h.storage.ledger.len(), 1);

        h.transport.open().await;
        settle().await;
        h.transport.sent_frames().await;
        // 确认重连重放的那一次
        h.transport
            .deliver(
                json!({"type": "RESPONSE", "id": "pending@X@r1@STORE", "response": {"status": "OK"}})
                    .to_string(),
            )
            .await;
        settle().await;
        assert_eq!(h.storage.ledger.len(), 0);

        // 再次离线入账（直接写账本模拟另一标签页）
        h.storage
            .ledger
            .append(&PendingKey::new("X", "r1"), store_request("X", "r1"))
            .unwrap();

        // 在线对同一记录写入：先冲刷待发条目，确认后才发新请求
        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .dispatch(Request::Store {
                    table_name: "X".to_string(),
                    form: "f".to_string(),
                    record: json!({"id": "r1", "total": "2"}),
                })
                .await
        });
        settle().await;

        let frames = h.transport.sent_frames().await;
        assert_eq!(frames.len(), 1);
        let replay: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(replay["id"], "pending@X@r1@STORE");

        h.transport
            .deliver(
                json!({"type": "RESPONSE", "id": "pending@X@r1@STORE", "response": {"status": "OK"}})
                    .to_string(),
            )
            .await;
        settle().await;

        let frames = h.transport.sent_frames().await;
        assert_eq!(frames.len(), 1);
        let fresh: Value = serde_json::from_str(&frames[0]).unwrap();
        assert!(fresh["id"].as_str().unwrap().starts_with('p'));
        assert_eq!(fresh["request"]["type"], "STORE");

        h.transport
            .deliver(
                json!({
                    "type": "RESPONSE",
                    "id": fresh["id"],
                    "response": {"status": "OK", "record": {"id": "r1", "total": "2"}},
                })
                .to_string(),
            )
            .await;
        assert!(matches!(
            task.await.unwrap(),
            DispatchOutcome::Response(_)
        ));
    }

    #[tokio::test]
    async fn test_patch_partial_ack_reappends_remainder() {
        let h = harness(false).await;
        let key = PendingKey::new("project", "p1");
        h.storage
            .ledger
            .append(&key, Request::Patch {
                table_name: "project".to_string(),
                form: "f".to_string(),
                id: "p1".to_string(),
                overwrite: false,
                patches: vec![json!({"name": ["a", "b"]}), json!({"name": ["b", "c"]})],
                patch_ids: vec!["patch-a".to_string(), "patch-b".to_string()],
            })
            .unwrap();

        h.dispatcher
            .handle_server_message(ServerMessage::Response {
                id: "pending@project@p1@PATCH".to_string(),
                response: json!({"status": "OK", "appliedPatches": ["patch-a"]}),
            })
            .await;

        let entries = h.storage.ledger.list_all().unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].request {
            Request::Patch { patches, patch_ids, .. } => {
                assert_eq!(patch_ids, &["patch-b".to_string()]);
                assert_eq!(patches[0], json!({"name": ["b", "c"]}));
            }
            other => panic!("unexpected request: {:?}", other),
        }

        // 全部确认后出账
        h.dispatcher
            .handle_server_message(ServerMessage::Response {
                id: "pending@project@p1@PATCH".to_string(),
                response: json!({"status": "OK", "appliedPatches": ["patch-b"]}),
            })
            .await;
        assert_eq!(h.storage.ledger.len(), 0);
    }

    #[tokio::test]
    async fn test_replay_rejection_archives_change() {
        let h = harness(false).await;
        let key = PendingKey::new("X", "r1");
        h.storage
            .ledger
            .append(&key, store_request("X", "r1"))
            .unwrap();

        h.dispatcher
            .handle_server_message(ServerMessage::Error {
                id: Some("pending@X@r1@STORE".to_string()),
                status: "CONFLICT".to_string(),
                substatus: None,
            })
            .await;

        // 原条目出账，取而代之的是 ChangeRejected 归档
        let entries = h.storage.ledger.list_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].key.starts_with("ChangeRejected@"));
        let archived = h.storage.cache.all_records("ChangeRejected").unwrap();
        assert_eq!(archived.len(), 1);
        assert!(archived[0]["detail"].as_str().unwrap().contains("STORE"));
    }

    #[tokio::test]
    async fn test_authentication_failure_clears_token() {
        let h = harness(false).await;
        h.storage.kv.set_token(Some("tok")).unwrap();
        h.dispatcher
            .dispatch(Request::SetUser {
                token: Some("tok".to_string()),
            })
            .await;
        let mut status_rx = h.emitter.subscribe();

        h.dispatcher
            .handle_server_message(ServerMessage::Error {
                id: None,
                status: AUTHENTICATION_FAILED.to_string(),
                substatus: Some("expired".to_string()),
            })
            .await;

        assert!(h.storage.kv.token().unwrap().is_none());
        let status = latest_status(&mut status_rx);
        assert!(status.current_token.is_none());
        assert_eq!(status.login_status.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_status_tracks_ledger_and_connection() {
        let h = harness(true).await;
        let mut status_rx = h.emitter.subscribe();

        h.dispatcher.dispatch(store_request("X", "r1")).await;
        let status = latest_status(&mut status_rx);
        assert_eq!(status.pending_count, 1);
        assert!(!status.connected);
        assert!(status.offline);
    }

    #[tokio::test]
    async fn test_timeout_resolves_locally() {
        let h = harness(true).await;
        let started = tokio::time::Instant::now();
        let outcome = h
            .dispatcher
            .dispatch(Request::Timeout { delay_ms: 30 })
            .await;
        assert!(matches!(outcome, DispatchOutcome::Response(_)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        // 不上线、不入账
        assert_eq!(h.storage.ledger.len(), 0);
    }

    #[tokio::test]
    async fn test_shell_signals_never_sent() {
        let h = harness(false).await;
        h.transport.open().await;
        settle().await;

        for request in [
            Request::RedirectHash {
                hash: "#/project/p1".to_string(),
            },
            Request::OpenHash {
                hash: "#/print".to_string(),
            },
            Request::Finished,
        ] {
            let outcome = h.dispatcher.dispatch(request).await;
            assert!(matches!(outcome, DispatchOutcome::Response(_)));
        }
        assert!(h.transport.sent_frames().await.is_empty());
        assert_eq!(h.storage.ledger.len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_correlation_dropped_silently() {
        let h = harness(false).await;
        h.dispatcher
            .handle_server_message(ServerMessage::Response {
                id: "p00000000000000000000000000000000".to_string(),
                response: json!({"status": "OK"}),
            })
            .await;
        h.dispatcher
            .handle_server_message(ServerMessage::Error {
                id: Some("p11111111111111111111111111111111".to_string()),
                status: "NOT_FOUND".to_string(),
                substatus: None,
            })
            .await;
        // 不崩溃、不产生账本条目即为通过
        assert_eq!(h.storage.ledger.len(), 0);
    }
}

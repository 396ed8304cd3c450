//! 协议模块 - 客户端与服务端之间的 JSON 线协议
//!
//! 包括：
//! - 请求类型（数据操作 / 会话操作 / 浏览器壳信号）
//! - 服务端下行消息（RESPONSE / ERROR / UPDATE_USER）
//! - 关联 ID（Correlation ID）：显式标签类型，取代字符串前缀约定
//! - 查询过滤器 AST（离线查询引擎与服务端共用同一形状）

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 全量同步请求使用的保留关联 ID
pub const SYNC_ID: &str = "cache";

/// 重放请求的关联 ID 前缀
pub const REPLAY_PREFIX: &str = "pending@";

/// 待发账本条目的键：`表名@记录ID`
///
/// PRINT 类请求没有目标记录，用 `PRINT@{uuid}` 占位。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingKey {
    pub table: String,
    pub record: String,
}

impl PendingKey {
    pub fn new(table: impl Into<String>, record: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            record: record.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}@{}", self.table, self.record)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (table, record) = raw.split_once('@')?;
        Some(Self::new(table, record))
    }
}

impl std::fmt::Display for PendingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.table, self.record)
    }
}

/// 关联 ID
///
/// 一个未完成请求的唯一标识。显式区分三种身份，
/// 避免在响应路由处靠字符串前缀判断：
/// - `Fresh`：调用方发起的普通请求
/// - `Sync`：全量同步（同一时刻至多一个在途）
/// - `Replay`：断线重连后重放的账本条目，kind 为原请求类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationId {
    Fresh(String),
    Sync,
    Replay { key: PendingKey, kind: String },
}

impl CorrelationId {
    /// 生成一个新的普通请求 ID
    pub fn fresh() -> Self {
        CorrelationId::Fresh(format!("p{}", uuid::Uuid::new_v4().simple()))
    }

    /// 编码为线上的字符串形式
    pub fn encode(&self) -> String {
        match self {
            CorrelationId::Fresh(id) => id.clone(),
            CorrelationId::Sync => SYNC_ID.to_string(),
            CorrelationId::Replay { key, kind } => {
                format!("{}{}@{}@{}", REPLAY_PREFIX, key.table, key.record, kind)
            }
        }
    }

    /// 从线上的字符串形式解析
    ///
    /// 无法解析的重放 ID 按 `Fresh` 处理，由路由层静默丢弃。
    pub fn parse(raw: &str) -> Self {
        if raw == SYNC_ID {
            return CorrelationId::Sync;
        }
        if let Some(rest) = raw.strip_prefix(REPLAY_PREFIX) {
            let parts: Vec<&str> = rest.splitn(3, '@').collect();
            if parts.len() == 3 {
                return CorrelationId::Replay {
                    key: PendingKey::new(parts[0], parts[1]),
                    kind: parts[2].to_string(),
                };
            }
        }
        CorrelationId::Fresh(raw.to_string())
    }
}

/// 过滤条件（单列）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_equal: Option<Value>,
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub in_: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intersects: Option<Vec<Value>>,
}

/// 查询过滤器 AST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterDetail {
    Or { or: Vec<FilterDetail> },
    And { and: Vec<FilterDetail> },
    Not { not: Box<FilterDetail> },
    Column { column: String, filter: FilterSpec },
}

/// 抽象请求
///
/// UI 层（不在本 crate 范围内）构造这些请求并交给调度器；
/// 每个变体对应线协议里的一个 `type` 判别值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Records { table_name: String },
    #[serde(rename_all = "camelCase")]
    Record {
        table_name: String,
        record_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Query {
        table_name: String,
        columns: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sorts: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<Vec<FilterDetail>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Store {
        table_name: String,
        form: String,
        record: Value,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        table_name: String,
        form: String,
        record_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FetchHistory {
        table_name: String,
        record_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Revert {
        table_name: String,
        record_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Patch {
        table_name: String,
        form: String,
        id: String,
        #[serde(rename = "override", default)]
        overwrite: bool,
        patches: Vec<Value>,
        patch_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    LocalPatch {
        table_name: String,
        form: String,
        id: String,
        patches: Vec<Value>,
        patch_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    LocalStore {
        table_name: String,
        form: String,
        record: Value,
    },
    #[serde(rename_all = "camelCase")]
    Edit {
        table_name: String,
        record_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Print {
        template: String,
        parameters: Vec<String>,
        send_emails: bool,
    },
    #[serde(rename_all = "camelCase")]
    RedirectHash { hash: String },
    #[serde(rename_all = "camelCase")]
    OpenHash { hash: String },
    Finished,
    #[serde(rename_all = "camelCase")]
    Timeout { delay_ms: u64 },
    Offline,
    #[serde(rename_all = "camelCase")]
    SetUser { token: Option<String> },
    Logout,
}

impl Request {
    /// 请求类型判别值（与线协议一致）
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Records { .. } => "RECORDS",
            Request::Record { .. } => "RECORD",
            Request::Query { .. } => "QUERY",
            Request::Store { .. } => "STORE",
            Request::Delete { .. } => "DELETE",
            Request::FetchHistory { .. } => "FETCH_HISTORY",
            Request::Revert { .. } => "REVERT",
            Request::Patch { .. } => "PATCH",
            Request::LocalPatch { .. } => "LOCAL_PATCH",
            Request::LocalStore { .. } => "LOCAL_STORE",
            Request::Edit { .. } => "EDIT",
            Request::Print { .. } => "PRINT",
            Request::RedirectHash { .. } => "REDIRECT_HASH",
            Request::OpenHash { .. } => "OPEN_HASH",
            Request::Finished => "FINISHED",
            Request::Timeout { .. } => "TIMEOUT",
            Request::Offline => "OFFLINE",
            Request::SetUser { .. } => "SET_USER",
            Request::Logout => "LOGOUT",
        }
    }

    /// 是否是写操作（成功后需要广播缓存失效）
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::Store { .. }
                | Request::LocalStore { .. }
                | Request::Delete { .. }
                | Request::Patch { .. }
                | Request::LocalPatch { .. }
        )
    }

    /// 写操作对应的账本键
    ///
    /// STORE 取记录体内的 `id` 字段，与原始请求保持同形。
    pub fn pending_key(&self) -> Option<PendingKey> {
        match self {
            Request::Store { table_name, record, .. }
            | Request::LocalStore { table_name, record, .. } => {
                let id = record.get("id").and_then(Value::as_str)?;
                Some(PendingKey::new(table_name.clone(), id))
            }
            Request::Delete {
                table_name,
                record_id,
                ..
            }
            | Request::Record {
                table_name,
                record_id,
            } => Some(PendingKey::new(table_name.clone(), record_id.clone())),
            Request::Patch { table_name, id, .. }
            | Request::LocalPatch { table_name, id, .. } => {
                Some(PendingKey::new(table_name.clone(), id.clone()))
            }
            _ => None,
        }
    }

    /// 写操作影响的 {表, 记录ID}（用于缓存失效广播）
    pub fn invalidation_target(&self) -> Option<(String, String)> {
        match self {
            Request::Store { table_name, record, .. }
            | Request::LocalStore { table_name, record, .. } => {
                let id = record.get("id").and_then(Value::as_str)?;
                Some((table_name.clone(), id.to_string()))
            }
            Request::Delete {
                table_name,
                record_id,
                ..
            } => Some((table_name.clone(), record_id.clone())),
            Request::Patch { table_name, id, .. }
            | Request::LocalPatch { table_name, id, .. } => {
                Some((table_name.clone(), id.clone()))
            }
            _ => None,
        }
    }
}

/// 客户端上行消息
///
/// 数据操作带信封 `{id, request}`；SET_USER / LOGOUT 裸发。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Envelope { id: String, request: Request },
    Bare(Request),
}

impl ClientMessage {
    pub fn envelope(id: &CorrelationId, request: Request) -> Self {
        ClientMessage::Envelope {
            id: id.encode(),
            request,
        }
    }

    pub fn to_frame(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 服务端下行消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Response {
        id: String,
        response: Value,
    },
    /// 无 `id` 的 ERROR 是会话级错误（如认证失败），不路由给任何调用方
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        substatus: Option<String>,
    },
    UpdateUser {
        user: Option<Value>,
    },
}

/// 认证失败的 status 判别值（唯一会清除会话令牌的错误）
pub const AUTHENTICATION_FAILED: &str = "AUTHENTICATION_FAILED";

/// 离线本地处理失败时合成 ERROR 的 status 判别值
pub const LOCAL_ERROR: &str = "Local Error";

//! 离线本地应答
//!
//! 连接不可用（或显式离线模式）时，请求不进网络，由这里直接
//! 基于缓存快照合成响应：
//! - 读操作（QUERY / RECORD / RECORDS）从快照回答，形状与服务端一致
//! - 写操作（STORE / DELETE / PATCH）乐观更新缓存并入待发账本
//! - PRINT 入账占位（重连后真正生成），立即返回 `offline: true`
//! - 历史 / 回滚 / 编辑锁离线不可用，报本地错误
//!
//! LOCAL_STORE / LOCAL_PATCH 即使在线也走这条路径；入账时转成
//! 对应的网络形式（STORE / PATCH），重连后按网络请求重放。

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DropsheetSDKError, Result};
use crate::protocol::{PendingKey, Request};
use crate::store::patch::apply_patch;
use crate::store::StorageManager;

/// PRINT 占位条目的表名段
pub const PRINT_TABLE: &str = "PRINT";

/// 离线本地应答器
#[derive(Debug, Clone)]
pub struct LocalResponder {
    storage: StorageManager,
}

impl LocalResponder {
    pub fn new(storage: StorageManager) -> Self {
        Self { storage }
    }

    /// 本地处理一个请求，返回合成的响应体
    ///
    /// 失败（补丁冲突、离线不可用的操作）返回错误，
    /// 由调度器包装成 `Local Error` 形状的 ERROR 交给调用方。
    pub fn respond(&self, request: &Request) -> Result<Value> {
        debug!(kind = request.kind(), "离线本地应答");
        match request {
            Request::Query {
                table_name,
                columns,
                sorts,
                filters,
                limit,
            } => {
                let (rows, full_count) = self.storage.cache.query(
                    table_name,
                    columns,
                    sorts.as_deref(),
                    filters.as_deref(),
                    *limit,
                )?;
                Ok(json!({"status": "OK", "rows": rows, "full_count": full_count}))
            }
            Request::Record {
                table_name,
                record_id,
            } => {
                let record = self.storage.cache.get_record(table_name, record_id)?;
                Ok(json!({"status": "OK", "record": record}))
            }
            Request::Records { table_name } => {
                let records = self.storage.cache.all_records(table_name)?;
                Ok(json!({"status": "OK", "records": records}))
            }
            Request::Store {
                table_name,
                form,
                record,
            }
            | Request::LocalStore {
                table_name,
                form,
                record,
            } => self.record_store(table_name, form, record),
            Request::Delete {
                table_name,
                form,
                record_id,
            } => {
                self.storage.cache.delete_record(table_name, record_id)?;
                self.storage.ledger.append(
                    &PendingKey::new(table_name.clone(), record_id.clone()),
                    Request::Delete {
                        table_name: table_name.clone(),
                        form: form.clone(),
                        record_id: record_id.clone(),
                    },
                )?;
                Ok(json!({"status": "OK", "recordId": record_id}))
            }
            Request::Patch {
                table_name,
                form,
                id,
                overwrite,
                patches,
                patch_ids,
            } => self.record_patch(table_name, form, id, *overwrite, patches, patch_ids),
            Request::LocalPatch {
                table_name,
                form,
                id,
                patches,
                patch_ids,
            } => self.record_patch(table_name, form, id, false, patches, patch_ids),
            Request::Print {
                template,
                parameters,
                send_emails,
            } => {
                // 占位入账，重连后由服务端真正生成
                let key = PendingKey::new(PRINT_TABLE, Uuid::new_v4().simple().to_string());
                self.storage.ledger.append(
                    &key,
                    Request::Print {
                        template: template.clone(),
                        parameters: parameters.clone(),
                        send_emails: *send_emails,
                    },
                )?;
                Ok(json!({"status": "OK", "offline": true}))
            }
            Request::RedirectHash { .. } | Request::OpenHash { .. } | Request::Finished => {
                Ok(json!({"status": "OK"}))
            }
            Request::FetchHistory { .. } | Request::Revert { .. } | Request::Edit { .. } => {
                Err(DropsheetSDKError::InvalidOperation(format!(
                    "{} 离线不可用",
                    request.kind()
                )))
            }
            other => Err(DropsheetSDKError::InvalidOperation(format!(
                "{} 不支持本地应答",
                other.kind()
            ))),
        }
    }

    /// STORE：乐观写缓存 + 入账（网络形式）
    fn record_store(&self, table_name: &str, form: &str, record: &Value) -> Result<Value> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DropsheetSDKError::InvalidArgument("记录缺少 id 字段".to_string()))?;
        self.storage.cache.put_record(table_name, id, record)?;
        self.storage.ledger.append(
            &PendingKey::new(table_name.to_string(), id),
            Request::Store {
                table_name: table_name.to_string(),
                form: form.to_string(),
                record: record.clone(),
            },
        )?;
        Ok(json!({"status": "OK", "record": record}))
    }

    /// PATCH：与同键待发补丁合并，应用到缓存，入账合并后的网络形式
    ///
    /// 已入账的补丁此前已应用到缓存，这里只应用新到的部分。
    fn record_patch(
        &self,
        table_name: &str,
        form: &str,
        id: &str,
        overwrite: bool,
        patches: &[Value],
        patch_ids: &[String],
    ) -> Result<Value> {
        let key = PendingKey::new(table_name.to_string(), id);

        let mut merged_patches: Vec<Value> = Vec::new();
        let mut merged_ids: Vec<String> = Vec::new();
        if let Some(existing) = self.storage.ledger.get(&key)? {
            if let Request::Patch {
                patches: prior,
                patch_ids: prior_ids,
                ..
            } = existing.request
            {
                merged_patches = prior;
                merged_ids = prior_ids;
            }
        }
        let mut fresh: Vec<&Value> = Vec::new();
        for (patch, patch_id) in patches.iter().zip(patch_ids.iter()) {
            if merged_ids.iter().any(|existing| existing == patch_id) {
                continue;
            }
            merged_patches.push(patch.clone());
            merged_ids.push(patch_id.clone());
            fresh.push(patch);
        }

        // 缓存里没有的记录从 `{id}` 起步修复
        let mut current = Some(
            self.storage
                .cache
                .get_record(table_name, id)?
                .unwrap_or_else(|| json!({"id": id})),
        );
        for patch in fresh {
            current = apply_patch(current.as_ref(), patch, overwrite)?;
        }
        match &current {
            Some(record) => self.storage.cache.put_record(table_name, id, record)?,
            None => self.storage.cache.delete_record(table_name, id)?,
        }

        self.storage.ledger.append(
            &key,
            Request::Patch {
                table_name: table_name.to_string(),
                form: form.to_string(),
                id: id.to_string(),
                overwrite,
                patches: merged_patches,
                patch_ids: merged_ids,
            },
        )?;
        Ok(json!({"status": "OK", "record": current}))
    }
}

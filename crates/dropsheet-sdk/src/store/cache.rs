//! 本地缓存快照
//!
//! 服务端全量同步的点时快照，按表存放；离线读全部由这里回答。
//!
//! 两条写入纪律：
//! - 全量同步整表替换，从不做部分合并（快照不允许出现混代数据）
//! - 在线响应只做"存在才刷新"（peek）：重放确认永远不会复活本地已删除的记录
//!
//! 查询引擎支持 QUERY 请求的过滤器 AST、点路径列、排序与 limit，
//! 形状与服务端查询一致，离线与在线的调用方代码完全相同。

use regex::RegexBuilder;
use serde_json::{Map, Value};
use sled::{Db, Tree};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{DropsheetSDKError, Result};
use crate::protocol::{FilterDetail, FilterSpec, Request};

/// 表树名前缀（meta / pending 之外的树都是缓存表）
const TABLE_PREFIX: &str = "table_";

/// 缓存快照存储
#[derive(Debug, Clone)]
pub struct CacheStore {
    db: Arc<Db>,
}

impl CacheStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    fn tree(&self, table: &str) -> Result<Tree> {
        self.db
            .open_tree(format!("{}{}", TABLE_PREFIX, table))
            .map_err(|e| DropsheetSDKError::KvStore(format!("打开表树失败: {}", e)))
    }

    /// 该表是否出现在当前快照里
    pub fn has_table(&self, table: &str) -> bool {
        let name = format!("{}{}", TABLE_PREFIX, table);
        self.db
            .tree_names()
            .iter()
            .any(|n| n.as_ref() == name.as_bytes())
    }

    pub fn get_record(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let tree = self.tree(table)?;
        match tree.get(id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                DropsheetSDKError::Serialization(format!("反序列化缓存记录失败: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    pub fn put_record(&self, table: &str, id: &str, record: &Value) -> Result<()> {
        let tree = self.tree(table)?;
        let bytes = serde_json::to_vec(record)
            .map_err(|e| DropsheetSDKError::Serialization(format!("序列化缓存记录失败: {}", e)))?;
        tree.insert(id, bytes)?;
        Ok(())
    }

    pub fn delete_record(&self, table: &str, id: &str) -> Result<()> {
        let tree = self.tree(table)?;
        tree.remove(id)?;
        Ok(())
    }

    /// 按键序取出整表记录
    pub fn all_records(&self, table: &str) -> Result<Vec<Value>> {
        let tree = self.tree(table)?;
        let mut records = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item?;
            records.push(serde_json::from_slice(&bytes).map_err(|e| {
                DropsheetSDKError::Serialization(format!("反序列化缓存记录失败: {}", e))
            })?);
        }
        Ok(records)
    }

    /// 全量同步：整表替换
    ///
    /// `records` 是服务端 OFFLINE 响应里的 `records` 字段（表名 → 记录数组）。
    /// 返回写入的记录总数。
    pub fn apply_snapshot(&self, records: &Map<String, Value>) -> Result<u64> {
        let mut total = 0u64;
        for (table, table_records) in records {
            let rows = table_records.as_array().ok_or_else(|| {
                DropsheetSDKError::InvalidData(format!("表 {} 的快照不是数组", table))
            })?;
            let tree = self.tree(table)?;
            tree.clear()?;
            let mut batch = sled::Batch::default();
            for record in rows {
                let id = record
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        DropsheetSDKError::InvalidData(format!("表 {} 存在缺少 id 的记录", table))
                    })?;
                let bytes = serde_json::to_vec(record).map_err(|e| {
                    DropsheetSDKError::Serialization(format!("序列化快照记录失败: {}", e))
                })?;
                batch.insert(id, bytes);
                total += 1;
            }
            tree.apply_batch(batch)?;
        }
        Ok(total)
    }

    /// 在线响应顺带刷新缓存（只在记录已缓存时更新）
    pub fn peek_refresh(&self, request: &Request, response: &Value) -> Result<()> {
        match request {
            Request::Patch { table_name, id, .. } => {
                if self.has_table(table_name) && self.get_record(table_name, id)?.is_some() {
                    if let Some(record) = non_null(response.get("record")) {
                        self.put_record(table_name, id, record)?;
                    }
                }
            }
            Request::Store { table_name, record, .. } => {
                if let Some(id) = record.get("id").and_then(Value::as_str) {
                    if self.has_table(table_name) && self.get_record(table_name, id)?.is_some() {
                        if let Some(fresh) = non_null(response.get("record")) {
                            self.put_record(table_name, id, fresh)?;
                        }
                    }
                }
            }
            Request::Record {
                table_name,
                record_id,
            } => {
                if self.has_table(table_name)
                    && self.get_record(table_name, record_id)?.is_some()
                {
                    if let Some(record) = non_null(response.get("record")) {
                        self.put_record(table_name, record_id, record)?;
                    }
                }
            }
            Request::Records { table_name } => {
                if self.has_table(table_name) {
                    if let Some(records) = response.get("records").and_then(Value::as_array) {
                        for record in records {
                            if let Some(id) = record.get("id").and_then(Value::as_str) {
                                if self.get_record(table_name, id)?.is_some() {
                                    self.put_record(table_name, id, record)?;
                                }
                            }
                        }
                    }
                }
            }
            Request::Query {
                table_name,
                columns,
                ..
            } => {
                if let Some(record_index) = columns.iter().position(|c| c == ".") {
                    if self.has_table(table_name) {
                        if let Some(rows) = response.get("rows").and_then(Value::as_array) {
                            for row in rows {
                                if let Some(record) = row.get(record_index) {
                                    if let Some(id) = record.get("id").and_then(Value::as_str) {
                                        if self.get_record(table_name, id)?.is_some() {
                                            self.put_record(table_name, id, record)?;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Request::Delete {
                table_name,
                record_id,
                ..
            } => {
                if self.has_table(table_name) {
                    self.delete_record(table_name, record_id)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// 离线查询：过滤、投影、排序、limit
    ///
    /// 返回 (rows, full_count)；full_count 是 limit 之前的命中数。
    pub fn query(
        &self,
        table: &str,
        columns: &[String],
        sorts: Option<&[String]>,
        filters: Option<&[FilterDetail]>,
        limit: Option<usize>,
    ) -> Result<(Vec<Vec<Value>>, usize)> {
        if !self.has_table(table) {
            return Ok((Vec::new(), 0));
        }

        let mut rows: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
        for record in self.all_records(table)? {
            if let Some(filters) = filters {
                let mut accept = true;
                for filter in filters {
                    if !check_filter(filter, &record)? {
                        accept = false;
                        break;
                    }
                }
                if !accept {
                    continue;
                }
            }

            let mut row = Vec::with_capacity(columns.len());
            for column in columns {
                match column.as_str() {
                    "." => row.push(record.clone()),
                    "null" => row.push(Value::Null),
                    _ => row.push(resolve_column(&record, column)),
                }
            }

            let mut sort_columns = Vec::new();
            if let Some(sorts) = sorts {
                for sort in sorts {
                    let name = sort.strip_prefix('-').unwrap_or(sort);
                    sort_columns.push(resolve_column(&record, name));
                }
            }

            rows.push((row, sort_columns));
        }

        if let Some(sorts) = sorts {
            rows.sort_by(|a, b| {
                for (index, sort) in sorts.iter().enumerate() {
                    let x = a.1.get(index).unwrap_or(&Value::Null);
                    let y = b.1.get(index).unwrap_or(&Value::Null);
                    let ordering = compare_values(x, y);
                    if ordering != Ordering::Equal {
                        return if sort.starts_with('-') {
                            ordering.reverse()
                        } else {
                            ordering
                        };
                    }
                }
                Ordering::Equal
            });
        }

        let full_count = rows.len();
        let mut rows: Vec<Vec<Value>> = rows.into_iter().map(|(row, _)| row).collect();
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok((rows, full_count))
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// 解析点路径列（`a.b.c`；`@` 后的函数键离线不可用，忽略）
fn resolve_column(record: &Value, column: &str) -> Value {
    let path = column.split('@').next().unwrap_or(column);
    let mut current = record.clone();
    for field in path.split('.') {
        if field.is_empty() {
            return current;
        }
        current = match current {
            Value::Object(ref map) => map.get(field).cloned().unwrap_or(Value::Null),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| resolve_column(&item, field))
                    .collect(),
            ),
            _ => Value::Null,
        };
        if current.is_null() {
            return Value::Null;
        }
    }
    current
}

/// 宽松等值：服务端把金额/数量序列化成字符串，离线侧按数值比较
fn value_is_equal(lhs: &Value, rhs: &Value) -> bool {
    if lhs == rhs {
        return true;
    }
    match (as_number(lhs), as_number(rhs)) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// `%` 通配模式转正则（大小写不敏感，`\%` 转义为字面 %）
fn pattern_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut source = String::with_capacity(pattern.len() + 2);
    source.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('%') => source.push_str("%"),
                Some('\\') => source.push_str("\\\\"),
                Some(other) => source.push_str(&regex::escape(&other.to_string())),
                None => source.push_str("\\\\"),
            },
            '%' => source.push_str(".*"),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| DropsheetSDKError::InvalidArgument(format!("非法 like 模式: {}", e)))
}

/// 过滤器求值
pub fn check_filter(filter: &FilterDetail, record: &Value) -> Result<bool> {
    match filter {
        FilterDetail::Or { or } => {
            for sub in or {
                if check_filter(sub, record)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterDetail::And { and } => {
            for sub in and {
                if !check_filter(sub, record)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FilterDetail::Not { not } => Ok(!check_filter(not, record)?),
        FilterDetail::Column { column, filter } => check_column_filter(column, filter, record),
    }
}

fn check_column_filter(column: &str, spec: &FilterSpec, record: &Value) -> Result<bool> {
    let value = resolve_column(record, column);

    if let Some(like) = &spec.like {
        let text = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !pattern_to_regex(like)?.is_match(&text) {
            return Ok(false);
        }
    }
    if let Some(equal) = &spec.equal {
        if !value_is_equal(&value, equal) {
            return Ok(false);
        }
    }
    if let Some(not_equal) = &spec.not_equal {
        if value_is_equal(&value, not_equal) {
            return Ok(false);
        }
    }
    if let Some(candidates) = &spec.in_ {
        if !candidates.iter().any(|c| value_is_equal(c, &value)) {
            return Ok(false);
        }
    }
    if let Some(intersects) = &spec.intersects {
        let items = value.as_array().cloned().unwrap_or_default();
        if !items
            .iter()
            .any(|item| intersects.iter().any(|c| value_is_equal(c, item)))
        {
            return Ok(false);
        }
    }
    Ok(true)
}

/// JSON 值排序：null < bool < number < string（字符串大小写不敏感）
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

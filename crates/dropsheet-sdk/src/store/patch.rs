//! 增量补丁应用（jsondiffpatch delta 格式）
//!
//! 表单编辑产生的补丁形状：
//! - 新增：`[newValue]`
//! - 修改：`[oldValue, newValue]`
//! - 删除：`[oldValue, 0, 0]`
//! - 对象：逐键递归
//! - 数组：`{"_t": "a", "<i>": 插入, "_<i>": 删除/移动(魔数 3), "append": 追加}`
//!
//! `overwrite = false` 时校验旧值一致，不一致报 `InvalidData`；
//! `overwrite = true` 跳过校验（REVERT / 覆盖存储路径使用）。

use serde_json::{Map, Value};

use crate::error::{DropsheetSDKError, Result};

/// 应用一个补丁；返回 None 表示该值被删除
pub fn apply_patch(current: Option<&Value>, patch: &Value, overwrite: bool) -> Result<Option<Value>> {
    match patch {
        Value::Null => Ok(current.cloned()),
        Value::Array(parts) => apply_leaf(current, parts, overwrite),
        Value::Object(map) if map.get("_t").and_then(Value::as_str) == Some("a") => {
            apply_array_delta(current, map, overwrite)
        }
        Value::Object(map) => {
            let mut result = match current {
                Some(Value::Object(obj)) => obj.clone(),
                _ => Map::new(),
            };
            for (key, sub_patch) in map {
                match apply_patch(result.get(key), sub_patch, overwrite)? {
                    Some(value) => {
                        result.insert(key.clone(), value);
                    }
                    None => {
                        result.remove(key);
                    }
                }
            }
            Ok(Some(Value::Object(result)))
        }
        other => Err(DropsheetSDKError::InvalidData(format!(
            "无法识别的补丁形状: {}",
            other
        ))),
    }
}

fn mismatch(patch: &[Value], current: Option<&Value>) -> DropsheetSDKError {
    DropsheetSDKError::InvalidData(format!(
        "补丁与当前值不一致: {} but {}",
        serde_json::to_string(patch).unwrap_or_default(),
        current
            .map(|v| v.to_string())
            .unwrap_or_else(|| "undefined".to_string()),
    ))
}

fn apply_leaf(current: Option<&Value>, parts: &[Value], overwrite: bool) -> Result<Option<Value>> {
    match parts.len() {
        1 => {
            if !overwrite && current.is_some() {
                return Err(mismatch(parts, current));
            }
            Ok(Some(parts[0].clone()))
        }
        2 => {
            if !overwrite && current != Some(&parts[0]) {
                return Err(mismatch(parts, current));
            }
            Ok(Some(parts[1].clone()))
        }
        3 => match parts[2].as_i64() {
            Some(0) => {
                if !overwrite && current != Some(&parts[0]) {
                    return Err(mismatch(parts, current));
                }
                Ok(None)
            }
            // 魔数 2 是 jsondiffpatch 的文本 diff，离线路径不支持
            _ => Err(DropsheetSDKError::InvalidData(
                "不支持的补丁魔数".to_string(),
            )),
        },
        _ => Err(DropsheetSDKError::InvalidData("非法补丁数组".to_string())),
    }
}

fn apply_array_delta(
    current: Option<&Value>,
    delta: &Map<String, Value>,
    overwrite: bool,
) -> Result<Option<Value>> {
    if current.is_none() && !overwrite {
        return Err(DropsheetSDKError::InvalidData(
            "数组补丁作用于 undefined".to_string(),
        ));
    }
    let mut result: Vec<Value> = match current {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };

    let mut to_remove: Vec<(usize, &Value)> = Vec::new();
    let mut to_insert: Vec<(usize, Value)> = Vec::new();
    let mut to_modify: Vec<(usize, &Value)> = Vec::new();

    for (key, value) in delta {
        if key == "_t" || key == "append" {
            continue;
        }
        if let Some(index_str) = key.strip_prefix('_') {
            let index: usize = index_str.parse().map_err(|_| {
                DropsheetSDKError::InvalidData(format!("非法数组补丁键: {}", key))
            })?;
            let magic = value.get(2).and_then(Value::as_i64);
            if magic == Some(0) || magic == Some(3) {
                to_remove.push((index, value));
            } else {
                return Err(DropsheetSDKError::InvalidData("非法数组补丁".to_string()));
            }
        } else {
            let index: usize = key.parse().map_err(|_| {
                DropsheetSDKError::InvalidData(format!("非法数组补丁键: {}", key))
            })?;
            let parts = value.as_array().ok_or_else(|| {
                DropsheetSDKError::InvalidData("非法数组补丁项".to_string())
            })?;
            if parts.len() == 1 {
                to_insert.push((index, parts[0].clone()));
            } else {
                to_modify.push((index, value));
            }
        }
    }

    // 先从后往前删除（魔数 3 的条目是移动：删除后改插到目标下标）
    to_remove.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    for (index, patch_value) in to_remove {
        if index >= result.len() {
            return Err(DropsheetSDKError::InvalidData(format!(
                "数组补丁下标越界: {}",
                index
            )));
        }
        let removed = result.remove(index);
        if patch_value.get(2).and_then(Value::as_i64) == Some(3) {
            let dest = patch_value
                .get(1)
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            to_insert.push((dest, removed));
        } else if !overwrite && patch_value.get(0) != Some(&removed) {
            return Err(DropsheetSDKError::InvalidData(format!(
                "数组补丁与当前值不一致: {}",
                patch_value
            )));
        }
    }

    to_insert.sort_by_key(|(index, _)| *index);
    for (index, value) in to_insert {
        let index = index.min(result.len());
        result.insert(index, value);
    }

    for (index, sub_delta) in to_modify {
        let current_item = result.get(index).cloned();
        let patched = apply_patch(current_item.as_ref(), sub_delta, overwrite)?;
        if index < result.len() {
            result[index] = patched.unwrap_or(Value::Null);
        }
    }

    if let Some(appended) = delta.get("append") {
        result.push(appended.clone());
    }

    Ok(Some(Value::Array(result)))
}

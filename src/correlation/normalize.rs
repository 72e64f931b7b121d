//! 入站工具结果：字段校验与输出归一化

use serde_json::Value;

use crate::core::BridgeError;

/// 截断标记，追加在被截断输出的末尾
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// 经过校验的入站工具结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub output: Value,
    pub thread_id: String,
    pub run_id: String,
}

impl ToolResult {
    /// 校验原始载荷；收集全部缺失 / 类型错误的字段
    pub fn from_value(raw: &Value) -> Result<Self, BridgeError> {
        let Some(obj) = raw.as_object() else {
            return Err(BridgeError::Validation(vec![
                "payload must be a JSON object".to_string(),
            ]));
        };

        let mut errors = Vec::new();
        let id = required_string(obj, "id", &mut errors);
        let thread_id = required_string(obj, "threadId", &mut errors);
        let run_id = required_string(obj, "runId", &mut errors);
        let output = match obj.get("output") {
            None | Some(Value::Null) => {
                errors.push("output is required".to_string());
                None
            }
            Some(v) => Some(v.clone()),
        };

        match (id, output, thread_id, run_id) {
            (Some(id), Some(output), Some(thread_id), Some(run_id)) if errors.is_empty() => Ok(Self {
                id,
                output,
                thread_id,
                run_id,
            }),
            _ => Err(BridgeError::Validation(errors)),
        }
    }
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            errors.push(format!("{} is required", field));
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            errors.push(format!("{} must not be empty", field));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            errors.push(format!("{} must be a string, got {}", field, type_name(other)));
            None
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 输出转为规范文本
///
/// 对象 / 数组 → 缩进 JSON；字符串 → 去首尾空白；其他标量 → 字符串化。
/// 结果为空报 Processing 错误；超过 `max_chars` 字符时截断到恰好 `max_chars` 并追加标记。
/// 对已归一化的结果再次归一化不会改变它。
pub fn normalize_output(output: &Value, max_chars: usize) -> Result<String, BridgeError> {
    let text = match output {
        Value::Null => {
            return Err(BridgeError::Processing("Tool output is null".to_string()));
        }
        Value::String(s) => s.trim().to_string(),
        Value::Object(_) | Value::Array(_) => serde_json::to_string_pretty(output)
            .map_err(|e| BridgeError::Processing(format!("Tool output could not be serialized: {}", e)))?,
        other => other.to_string(),
    };

    if text.is_empty() {
        return Err(BridgeError::Processing(
            "Tool output is empty after normalization".to_string(),
        ));
    }

    Ok(truncate(text, max_chars))
}

fn truncate(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str(TRUNCATION_MARKER);
    cut
}

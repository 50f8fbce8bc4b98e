use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const CODE_SUCCESS: i64 = 200;
pub const CODE_BAD_REQUEST: i64 = 400;
pub const CODE_NOT_FOUND: i64 = 404;

/// 业务层统一返回结构 `{code, message, data}`
///
/// 与 JSON-RPC 的成功/失败是两层含义：协议层成功的响应里，
/// `code != 200` 依然表示工具本身执行失败。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEnvelope {
    pub code: i64,
    pub message: String,
    pub data: Value,
}

impl ToolEnvelope {
    pub fn success(data: Value) -> Self {
        Self::with_message("success", data)
    }

    pub fn with_message(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: message.into(),
            data,
        }
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::error(CODE_NOT_FOUND, message)
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// 从任意 JSON 中识别出信封结构，要求同时具有整数 `code` 和 `data` 字段
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if !is_envelope(map) {
            return None;
        }
        Some(Self {
            code: map.get("code")?.as_i64()?,
            message: map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: map.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "data": self.data,
        })
    }

    /// 包装成富文本内容格式 `{"content": [{"type": "text", "text": "<json>"}]}`
    pub fn into_content(self) -> Value {
        json!({
            "content": [
                {
                    "type": "text",
                    "text": self.to_value().to_string(),
                }
            ]
        })
    }
}

/// 把工具返回值包装成成功信封并放入富文本内容里
pub fn wrap_tool_result(data: Value) -> Value {
    ToolEnvelope::success(data).into_content()
}

/// 归一化工具结果，去掉富文本外壳和多层嵌套的信封
///
/// 反复执行单步展开直到不动点，因此对结果再次调用得到相同的值。
pub fn normalize_tool_result(raw: &Value) -> Value {
    let mut value = raw.clone();
    while let Some(next) = unwrap_once(&value) {
        value = next;
    }
    value
}

/// 取出归一化后信封里的 `data` 对象，其它形态返回空对象
pub fn extract_result_data(raw: &Value) -> Map<String, Value> {
    match normalize_tool_result(raw) {
        Value::Object(map) if is_envelope(&map) => match map.get("data") {
            Some(Value::Object(data)) => data.clone(),
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

fn is_envelope(map: &Map<String, Value>) -> bool {
    map.contains_key("code") && map.contains_key("data")
}

fn unwrap_once(value: &Value) -> Option<Value> {
    match value {
        Value::Object(map) if is_envelope(map) => {
            let data = map.get("data")?;
            match normalize_tool_result(data) {
                Value::Object(inner) if is_envelope(&inner) => Some(Value::Object(inner)),
                _ => None,
            }
        }
        Value::Object(map) => match map.get("content") {
            Some(content @ Value::Array(_)) => Some(content.clone()),
            _ => None,
        },
        Value::Array(parts) => {
            let text = parts.first()?.get("text")?.as_str()?;
            serde_json::from_str(text).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_success_as_text_content() {
        let wrapped = wrap_tool_result(json!({"images": ["sky.png"]}));
        let text = wrapped["content"][0]["text"].as_str().unwrap();
        let decoded: Value = serde_json::from_str(text).unwrap();
        assert_eq!(
            decoded,
            json!({"code": 200, "message": "success", "data": {"images": ["sky.png"]}})
        );
        assert_eq!(wrapped["content"][0]["type"], "text");
    }

    #[test]
    fn unwraps_nested_envelopes_to_innermost() {
        let inner = json!({"code": 404, "message": "model_not_found", "data": null});
        let outer = ToolEnvelope::success(inner.clone()).to_value();
        assert_eq!(normalize_tool_result(&outer), inner);

        let triple = ToolEnvelope::success(outer.clone()).into_content();
        assert_eq!(normalize_tool_result(&triple), inner);
    }

    #[test]
    fn content_shape_matches_decoded_json() {
        let envelope = json!({"code": 200, "message": "success", "data": {"a": 1}});
        let content = ToolEnvelope::from_value(&envelope).unwrap().into_content();
        assert_eq!(
            normalize_tool_result(&content),
            normalize_tool_result(&envelope)
        );
        assert_eq!(
            normalize_tool_result(&content["content"]),
            normalize_tool_result(&envelope)
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = vec![
            json!({"code": 200, "message": "success", "data": {"x": [1, 2]}}),
            ToolEnvelope::success(json!({"code": 200, "message": "ok", "data": {"y": true}}))
                .into_content(),
            json!({"content": [{"type": "text", "text": "not json"}]}),
            json!({"code": 200, "message": "success", "data": {"code": 1, "data": "leaf"}}),
            json!([1, 2, 3]),
            json!("plain"),
        ];
        for sample in samples {
            let once = normalize_tool_result(&sample);
            assert_eq!(normalize_tool_result(&once), once, "sample: {sample}");
        }
    }

    #[test]
    fn undecodable_text_keeps_content_list() {
        let raw = json!({"content": [{"type": "text", "text": "hello"}]});
        assert_eq!(
            normalize_tool_result(&raw),
            json!([{"type": "text", "text": "hello"}])
        );
    }

    #[test]
    fn plain_data_with_content_key_is_not_decoded_inside_envelope() {
        let raw = json!({"code": 200, "message": "success", "data": {"content": "hello"}});
        assert_eq!(normalize_tool_result(&raw), raw);
    }

    #[test]
    fn extract_data_from_wrapped_result() {
        let wrapped = wrap_tool_result(json!({"task_id": "abc"}));
        let data = extract_result_data(&wrapped);
        assert_eq!(data.get("task_id"), Some(&json!("abc")));
        assert!(extract_result_data(&json!("nothing")).is_empty());
    }
}

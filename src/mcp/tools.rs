use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::handlers::ToolRegistry;

/// 插件对外暴露的工具描述（名称、说明、输入 schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
    /// manifest 中的其它字段原样保留
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            extra: Map::new(),
        }
    }

    /// 代码中注册但 manifest 未声明的工具使用的默认描述
    pub fn generated(name: &str) -> Self {
        Self::new(name, format!("Tool {name}"), empty_schema())
    }
}

/// 读取插件 manifest.json，文件缺失或格式错误时返回空对象
pub async fn load_manifest(path: &Path) -> Value {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!("未找到 manifest {}: {}", path.display(), e);
            return json!({});
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => {
            warn!("manifest {} 不是 JSON 对象，忽略", path.display());
            json!({})
        }
        Err(e) => {
            warn!("manifest {} 解析失败: {}", path.display(), e);
            json!({})
        }
    }
}

/// 取出 manifest 中 `capabilities.tools` 的工具定义，跳过无效条目
pub fn manifest_tools(manifest: &Value) -> Vec<ToolDefinition> {
    let Some(items) = manifest
        .pointer("/capabilities/tools")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<ToolDefinition>(item.clone()) {
            Ok(def) => Some(def),
            Err(e) => {
                warn!("跳过无效的工具定义: {}", e);
                None
            }
        })
        .collect()
}

/// `tools/list` 的内容：只列出有处理器的工具，处理器没有对应声明时补一份默认描述
pub fn resolve_definitions(declared: Vec<ToolDefinition>, registry: &ToolRegistry) -> Vec<ToolDefinition> {
    let mut defs: Vec<ToolDefinition> = declared
        .into_iter()
        .filter(|def| registry.contains(&def.name))
        .collect();

    for name in registry.names() {
        if !defs.iter().any(|def| def.name == name) {
            defs.push(ToolDefinition::generated(name));
        }
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handlers::ToolHandler;

    #[test]
    fn reads_tools_from_capabilities() {
        let manifest = json!({
            "id": "com.dawnchat.comfyui",
            "capabilities": {
                "tools": [
                    {"name": "text_to_image", "description": "generate", "inputSchema": {"type": "object"}, "timeout": 600},
                    {"description": "missing name"},
                    {"name": "upscale"}
                ]
            }
        });
        let tools = manifest_tools(&manifest);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].extra.get("timeout"), Some(&json!(600)));
        assert_eq!(tools[1].input_schema, empty_schema());
        assert!(manifest_tools(&json!({})).is_empty());
    }

    #[test]
    fn lists_only_registered_tools() {
        let mut registry = ToolRegistry::new();
        registry
            .register("text_to_image", ToolHandler::sync(|_, _| Ok(Value::Null)))
            .register("status", ToolHandler::sync(|_, _| Ok(Value::Null)));

        let declared = vec![
            ToolDefinition::new("text_to_image", "generate", empty_schema()),
            ToolDefinition::new("inpaint", "not implemented here", empty_schema()),
        ];
        let defs = resolve_definitions(declared, &registry);
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["text_to_image", "status"]);
        assert_eq!(defs[1].description, "Tool status");
    }
}

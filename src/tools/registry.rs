//! 工具注册表与工具后端接口
//!
//! 核心只要求后端能 invoke；列出可用工具是可选能力（ToolProvider），
//! 通过 available_tools() 安全访问：后端不提供时返回空列表，从不报错。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::schema::ToolSchema;

/// 工具 trait：名称、描述、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 一次工具调用：`{"tool": "...", "args": {...}}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

/// 可用工具描述
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 可选能力：列出工具、接收校验通过的动态工具
pub trait ToolProvider: Send + Sync {
    fn list_tools(&self) -> Vec<ToolDescriptor>;

    fn register_dynamic(&self, schema: ToolSchema) -> Result<(), String> {
        Err(format!("dynamic registration of `{}` not supported", schema.name))
    }
}

/// 工具后端：核心唯一必需的能力是调用
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn invoke(&self, name: &str, args: Value) -> Result<String, String>;

    fn provider(&self) -> Option<&dyn ToolProvider> {
        None
    }
}

/// 安全访问器：后端不具备 ToolProvider 能力时返回空
pub fn available_tools(backend: &dyn ToolBackend) -> Vec<ToolDescriptor> {
    backend
        .provider()
        .map(|p| p.list_tools())
        .unwrap_or_default()
}

/// 按名存储 Arc<dyn Tool>，另存校验通过的动态工具 Schema
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    dynamic: RwLock<HashMap<String, ToolSchema>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn dynamic_schema(&self, name: &str) -> Option<ToolSchema> {
        self.dynamic
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// 按名称排序的工具名（含动态工具）
    pub fn tool_names(&self) -> Vec<String> {
        self.list_tools().into_iter().map(|d| d.name).collect()
    }
}

impl ToolProvider for ToolRegistry {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        let dynamic = self.dynamic.read().unwrap_or_else(|e| e.into_inner());
        out.extend(dynamic.values().map(|schema| ToolDescriptor {
            name: schema.name.clone(),
            description: schema.description.clone(),
            parameters: schema.to_json_schema(),
        }));
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn register_dynamic(&self, schema: ToolSchema) -> Result<(), String> {
        if self.tools.contains_key(&schema.name) {
            return Err(format!("tool `{}` already registered", schema.name));
        }
        tracing::info!(tool = %schema.name, params = schema.parameters.len(), "dynamic tool registered");
        self.dynamic
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(schema.name.clone(), schema);
        Ok(())
    }
}

#[async_trait]
impl ToolBackend for ToolRegistry {
    async fn invoke(&self, name: &str, args: Value) -> Result<String, String> {
        match self.tools.get(name) {
            Some(tool) => tool.execute(args).await,
            None if self.dynamic_schema(name).is_some() => {
                Err(format!("Dynamic tool `{name}` has no handler"))
            }
            None => Err(format!("Unknown tool: {name}")),
        }
    }

    fn provider(&self) -> Option<&dyn ToolProvider> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::{ParamType, ToolParameter};
    use crate::tools::EchoTool;

    struct InvokeOnly;

    #[async_trait]
    impl ToolBackend for InvokeOnly {
        async fn invoke(&self, _name: &str, _args: Value) -> Result<String, String> {
            Ok("ok".into())
        }
    }

    fn schema(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.into(),
            description: "adds".into(),
            parameters: vec![ToolParameter {
                name: "a".into(),
                kind: ParamType::Integer,
                description: String::new(),
                required: true,
            }],
        }
    }

    #[test]
    fn test_missing_provider_lists_nothing() {
        assert!(available_tools(&InvokeOnly).is_empty());
    }

    #[test]
    fn test_registry_lists_static_and_dynamic() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register_dynamic(schema("add")).unwrap();
        assert_eq!(reg.tool_names(), vec!["add".to_string(), "echo".to_string()]);
        let listed = available_tools(&reg);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].parameters["required"][0], "a");
    }

    #[test]
    fn test_dynamic_name_collision_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        assert!(reg.register_dynamic(schema("echo")).is_err());
    }

    #[tokio::test]
    async fn test_invoke_unknown_and_dynamic() {
        let reg = ToolRegistry::new();
        reg.register_dynamic(schema("add")).unwrap();
        let err = reg.invoke("nope", Value::Null).await.unwrap_err();
        assert!(err.contains("Unknown tool"));
        let err = reg.invoke("add", Value::Null).await.unwrap_err();
        assert!(err.contains("no handler"));
    }
}

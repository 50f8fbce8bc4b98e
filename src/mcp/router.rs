use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::error::RouterError;
use super::handlers::{ToolHandler, ToolRegistry};
use super::hooks::{LifecycleHooks, TaskEvent, TaskHook};
use super::progress::TaskContext;
use super::protocol::{
    JSONRPC_VERSION, JsonRpcRequest, JsonRpcResponse, Method, TaskParams, ToolCallParams,
};
use super::task::{CancelOutcome, TaskEntry, TaskRegistry, TaskSnapshot, TaskStatus};
use super::tools::{ToolDefinition, resolve_definitions};
use crate::common::envelope::{ToolEnvelope, wrap_tool_result};

/// 插件的 JSON-RPC 工具路由
///
/// 负责方法分发、同步工具调用，以及异步任务的提交、查询和取消。
/// 克隆开销很小，所有克隆共享同一个任务注册表。
#[derive(Clone)]
pub struct McpRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    tools: ToolRegistry,
    definitions: Vec<ToolDefinition>,
    tasks: TaskRegistry,
    hooks: LifecycleHooks,
    enable_async_tasks: bool,
}

/// [`McpRouter`] 构建器
pub struct McpRouterBuilder {
    tools: ToolRegistry,
    declared: Vec<ToolDefinition>,
    hooks: LifecycleHooks,
    enable_async_tasks: bool,
    task_retention: Duration,
}

impl Default for McpRouterBuilder {
    fn default() -> Self {
        Self {
            tools: ToolRegistry::new(),
            declared: Vec::new(),
            hooks: LifecycleHooks::new(),
            enable_async_tasks: true,
            task_retention: Duration::from_secs(3600),
        }
    }
}

impl McpRouterBuilder {
    /// manifest 中声明的工具定义
    pub fn manifest_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.declared = tools;
        self
    }

    pub fn tool(mut self, name: impl Into<String>, handler: ToolHandler) -> Self {
        self.tools.register(name, handler);
        self
    }

    pub fn tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = (S, ToolHandler)>,
        S: Into<String>,
    {
        for (name, handler) in tools {
            self.tools.register(name, handler);
        }
        self
    }

    pub fn hook(mut self, hook: impl TaskHook + 'static) -> Self {
        self.hooks = self.hooks.with(hook);
        self
    }

    pub fn async_tasks(mut self, enabled: bool) -> Self {
        self.enable_async_tasks = enabled;
        self
    }

    pub fn task_retention(mut self, retention: Duration) -> Self {
        self.task_retention = retention;
        self
    }

    pub fn build(self) -> McpRouter {
        let definitions = resolve_definitions(self.declared, &self.tools);
        McpRouter {
            inner: Arc::new(RouterInner {
                tools: self.tools,
                definitions,
                tasks: TaskRegistry::new(self.task_retention),
                hooks: self.hooks,
                enable_async_tasks: self.enable_async_tasks,
            }),
        }
    }
}

impl McpRouter {
    pub fn builder() -> McpRouterBuilder {
        McpRouterBuilder::default()
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.inner.definitions
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.inner.tasks
    }

    /// 处理一条 JSON-RPC 请求，任何情况下都返回格式完整的响应
    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match self.dispatch(request).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                match &e {
                    RouterError::ToolFailed { .. } => error!("{}", e),
                    _ => debug!("协议错误: {}", e),
                }
                JsonRpcResponse::error(id, e.code(), e.to_string())
            }
        }
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> Result<Value, RouterError> {
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(RouterError::InvalidVersion);
        }

        let method = Method::parse(&request.method)
            .filter(|m| self.inner.enable_async_tasks || !m.is_task_method())
            .ok_or_else(|| RouterError::MethodNotFound(request.method.clone()))?;
        let params = request.params;

        match method {
            Method::Ping => Ok(json!({"status": "ok"})),
            Method::ToolsList => Ok(self.list_tools()),
            Method::ToolsCall => {
                let params: ToolCallParams = parse_params(params)?;
                let arguments = normalize_arguments(params.arguments)?;
                self.call_tool(&params.name, arguments).await
            }
            Method::ToolsSubmit => {
                let params: ToolCallParams = parse_params(params)?;
                let arguments = normalize_arguments(params.arguments)?;
                Ok(self.submit_tool(&params.name, arguments))
            }
            Method::TasksGet => {
                let params: TaskParams = parse_params(params)?;
                let snapshot = self.get_task(&params.task_id)?;
                Ok(serde_json::to_value(snapshot).unwrap_or(Value::Null))
            }
            Method::TasksCancel => {
                let params: TaskParams = parse_params(params)?;
                self.cancel_task(&params.task_id)
            }
        }
    }

    /// `tools/list`
    pub fn list_tools(&self) -> Value {
        let mut result = json!({"tools": self.inner.definitions});
        if self.inner.enable_async_tasks {
            result["capabilities"] = json!({
                "async": true,
                "task_methods": ["tools/submit", "tasks/get", "tasks/cancel"],
            });
        }
        result
    }

    /// `tools/call`：同步执行并等待结果
    ///
    /// 未注册的工具返回 `code = 404` 的业务结果而不是协议错误。
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RouterError> {
        let Some(handler) = self.inner.tools.get(name) else {
            warn!("调用了未注册的工具: {}", name);
            return Ok(ToolEnvelope::not_found(format!("Tool {name} not found")).into_content());
        };

        debug!("同步调用工具 {}", name);
        handler
            .invoke(arguments, TaskContext::detached())
            .await
            .map(wrap_tool_result)
            .map_err(|e| RouterError::ToolFailed {
                tool: name.to_string(),
                message: format!("{e:#}"),
            })
    }

    /// `tools/submit`：登记任务后立即返回，处理器在独立的执行单元中运行
    pub fn submit_tool(&self, name: &str, arguments: Value) -> Value {
        let Some(handler) = self.inner.tools.get(name).cloned() else {
            warn!("提交了未注册的工具: {}", name);
            return json!({
                "task_id": null,
                "status": "failed",
                "error": format!("Tool {name} not found"),
            });
        };

        let pruned = self.inner.tasks.prune_finished();
        if pruned > 0 {
            debug!("清理了 {} 个过期任务", pruned);
        }

        let entry = self.inner.tasks.create(name, arguments.clone());
        let task_id = entry.task_id();
        info!("接受任务 {} (工具: {})", task_id, name);

        let hooks = self.inner.hooks.clone();
        tokio::spawn(run_task(entry, handler, arguments, hooks));

        json!({"task_id": task_id, "status": "accepted"})
    }

    /// `tasks/get`
    pub fn get_task(&self, task_id: &str) -> Result<TaskSnapshot, RouterError> {
        self.inner
            .tasks
            .get(task_id)
            .ok_or_else(|| RouterError::TaskNotFound(task_id.to_string()))
    }

    /// `tasks/cancel`：尽力而为，只保证状态读回为 `cancelled` 且之后不再记录进度
    pub fn cancel_task(&self, task_id: &str) -> Result<Value, RouterError> {
        match self.inner.tasks.cancel(task_id) {
            Some(CancelOutcome::Cancelled) => {
                info!("任务 {} 已取消", task_id);
                Ok(json!({"task_id": task_id, "cancelled": true}))
            }
            Some(CancelOutcome::AlreadyFinished(status)) => Ok(json!({
                "task_id": task_id,
                "cancelled": false,
                "status": status,
            })),
            None => Err(RouterError::TaskNotFound(task_id.to_string())),
        }
    }
}

/// 调度后的任务执行体
async fn run_task(entry: TaskEntry, handler: ToolHandler, arguments: Value, hooks: LifecycleHooks) {
    let started = {
        let mut task = entry.lock();
        task.start().then(|| task.snapshot())
    };
    let Some(snapshot) = started else {
        debug!("任务 {} 在开始前已被取消", entry.task_id());
        return;
    };
    hooks.emit(TaskEvent::Started, &snapshot);

    let ctx = TaskContext::for_task(entry.clone(), hooks.clone());
    let cancel = entry.cancel_token().clone();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = handler.invoke(arguments, ctx) => Some(result),
    };

    let Some(result) = outcome else {
        debug!("任务 {} 的执行已被中断", snapshot.task_id);
        return;
    };

    let (event, finished) = {
        let mut task = entry.lock();
        let changed = match result {
            Ok(data) => task.complete(wrap_tool_result(data)),
            Err(e) => {
                warn!("任务 {} 执行失败: {:#}", task.task_id, e);
                task.fail(format!("{e:#}"))
            }
        };
        let event = match task.status {
            TaskStatus::Completed => TaskEvent::Completed,
            _ => TaskEvent::Failed,
        };
        (event, changed.then(|| task.snapshot()))
    };

    match finished {
        Some(snapshot) => {
            info!("任务 {} 结束: {}", snapshot.task_id, snapshot.status);
            hooks.emit(event, &snapshot);
        }
        None => debug!("任务 {} 已处于终态，丢弃处理结果", snapshot.task_id),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RouterError> {
    let params = match params {
        None | Some(Value::Null) => json!({}),
        Some(p @ Value::Object(_)) => p,
        Some(_) => return Err(RouterError::InvalidParams("params must be an object".into())),
    };
    serde_json::from_value(params).map_err(|e| RouterError::InvalidParams(e.to_string()))
}

fn normalize_arguments(arguments: Option<Value>) -> Result<Value, RouterError> {
    match arguments {
        None | Some(Value::Null) => Ok(json!({})),
        Some(a @ Value::Object(_)) => Ok(a),
        Some(_) => Err(RouterError::InvalidParams("arguments must be an object".into())),
    }
}

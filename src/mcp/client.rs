use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use super::error::ToolCallError;
use super::protocol::{JsonRpcRequest, JsonRpcResponse};
use super::task::{TaskSnapshot, TaskStatus};
use super::tools::ToolDefinition;
use crate::common::envelope::normalize_tool_result;

/// 同步调用的默认超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// 异步任务等待的默认超时
pub const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_secs(3600);
/// 轮询间隔下限
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 调用其它插件 `/mcp` 端点的客户端
#[derive(Debug, Clone)]
pub struct McpClient {
    http: reqwest::Client,
    endpoint: Url,
    next_id: Arc<AtomicU64>,
}

impl McpClient {
    /// `endpoint` 为完整的 JSON-RPC 地址，例如 `http://127.0.0.1:8080/mcp`
    pub fn new(endpoint: &str) -> Result<Self, ToolCallError> {
        Ok(Self::with_client(reqwest::Client::new(), Url::parse(endpoint)?))
    }

    pub fn with_client(http: reqwest::Client, endpoint: Url) -> Self {
        Self {
            http,
            endpoint,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ToolCallError> {
        self.rpc_with_timeout(method, params, DEFAULT_TIMEOUT).await
    }

    async fn rpc_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ToolCallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        debug!("RPC {} -> {}", method, self.endpoint);

        // 非 2xx 响应也可能携带 JSON-RPC error，优先解析它
        let response: JsonRpcResponse = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .timeout(timeout)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(ToolCallError::Protocol {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| ToolCallError::InvalidResponse("响应缺少 result 字段".into()))
    }

    pub async fn ping(&self) -> Result<(), ToolCallError> {
        self.rpc("ping", json!({})).await.map(|_| ())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolCallError> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(tools)?)
    }

    /// 同步调用工具，返回归一化后的结果信封
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value, ToolCallError> {
        self.call_with_timeout(name, arguments, DEFAULT_TIMEOUT).await
    }

    pub async fn call_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ToolCallError> {
        let result = self
            .rpc_with_timeout(
                "tools/call",
                json!({"name": name, "arguments": arguments}),
                timeout,
            )
            .await?;
        Ok(normalize_tool_result(&result))
    }

    /// 提交异步任务，返回可轮询的任务句柄
    pub async fn submit(&self, name: &str, arguments: Value) -> Result<TaskHandle, ToolCallError> {
        let result = self
            .rpc("tools/submit", json!({"name": name, "arguments": arguments}))
            .await?;

        match result.get("task_id").and_then(Value::as_str) {
            Some(task_id) => Ok(TaskHandle {
                client: self.clone(),
                task_id: task_id.to_string(),
            }),
            None => Err(ToolCallError::Execution(
                result
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("提交任务失败，响应缺少 task_id")
                    .to_string(),
            )),
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskSnapshot, ToolCallError> {
        let result = self.rpc("tasks/get", json!({"task_id": task_id})).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, ToolCallError> {
        let result = self.rpc("tasks/cancel", json!({"task_id": task_id})).await?;
        Ok(result
            .get("cancelled")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// 提交并等待任务结束
    pub async fn call_and_wait(
        &self,
        name: &str,
        arguments: Value,
        options: WaitOptions,
    ) -> Result<Value, ToolCallError> {
        self.submit(name, arguments).await?.wait(options).await
    }
}

type ProgressFn = Box<dyn FnMut(f64, &str) + Send>;

/// [`TaskHandle::wait`] 的参数
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    on_progress: Option<ProgressFn>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ASYNC_TIMEOUT,
            poll_interval: Duration::from_millis(500),
            on_progress: None,
        }
    }
}

impl WaitOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// 进度或消息变化时回调
    pub fn on_progress(mut self, f: impl FnMut(f64, &str) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }
}

/// 已提交任务的句柄
#[derive(Debug, Clone)]
pub struct TaskHandle {
    client: McpClient,
    task_id: String,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn status(&self) -> Result<TaskSnapshot, ToolCallError> {
        self.client.get_task(&self.task_id).await
    }

    pub async fn cancel(&self) -> Result<bool, ToolCallError> {
        self.client.cancel_task(&self.task_id).await
    }

    /// 轮询直到任务结束
    ///
    /// 完成时返回归一化后的结果；失败、取消、超时分别对应不同的错误类型，
    /// 超时与工具自身报告的失败可以区分开。
    pub async fn wait(&self, mut options: WaitOptions) -> Result<Value, ToolCallError> {
        // 超时过大无法表示时视为不设截止时间
        let deadline = Instant::now().checked_add(options.timeout);
        let interval = options.poll_interval.max(MIN_POLL_INTERVAL);
        let mut last: Option<(f64, String)> = None;

        loop {
            let snapshot = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(self.timed_out(options.timeout));
                    }
                    match tokio::time::timeout(remaining, self.status()).await {
                        Ok(result) => result?,
                        Err(_) => return Err(self.timed_out(options.timeout)),
                    }
                }
                None => self.status().await?,
            };

            if let Some(callback) = options.on_progress.as_mut() {
                let current = (snapshot.progress, snapshot.display_message().to_string());
                if last.as_ref() != Some(&current) {
                    callback(current.0, &current.1);
                    last = Some(current);
                }
            }

            match snapshot.status {
                TaskStatus::Completed => {
                    return Ok(snapshot
                        .result
                        .as_ref()
                        .map(normalize_tool_result)
                        .unwrap_or(Value::Null));
                }
                TaskStatus::Failed => {
                    return Err(ToolCallError::Execution(
                        snapshot.error.unwrap_or_else(|| "Task failed".into()),
                    ));
                }
                TaskStatus::Cancelled => {
                    return Err(ToolCallError::Cancelled(
                        snapshot.error.unwrap_or_else(|| "Task cancelled".into()),
                    ));
                }
                _ => {}
            }

            let pause = match deadline {
                Some(deadline) => interval.min(deadline.saturating_duration_since(Instant::now())),
                None => interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    fn timed_out(&self, timeout: Duration) -> ToolCallError {
        ToolCallError::Timeout {
            task_id: self.task_id.clone(),
            timeout,
        }
    }
}

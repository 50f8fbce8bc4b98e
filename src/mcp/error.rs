use std::time::Duration;

use thiserror::Error;

use super::protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, TASK_NOT_FOUND,
};

/// 协议层错误，统一以 JSON-RPC `error` 对象返回给调用方
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid JSON-RPC version")]
    InvalidVersion,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method {0} not found")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Task {0} not found")]
    TaskNotFound(String),

    /// `tools/call` 中处理器异常，没有任务记录可挂载，只能作为传输层错误返回
    #[error("Tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },
}

impl RouterError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidVersion | Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::TaskNotFound(_) => TASK_NOT_FOUND,
            Self::ToolFailed { .. } => INTERNAL_ERROR,
        }
    }
}

/// 调用方（工具网关 / 任务句柄）看到的错误
#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("任务 {task_id} 等待超时 ({timeout:?})")]
    Timeout { task_id: String, timeout: Duration },

    #[error("任务已取消: {0}")]
    Cancelled(String),

    #[error("工具执行失败: {0}")]
    Execution(String),

    #[error("网络请求失败: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("无效的地址: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("协议错误 {code}: {message}")]
    Protocol { code: i32, message: String },

    #[error("响应解析失败: {0}")]
    InvalidResponse(String),
}

impl From<serde_json::Error> for ToolCallError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}

//! DawnChat 插件运行时
//!
//! 提供插件进程共用的两部分核心能力：
//! - `mcp`: JSON-RPC 工具路由，支持同步调用与异步任务（提交/轮询/进度/取消）
//! - `downloader`: 模型下载任务存储与模型管理，用于跨进程重启恢复下载状态

pub mod common;
pub mod downloader;
pub mod mcp;

pub use common::config::{PluginConfig, PluginDataPaths};
pub use common::envelope::{ToolEnvelope, extract_result_data, normalize_tool_result};
pub use downloader::store::DownloadTaskStore;
pub use mcp::{McpRouter, TaskContext, ToolHandler, report_progress};

pub mod client;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod progress;
pub mod protocol;
pub mod router;
pub mod server;
pub mod task;
pub mod tools;

pub use client::{McpClient, TaskHandle, WaitOptions};
pub use error::{RouterError, ToolCallError};
pub use handlers::{HandlerKind, ToolHandler, ToolRegistry, ToolResult};
pub use hooks::{LifecycleHooks, TaskEvent, TaskHook};
pub use progress::{TaskContext, report_progress};
pub use router::{McpRouter, McpRouterBuilder};
pub use server::{PluginInfo, PluginServer, build_app};
pub use task::{TaskSnapshot, TaskStatus};
pub use tools::ToolDefinition;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use super::progress::TaskContext;

pub type ToolResult = anyhow::Result<Value>;

type SyncFn = dyn Fn(Value, &TaskContext) -> ToolResult + Send + Sync;
type AsyncFn = dyn Fn(Value, TaskContext) -> BoxFuture<'static, ToolResult> + Send + Sync;

/// 处理器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// 普通函数，在阻塞线程池中执行
    Sync,
    /// 返回 future，可在 I/O 处挂起
    Suspending,
}

/// 已注册的工具处理器
///
/// 同步与异步处理器通过同一个 [`ToolHandler::invoke`] 调用，
/// 路由不需要区分两者。
#[derive(Clone)]
pub enum ToolHandler {
    Sync(Arc<SyncFn>),
    Suspending(Arc<AsyncFn>),
}

impl ToolHandler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Value, &TaskContext) -> ToolResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn suspending<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult> + Send + 'static,
    {
        Self::Suspending(Arc::new(move |args, ctx| f(args, ctx).boxed()))
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Sync(_) => HandlerKind::Sync,
            Self::Suspending(_) => HandlerKind::Suspending,
        }
    }

    /// 执行处理器，处理器内的 panic 会被转换成错误返回
    pub async fn invoke(&self, arguments: Value, ctx: TaskContext) -> ToolResult {
        match self {
            Self::Sync(f) => {
                let f = Arc::clone(f);
                let scoped = ctx.clone();
                tokio::task::spawn_blocking(move || scoped.sync_scope(|| f(arguments, &ctx)))
                    .await
                    .map_err(|e| anyhow::anyhow!("处理器异常退出: {}", e))?
            }
            Self::Suspending(f) => {
                let fut = f(arguments, ctx.clone());
                match AssertUnwindSafe(ctx.scope(fut)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(anyhow::anyhow!("处理器异常退出: {}", panic_message(&panic))),
                }
            }
        }
    }
}

impl fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ToolHandler::{:?}", self.kind())
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 工具名到处理器的映射
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: ToolHandler) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolHandler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn both_kinds_share_one_invocation_path() {
        let echo = ToolHandler::sync(|args, _| Ok(json!({"echo": args})));
        let upper = ToolHandler::suspending(|args: Value, _| async move {
            let text = args["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(json!({"text": text}))
        });

        assert_eq!(echo.kind(), HandlerKind::Sync);
        assert_eq!(upper.kind(), HandlerKind::Suspending);

        let out = echo
            .invoke(json!({"a": 1}), TaskContext::detached())
            .await
            .unwrap();
        assert_eq!(out, json!({"echo": {"a": 1}}));

        let out = upper
            .invoke(json!({"text": "sky"}), TaskContext::detached())
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "SKY"}));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let boom = ToolHandler::suspending(|_, _| async move {
            if true {
                panic!("model crashed");
            }
            Ok(Value::Null)
        });
        let err = boom
            .invoke(json!({}), TaskContext::detached())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model crashed"));

        let boom_sync = ToolHandler::sync(|_, _| panic!("sync crash"));
        assert!(
            boom_sync
                .invoke(json!({}), TaskContext::detached())
                .await
                .is_err()
        );
    }

    #[test]
    fn registry_lookup() {
        let mut registry = ToolRegistry::new();
        registry
            .register("a", ToolHandler::sync(|_, _| Ok(Value::Null)))
            .register("b", ToolHandler::sync(|_, _| Ok(Value::Null)));
        assert!(registry.contains("a"));
        assert!(registry.get("c").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}

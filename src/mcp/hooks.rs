use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use super::task::TaskSnapshot;

/// 任务生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Started,
    Progress,
    Completed,
    Failed,
}

impl TaskEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "task_started",
            Self::Progress => "task_progress",
            Self::Completed => "task_completed",
            Self::Failed => "task_failed",
        }
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 宿主侧观察任务生命周期的回调
pub trait TaskHook: Send + Sync {
    fn on_event(&self, event: TaskEvent, task: &TaskSnapshot) -> anyhow::Result<()>;
}

impl<F> TaskHook for F
where
    F: Fn(TaskEvent, &TaskSnapshot) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: TaskEvent, task: &TaskSnapshot) -> anyhow::Result<()> {
        self(event, task)
    }
}

/// 一组生命周期回调
///
/// 回调返回错误或 panic 都只记录日志，不影响任务自身的执行和最终状态。
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    hooks: Vec<Arc<dyn TaskHook>>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: impl TaskHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn push(&mut self, hook: Arc<dyn TaskHook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn emit(&self, event: TaskEvent, task: &TaskSnapshot) {
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.on_event(event, task))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("回调 {} 执行失败 (task {}): {:#}", event, task.task_id, e),
                Err(_) => warn!("回调 {} 发生 panic (task {})", event, task.task_id),
            }
        }
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

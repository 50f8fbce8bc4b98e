use std::future::Future;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::hooks::{LifecycleHooks, TaskEvent};
use super::task::TaskEntry;

tokio::task_local! {
    static CURRENT_TASK: TaskContext;
}

/// 处理器执行时拿到的任务上下文
///
/// 在调度任务时绑定到对应的任务记录，并发任务之间互不共享进度状态。
/// `tools/call` 的同步调用没有任务记录，使用 [`TaskContext::detached`]，
/// 此时进度上报直接丢弃。
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Option<TaskEntry>,
    hooks: LifecycleHooks,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn for_task(task: TaskEntry, hooks: LifecycleHooks) -> Self {
        let cancel = task.cancel_token().clone();
        Self {
            task: Some(task),
            hooks,
            cancel,
        }
    }

    pub fn detached() -> Self {
        Self {
            task: None,
            hooks: LifecycleHooks::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn task_id(&self) -> Option<String> {
        self.task.as_ref().map(|t| t.task_id())
    }

    /// 更新当前任务的进度，超出 [0, 1] 的值会被归一化
    pub fn report_progress(&self, progress: f64, message: impl Into<String>) {
        let Some(task) = &self.task else {
            debug!("同步调用中的进度上报被忽略");
            return;
        };
        let progress = clamp_progress(progress);
        let snapshot = {
            let mut record = task.lock();
            if !record.record_progress(progress, message) {
                return;
            }
            record.snapshot()
        };
        self.hooks.emit(TaskEvent::Progress, &snapshot);
    }

    /// 协作式取消标记，处理器可在长循环中自行检查
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 等待取消信号
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// 在当前上下文中执行 future，使 [`report_progress`] 能找到这个任务
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TASK.scope(self, fut).await
    }

    /// 同步版本的 [`TaskContext::scope`]，用于阻塞线程中执行的处理器
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_TASK.sync_scope(self, f)
    }

    /// 当前执行单元绑定的任务上下文
    pub fn current() -> Option<TaskContext> {
        CURRENT_TASK.try_with(|ctx| ctx.clone()).ok()
    }
}

/// 从处理器内部上报进度，无需显式传递上下文
///
/// 解析到的是当前执行单元所属的任务；不在任务中调用时什么也不做。
pub fn report_progress(progress: f64, message: impl Into<String>) {
    let message = message.into();
    if CURRENT_TASK
        .try_with(|ctx| ctx.report_progress(progress, message.clone()))
        .is_err()
    {
        debug!("当前执行单元没有绑定任务，忽略进度: {}", message);
    }
}

/// 当前任务是否已被取消
pub fn is_cancelled() -> bool {
    CURRENT_TASK
        .try_with(|ctx| ctx.is_cancelled())
        .unwrap_or(false)
}

/// 大于 1 的值按百分比处理，最终落在 [0, 1]
pub fn clamp_progress(raw: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    let value = if raw > 1.0 { raw / 100.0 } else { raw };
    value.clamp(0.0, 1.0)
}

/// 解析宿主或插件返回的任意进度字段
pub fn normalize_progress(raw: &Value) -> f64 {
    let value = match raw {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    clamp_progress(value)
}

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const MSG_STARTED: &str = "task started";
pub const MSG_COMPLETED: &str = "task completed";
pub const MSG_FAILED: &str = "task failed";
pub const MSG_CANCELLED: &str = "task cancelled";
pub const ERR_CANCELLED: &str = "Task cancelled";

/// 开始执行时写入的初始进度
const STARTED_PROGRESS: f64 = 0.05;

/// 任务状态机
///
/// ```text
/// accepted -> running -> completed | failed
/// accepted | running -> cancelled
/// ```
/// 终态之后不再迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Accepted,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// 仅出现在客户端解析宿主返回的未知状态时
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Accepted, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Accepted, Cancelled)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次异步工具调用
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: TaskStatus,
    pub progress: f64,
    pub progress_message: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            task_id: task_id.into(),
            tool_name: tool_name.into(),
            arguments,
            status: TaskStatus::Accepted,
            progress: 0.0,
            progress_message: String::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            debug!("忽略非法的状态迁移 {} -> {} ({})", self.status, next, self.task_id);
            return false;
        }
        self.status = next;
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        true
    }

    pub fn start(&mut self) -> bool {
        if !self.transition(TaskStatus::Running) {
            return false;
        }
        self.progress = STARTED_PROGRESS;
        self.progress_message = MSG_STARTED.to_string();
        true
    }

    pub fn complete(&mut self, result: Value) -> bool {
        if !self.transition(TaskStatus::Completed) {
            return false;
        }
        self.progress = 1.0;
        self.progress_message = MSG_COMPLETED.to_string();
        self.result = Some(result);
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.progress_message = MSG_FAILED.to_string();
        self.error = Some(error.into());
        true
    }

    pub fn cancel(&mut self) -> bool {
        if !self.transition(TaskStatus::Cancelled) {
            return false;
        }
        self.progress_message = MSG_CANCELLED.to_string();
        self.error = Some(ERR_CANCELLED.to_string());
        true
    }

    /// 只有运行中的任务才记录进度，取消之后的上报被丢弃
    pub fn record_progress(&mut self, progress: f64, message: impl Into<String>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.progress = progress;
        self.progress_message = message.into();
        true
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            tool_name: self.tool_name.clone(),
            status: self.status,
            progress: self.progress,
            progress_message: self.progress_message.clone(),
            message: self.progress_message.clone(),
            result: if self.status == TaskStatus::Completed {
                self.result.clone()
            } else {
                None
            },
            error: if matches!(self.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                self.error.clone()
            } else {
                None
            },
            created_at: Some(self.created_at),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// `tasks/get` 返回的任务快照，客户端也用它解析响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub tool_name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub progress_message: String,
    /// 与 `progress_message` 相同，兼容只认 `message` 的旧调用方
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn display_message(&self) -> &str {
        if self.progress_message.is_empty() {
            &self.message
        } else {
            &self.progress_message
        }
    }
}

/// 注册表中的一项：任务记录与它的取消信号
#[derive(Debug, Clone)]
pub struct TaskEntry {
    record: Arc<Mutex<Task>>,
    cancel: CancellationToken,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        Self {
            record: Arc::new(Mutex::new(task)),
            cancel: CancellationToken::new(),
        }
    }

    /// 记录锁只在同步代码里短暂持有，不跨越 await
    pub fn lock(&self) -> MutexGuard<'_, Task> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.lock().snapshot()
    }

    pub fn task_id(&self) -> String {
        self.lock().task_id.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// `tasks/cancel` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFinished(TaskStatus),
}

/// 进程内的任务注册表
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<String, TaskEntry>>, // task_id -> Task
    retention: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl TaskRegistry {
    /// `retention`：终态任务保留多久后被清理
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// 分配新任务（`accepted` 状态），ID 冲突时重新生成
    pub fn create(&self, tool_name: &str, arguments: Value) -> TaskEntry {
        loop {
            let task_id = new_task_id();
            if let Entry::Vacant(slot) = self.tasks.entry(task_id.clone()) {
                let entry = TaskEntry::new(Task::new(task_id, tool_name, arguments));
                slot.insert(entry.clone());
                return entry;
            }
        }
    }

    pub fn entry(&self, task_id: &str) -> Option<TaskEntry> {
        self.tasks.get(task_id).map(|e| e.value().clone())
    }

    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.entry(task_id).map(|e| e.snapshot())
    }

    /// 尽力而为的取消：状态立即变为 `cancelled`，并通知执行单元停止
    pub fn cancel(&self, task_id: &str) -> Option<CancelOutcome> {
        let entry = self.entry(task_id)?;
        let outcome = {
            let mut task = entry.lock();
            if task.cancel() {
                CancelOutcome::Cancelled
            } else {
                CancelOutcome::AlreadyFinished(task.status)
            }
        };
        if outcome == CancelOutcome::Cancelled {
            entry.cancel.cancel();
        }
        Some(outcome)
    }

    /// 清理结束时间早于保留期的终态任务，返回清理数量
    pub fn prune_finished(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        // 并发提交会在清理期间插入新任务，只统计真正删除的条目
        let mut removed = 0;
        self.tasks.retain(|_, entry| {
            let task = entry.lock();
            let expired = task.status.is_terminal() && task.completed_at.is_some_and(|at| at < cutoff);
            if expired {
                removed += 1;
            }
            !expired
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

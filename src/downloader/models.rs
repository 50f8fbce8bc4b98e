use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// 下载来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadSource {
    Huggingface,
    Github,
    Http,
}

impl DownloadSource {
    /// 按 URL 判断直链下载使用的来源
    pub fn for_url(url: &str) -> Self {
        if url.contains("github.com") {
            Self::Github
        } else {
            Self::Http
        }
    }
}

// --------------------------------------------------------------------
/// 宿主下载服务报告的任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
    #[default]
    #[serde(other)]
    Unknown,
}

impl DownloadStatus {
    /// 这些状态下磁盘上的文件不能视为已安装
    pub fn is_non_complete(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Downloading | Self::Paused | Self::Failed | Self::Cancelled
        )
    }

    /// 仍在进行中的下载，再次启动会产生重复任务
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Downloading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 宿主下载服务中的一个任务
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadTask {
    pub task_id: String,
    pub backend: String,
    pub source: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed: String,
    pub error_message: Option<String>,
    pub model_type: Option<String>,
    pub model_id: Option<String>,
    pub hf_repo_id: Option<String>,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub save_dir: Option<String>,
    pub save_path: Option<String>,
}

impl DownloadTask {
    /// 状态表中展示的进度字段
    pub fn progress_fields(&self) -> Value {
        json!({
            "status": self.status,
            "progress": self.progress,
            "downloaded_bytes": self.downloaded_bytes,
            "total_bytes": self.total_bytes,
            "speed": self.speed,
            "error_message": self.error_message,
        })
    }
}

/// 从 Hugging Face 仓库下载
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HfDownloadRequest {
    pub model_type: String,
    pub model_id: String,
    pub hf_repo_id: String,
    pub save_dir: PathBuf,
    pub filename: Option<String>,
    pub use_mirror: Option<bool>,
    pub resume: bool,
}

/// 直链下载（GitHub / HTTP）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlDownloadRequest {
    pub source: DownloadSource,
    pub url: String,
    pub save_path: PathBuf,
    pub task_id: String,
    pub use_mirror: Option<bool>,
    pub resume: bool,
}

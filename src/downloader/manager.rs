use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::artifacts::is_single_file_installed;
use super::error::DownloadError;
use super::facade::DownloadFacade;
use super::models::{DownloadSource, DownloadStatus, DownloadTask, HfDownloadRequest, UrlDownloadRequest};
use super::store::DownloadTaskStore;
use crate::common::envelope::{CODE_BAD_REQUEST, CODE_NOT_FOUND, ToolEnvelope};
use crate::mcp::handlers::ToolHandler;

/// 模型目录中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub download_url: String,
    pub filename: String,
    /// 模型所在的子目录，例如 `checkpoints`
    pub model_type: String,
    #[serde(default)]
    pub size_gb: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 插件的模型管理器
///
/// 维护模型目录，把下载委托给宿主下载服务，并通过 [`DownloadTaskStore`]
/// 记住每个模型对应的下载任务，进程重启后仍能继续查询进度。
pub struct ModelManager {
    namespace: String,
    task_prefix: String,
    models: Vec<ModelSpec>,
    models_dir: PathBuf,
    downloader: Arc<dyn DownloadFacade>,
    store: Arc<DownloadTaskStore>,
    start_locks: DashMap<String, Arc<Mutex<()>>>, // model_id -> 启动锁
}

impl ModelManager {
    /// `namespace` 同时作为下载服务中的 `model_type` 和任务 ID 前缀
    pub fn new(
        namespace: impl Into<String>,
        models: Vec<ModelSpec>,
        models_dir: impl AsRef<Path>,
        downloader: Arc<dyn DownloadFacade>,
        store: Arc<DownloadTaskStore>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            task_prefix: format!("{namespace}_"),
            namespace,
            models,
            models_dir: models_dir.as_ref().to_path_buf(),
            downloader,
            store,
            start_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &DownloadTaskStore {
        &self.store
    }

    pub fn spec(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.model_id == model_id)
    }

    pub fn model_path(&self, model_id: &str) -> Option<PathBuf> {
        self.spec(model_id)
            .map(|spec| self.models_dir.join(&spec.model_type).join(&spec.filename))
    }

    /// 查询模型当前的下载任务，下载服务异常时按没有任务处理
    pub async fn task_for_model(&self, model_id: &str) -> Option<DownloadTask> {
        let task_id = self.store.get(model_id).await?;
        match self.downloader.get(&task_id).await {
            Ok(task) => Some(task),
            Err(e) => {
                debug!("查询下载任务 {} 失败，按无任务处理: {}", task_id, e);
                None
            }
        }
    }

    pub async fn is_model_installed(&self, model_id: &str) -> bool {
        let Some(path) = self.model_path(model_id) else {
            return false;
        };
        let task = self.task_for_model(model_id).await;
        is_single_file_installed(&path, task.as_ref(), 1).await
    }

    /// 模型列表及每个模型的安装和下载状态
    pub async fn list_models(&self) -> Vec<Value> {
        let task_map = self.store.load().await;
        let mut items = Vec::with_capacity(self.models.len());

        for spec in &self.models {
            let mut progress = json!({
                "status": "idle",
                "progress": 0,
                "downloaded_bytes": 0,
                "total_bytes": 0,
                "speed": "",
            });
            let mut task = None;
            if let Some(task_id) = task_map.get(&spec.model_id) {
                match self.downloader.get(task_id).await {
                    Ok(t) => {
                        progress = t.progress_fields();
                        task = Some(t);
                    }
                    Err(e) => debug!("获取 {} 的下载进度失败: {}", spec.model_id, e),
                }
            }

            let path = self.models_dir.join(&spec.model_type).join(&spec.filename);
            let installed = is_single_file_installed(&path, task.as_ref(), 1).await;

            let mut item = json!({
                "id": spec.model_id,
                "name": spec.name,
                "description": spec.description,
                "download_url": spec.download_url,
                "filename": spec.filename,
                "model_type": spec.model_type,
                "size_gb": spec.size_gb,
                "tags": spec.tags,
                "installed": installed,
                "model_path": path.display().to_string(),
            });
            if let (Some(item), Value::Object(progress)) = (item.as_object_mut(), progress) {
                item.extend(progress);
            }
            items.push(item);
        }
        items
    }

    /// 启动下载
    ///
    /// 同一模型的并发启动请求被串行化；已有进行中的任务时直接复用，
    /// 不会为同一模型同时产生两个下载。
    pub async fn start_download(
        &self,
        model_id: &str,
        use_mirror: Option<bool>,
        resume: bool,
    ) -> Result<ToolEnvelope, DownloadError> {
        let Some(spec) = self.spec(model_id).cloned() else {
            return Ok(ToolEnvelope::error(CODE_NOT_FOUND, "model_not_found"));
        };

        let lock = self
            .start_locks
            .entry(model_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let existing = self.task_for_model(model_id).await;
        let path = self.models_dir.join(&spec.model_type).join(&spec.filename);
        if is_single_file_installed(&path, existing.as_ref(), 1).await {
            return Ok(ToolEnvelope::with_message(
                "already_installed",
                json!({"model_id": model_id}),
            ));
        }
        if let Some(task) = existing.filter(|t| t.status.is_live()) {
            info!("模型 {} 已在下载中，复用任务 {}", model_id, task.task_id);
            return Ok(ToolEnvelope::with_message(
                "already_downloading",
                json!({"task_id": task.task_id, "model_id": model_id}),
            ));
        }

        let task = if spec.download_url.contains("huggingface.co") {
            let Some((repo_id, filename)) = parse_hf_url(&spec.download_url) else {
                return Ok(ToolEnvelope::error(CODE_BAD_REQUEST, "invalid_hf_url"));
            };
            self.downloader
                .start_hf_download(HfDownloadRequest {
                    model_type: self.namespace.clone(),
                    model_id: model_id.to_string(),
                    hf_repo_id: repo_id,
                    save_dir: self.models_dir.join(&spec.model_type),
                    filename: Some(filename),
                    use_mirror,
                    resume,
                })
                .await?
        } else {
            self.downloader
                .start_url_download(UrlDownloadRequest {
                    source: DownloadSource::for_url(&spec.download_url),
                    url: spec.download_url.clone(),
                    save_path: path,
                    task_id: format!("{}{}", self.task_prefix, model_id),
                    use_mirror,
                    resume,
                })
                .await?
        };

        self.store.set(model_id, &task.task_id).await?;
        info!("开始下载模型 {}，任务 {}", model_id, task.task_id);
        Ok(ToolEnvelope::with_message(
            "started",
            json!({"task_id": task.task_id, "model_id": model_id}),
        ))
    }

    pub async fn get_download_status(&self, model_id: &str) -> ToolEnvelope {
        if self.is_model_installed(model_id).await {
            if let Err(e) = self.forget_if_installed(model_id).await {
                warn!("清理模型 {} 的下载映射失败: {}", model_id, e);
            }
            return ToolEnvelope::success(
                json!({"status": "completed", "progress": 100, "model_id": model_id}),
            );
        }
        let not_found =
            || ToolEnvelope::success(json!({"status": "not_found", "progress": 0, "model_id": model_id}));

        let Some(task) = self.task_for_model(model_id).await else {
            return not_found();
        };
        let mut data = task.progress_fields();
        data["task_id"] = json!(task.task_id);
        data["model_id"] = json!(model_id);
        ToolEnvelope::success(data)
    }

    pub async fn pause_download(&self, model_id: &str) -> Result<ToolEnvelope, DownloadError> {
        let Some(task_id) = self.store.get(model_id).await else {
            return Ok(ToolEnvelope::error(CODE_NOT_FOUND, "download_task_not_found"));
        };
        self.downloader.pause(&task_id).await?;
        Ok(ToolEnvelope::with_message(
            "paused",
            json!({"task_id": task_id, "model_id": model_id}),
        ))
    }

    pub async fn cancel_download(&self, model_id: &str) -> Result<ToolEnvelope, DownloadError> {
        let Some(task_id) = self.store.get(model_id).await else {
            return Ok(ToolEnvelope::error(CODE_NOT_FOUND, "download_task_not_found"));
        };
        if let Err(e) = self.downloader.cancel(&task_id).await {
            // 远端任务可能已被清理，本地映射仍然要删掉
            warn!("取消下载任务 {} 失败: {}", task_id, e);
        }
        self.store.remove(model_id).await?;
        Ok(ToolEnvelope::with_message(
            "cancelled",
            json!({"task_id": task_id, "model_id": model_id}),
        ))
    }

    /// 模型文件已就位且远端任务已结束时删除映射，返回是否删除
    ///
    /// 下载服务查询失败时保留映射，下次再判断。
    async fn forget_if_installed(&self, model_id: &str) -> Result<bool, DownloadError> {
        let Some(task_id) = self.store.get(model_id).await else {
            return Ok(false);
        };
        let finished = match self.downloader.get(&task_id).await {
            Ok(task) => task.status == DownloadStatus::Completed,
            Err(DownloadError::TaskNotFound(_)) | Err(DownloadError::Facade { status: 404, .. }) => true,
            Err(e) => {
                debug!("查询下载任务 {} 失败，暂不清理: {}", task_id, e);
                false
            }
        };
        if !finished || !self.is_model_installed(model_id).await {
            return Ok(false);
        }
        self.store.remove(model_id).await?;
        debug!("模型 {} 已安装，移除下载映射 {}", model_id, task_id);
        Ok(true)
    }

    /// 列出下载服务中属于本插件的未完成任务，并据此修正本地映射
    pub async fn list_pending_downloads(&self) -> Result<ToolEnvelope, DownloadError> {
        let tasks = self
            .downloader
            .pending(Some(&self.namespace), Some(&self.task_prefix))
            .await?;

        let mut upserts = HashMap::new();
        let result: Vec<Value> = tasks
            .iter()
            .map(|task| {
                if let Some(model_id) = task.model_id.as_deref().filter(|id| !id.is_empty()) {
                    upserts.insert(model_id.to_string(), task.task_id.clone());
                }
                let mut item = task.progress_fields();
                item["task_id"] = json!(task.task_id);
                item["model_id"] = json!(task.model_id.clone().unwrap_or_default());
                item
            })
            .collect();

        self.store.upsert_many(upserts).await?;
        for spec in &self.models {
            if self.is_model_installed(&spec.model_id).await {
                self.forget_if_installed(&spec.model_id).await?;
            }
        }
        Ok(ToolEnvelope::success(
            json!({"count": result.len(), "tasks": result}),
        ))
    }
}

/// 解析 `https://huggingface.co/<org>/<repo>/resolve/<rev>/<path>`
pub fn parse_hf_url(raw: &str) -> Option<(String, String)> {
    let url = Url::parse(raw).ok()?;
    let parts: Vec<&str> = url.path_segments()?.filter(|p| !p.is_empty()).collect();
    if parts.len() >= 5 && parts[2] == "resolve" {
        Some((format!("{}/{}", parts[0], parts[1]), parts[4..].join("/")))
    } else {
        None
    }
}

fn model_id_arg(args: &Value) -> anyhow::Result<String> {
    args.get("model_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("缺少model_id参数"))
}

fn envelope_value(result: Result<ToolEnvelope, DownloadError>) -> anyhow::Result<Value> {
    Ok(result?.to_value())
}

/// 把模型管理操作注册为工具
pub fn model_tools(manager: Arc<ModelManager>) -> Vec<(&'static str, ToolHandler)> {
    let m = manager.clone();
    let list = ToolHandler::suspending(move |_, _| {
        let m = m.clone();
        async move { Ok(json!({"models": m.list_models().await})) }
    });

    let m = manager.clone();
    let start = ToolHandler::suspending(move |args: Value, _| {
        let m = m.clone();
        async move {
            let model_id = model_id_arg(&args)?;
            let use_mirror = args.get("use_mirror").and_then(Value::as_bool);
            let resume = args.get("resume").and_then(Value::as_bool).unwrap_or(true);
            envelope_value(m.start_download(&model_id, use_mirror, resume).await)
        }
    });

    let m = manager.clone();
    let status = ToolHandler::suspending(move |args: Value, _| {
        let m = m.clone();
        async move {
            let model_id = model_id_arg(&args)?;
            Ok(m.get_download_status(&model_id).await.to_value())
        }
    });

    let m = manager.clone();
    let pause = ToolHandler::suspending(move |args: Value, _| {
        let m = m.clone();
        async move {
            let model_id = model_id_arg(&args)?;
            envelope_value(m.pause_download(&model_id).await)
        }
    });

    let m = manager.clone();
    let cancel = ToolHandler::suspending(move |args: Value, _| {
        let m = m.clone();
        async move {
            let model_id = model_id_arg(&args)?;
            envelope_value(m.cancel_download(&model_id).await)
        }
    });

    let m = manager;
    let pending = ToolHandler::suspending(move |_, _| {
        let m = m.clone();
        async move { envelope_value(m.list_pending_downloads().await) }
    });

    vec![
        ("list_models", list),
        ("start_download", start),
        ("download_status", status),
        ("pause_download", pause),
        ("cancel_download", cancel),
        ("pending_downloads", pending),
    ]
}

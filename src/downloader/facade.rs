use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::error::DownloadError;
use super::models::{DownloadTask, HfDownloadRequest, UrlDownloadRequest};

/// 宿主提供的模型下载服务
///
/// 真正的下载、断点续传都在宿主进程里完成，插件只持有任务 ID。
#[async_trait]
pub trait DownloadFacade: Send + Sync {
    async fn start_hf_download(&self, request: HfDownloadRequest) -> Result<DownloadTask, DownloadError>;

    async fn start_url_download(&self, request: UrlDownloadRequest) -> Result<DownloadTask, DownloadError>;

    async fn get(&self, task_id: &str) -> Result<DownloadTask, DownloadError>;

    async fn pause(&self, task_id: &str) -> Result<Value, DownloadError>;

    async fn cancel(&self, task_id: &str) -> Result<Value, DownloadError>;

    /// 宿主上所有未完成的任务
    async fn pending_all(&self) -> Result<Vec<DownloadTask>, DownloadError>;

    /// 按模型类型和任务 ID 前缀过滤未完成的任务
    async fn pending(
        &self,
        model_type: Option<&str>,
        task_id_prefix: Option<&str>,
    ) -> Result<Vec<DownloadTask>, DownloadError> {
        let tasks = self.pending_all().await?;
        Ok(tasks
            .into_iter()
            .filter(|t| model_type.is_none_or(|mt| t.model_type.as_deref() == Some(mt)))
            .filter(|t| task_id_prefix.is_none_or(|p| t.task_id.starts_with(p)))
            .collect())
    }
}

/// 通过宿主 HTTP 接口 `/sdk/downloads/*` 实现的下载服务
#[derive(Debug, Clone)]
pub struct HostDownloadFacade {
    client: Client,
    base_url: Url,
}

impl HostDownloadFacade {
    /// 单次请求的默认超时
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(host_url: &str) -> Result<Self, DownloadError> {
        Self::with_timeout(host_url, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(host_url: &str, timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: Url::parse(host_url)?,
        })
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DownloadError> {
        let url = self.base_url.join(path)?;
        debug!("请求宿主下载服务: {} {}", method, url);

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DownloadError::Facade {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    async fn start(&self, body: Value) -> Result<DownloadTask, DownloadError> {
        let response = self
            .request(Method::POST, "/sdk/downloads/start", Some(body))
            .await?;
        parse_task(&response)
    }
}

fn parse_task(response: &Value) -> Result<DownloadTask, DownloadError> {
    let task = response.get("task").cloned().unwrap_or_else(|| json!({}));
    Ok(serde_json::from_value(task)?)
}

#[async_trait]
impl DownloadFacade for HostDownloadFacade {
    async fn start_hf_download(&self, request: HfDownloadRequest) -> Result<DownloadTask, DownloadError> {
        let mut body = serde_json::to_value(&request)?;
        body["source"] = json!("huggingface");
        self.start(body).await
    }

    async fn start_url_download(&self, request: UrlDownloadRequest) -> Result<DownloadTask, DownloadError> {
        self.start(serde_json::to_value(&request)?).await
    }

    async fn get(&self, task_id: &str) -> Result<DownloadTask, DownloadError> {
        let response = self
            .request(Method::GET, &format!("/sdk/downloads/task/{task_id}"), None)
            .await?;
        parse_task(&response)
    }

    async fn pause(&self, task_id: &str) -> Result<Value, DownloadError> {
        self.request(
            Method::POST,
            &format!("/sdk/downloads/task/{task_id}/pause"),
            Some(json!({})),
        )
        .await
    }

    async fn cancel(&self, task_id: &str) -> Result<Value, DownloadError> {
        self.request(
            Method::POST,
            &format!("/sdk/downloads/task/{task_id}/cancel"),
            Some(json!({})),
        )
        .await
    }

    async fn pending_all(&self) -> Result<Vec<DownloadTask>, DownloadError> {
        let response = self
            .request(Method::GET, "/sdk/downloads/pending", None)
            .await?;
        let tasks = response
            .get("tasks")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.is_object())
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(tasks)
    }
}

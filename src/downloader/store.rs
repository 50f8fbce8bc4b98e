use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::DownloadError;

/// 模型 ID 到下载任务 ID 的持久化映射
///
/// 每个插件实例一个 JSON 文件。所有读改写都在同一把锁内完成，
/// 写入先落到临时文件再 rename，文件不会处于写了一半的状态。
/// 只保证单进程内的串行化，多进程共享同一文件需要外部文件锁。
#[derive(Debug)]
pub struct DownloadTaskStore {
    file_path: PathBuf,
    lock: Mutex<()>,
}

impl DownloadTaskStore {
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// 读取完整映射，文件不存在或损坏时视为空
    pub async fn load(&self) -> BTreeMap<String, String> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn get(&self, model_id: &str) -> Option<String> {
        self.load().await.remove(model_id)
    }

    /// 写入映射，同一模型只保留最新的任务 ID
    pub async fn set(&self, model_id: &str, task_id: &str) -> Result<(), DownloadError> {
        let _guard = self.lock.lock().await;
        let mut mapping = self.read().await;
        mapping.insert(model_id.to_string(), task_id.to_string());
        self.write(&mapping).await
    }

    /// 删除映射，返回被删除的任务 ID
    pub async fn remove(&self, model_id: &str) -> Result<Option<String>, DownloadError> {
        let _guard = self.lock.lock().await;
        let mut mapping = self.read().await;
        let removed = mapping.remove(model_id);
        if removed.is_some() {
            self.write(&mapping).await?;
        }
        Ok(removed)
    }

    /// 批量合并从下载服务观察到的任务（对账）
    pub async fn upsert_many<I, K, V>(&self, pairs: I) -> Result<usize, DownloadError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if pairs.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.lock().await;
        let mut mapping = self.read().await;
        let mut changed = 0;
        for (model_id, task_id) in pairs {
            if mapping.get(&model_id) != Some(&task_id) {
                mapping.insert(model_id, task_id);
                changed += 1;
            }
        }
        if changed > 0 {
            self.write(&mapping).await?;
        }
        debug!("对账更新了 {} 条下载任务映射", changed);
        Ok(changed)
    }

    async fn read(&self) -> BTreeMap<String, String> {
        let raw = match tokio::fs::read_to_string(&self.file_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!("读取下载任务文件失败 {}: {}", self.file_path.display(), e);
                return BTreeMap::new();
            }
        };

        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw) {
            Ok(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect(),
            Err(e) => {
                warn!("下载任务文件已损坏，按空处理 {}: {}", self.file_path.display(), e);
                BTreeMap::new()
            }
        }
    }

    async fn write(&self, mapping: &BTreeMap<String, String>) -> Result<(), DownloadError> {
        if let Some(parent) = self.file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(mapping)?;
        let tmp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &self.file_path).await?;
        Ok(())
    }
}

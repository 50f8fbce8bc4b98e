use std::path::{Path, PathBuf};

use tracing::debug;

pub const ENV_PLUGIN_ID: &str = "DAWNCHAT_PLUGIN_ID";
pub const ENV_HOST_PORT: &str = "DAWNCHAT_HOST_PORT";
pub const ENV_PLUGIN_BASE_PATH: &str = "DAWNCHAT_PLUGIN_BASE_PATH";
pub const ENV_DATA_DIR: &str = "DAWNCHAT_DATA_DIR";
pub const ENV_LOG_DIR: &str = "DAWNCHAT_PLUGIN_LOG_DIR";

pub const DEFAULT_PLUGIN_ID: &str = "com.dawnchat.demo";
pub const DEFAULT_HOST_PORT: u16 = 8000;

/// 插件进程配置，来源于宿主注入的环境变量，命令行参数可覆盖
#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig {
    pub plugin_id: String,
    pub host_port: u16,
    pub base_path: Option<PathBuf>,
    pub data_root: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl PluginConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过自定义查找函数读取配置，便于测试时不依赖进程环境
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let plugin_id = non_empty(ENV_PLUGIN_ID).unwrap_or_else(|| DEFAULT_PLUGIN_ID.to_string());
        let host_port = match non_empty(ENV_HOST_PORT) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                debug!("无法解析 {}={}，使用默认端口", ENV_HOST_PORT, raw);
                DEFAULT_HOST_PORT
            }),
            None => DEFAULT_HOST_PORT,
        };
        let data_root = non_empty(ENV_DATA_DIR)
            .map(|dir| expand_home(&dir, &lookup))
            .unwrap_or_else(|| default_data_root(&lookup));

        Self {
            plugin_id,
            host_port,
            base_path: non_empty(ENV_PLUGIN_BASE_PATH).map(PathBuf::from),
            data_root,
            log_dir: non_empty(ENV_LOG_DIR).map(PathBuf::from),
        }
    }

    pub fn with_plugin_id(mut self, plugin_id: Option<String>) -> Self {
        if let Some(id) = plugin_id.filter(|id| !id.trim().is_empty()) {
            self.plugin_id = id;
        }
        self
    }

    pub fn with_data_root(mut self, data_root: Option<PathBuf>) -> Self {
        if let Some(root) = data_root {
            self.data_root = root;
        }
        self
    }

    /// 宿主 HTTP 服务地址，插件通过它访问下载、工具网关等能力
    pub fn host_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.host_port)
    }

    pub fn data_paths(&self) -> PluginDataPaths {
        PluginDataPaths::new(&self.plugin_id, &self.data_root)
    }
}

/// 插件数据目录布局: `<root>/plugins/<plugin_id>/data/{models,cache,tmp,meta}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDataPaths {
    pub plugin_id: String,
    pub data_root: PathBuf,
}

impl PluginDataPaths {
    pub fn new(plugin_id: impl Into<String>, data_root: impl AsRef<Path>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            data_root: data_root.as_ref().to_path_buf(),
        }
    }

    pub fn plugin_root(&self) -> PathBuf {
        self.data_root.join("plugins").join(&self.plugin_id)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.plugin_root().join("data")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir().join("models")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join("cache")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir().join("tmp")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir().join("meta")
    }

    /// 下载任务映射文件，每个插件实例一份
    pub fn download_tasks_file(&self) -> PathBuf {
        self.meta_dir().join("download_tasks.json")
    }

    pub async fn ensure_dirs(self) -> std::io::Result<Self> {
        for dir in [
            self.models_dir(),
            self.cache_dir(),
            self.tmp_dir(),
            self.meta_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(self)
    }
}

fn expand_home<F>(raw: &str, lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    match (raw.strip_prefix("~/"), lookup("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(raw),
    }
}

fn default_data_root<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    let home = lookup("HOME")
        .or_else(|| lookup("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    if cfg!(target_os = "macos") {
        home.join("Library").join("Application Support").join("DawnChat")
    } else if cfg!(target_os = "windows") {
        match lookup("APPDATA") {
            Some(appdata) => PathBuf::from(appdata).join("DawnChat"),
            None => home.join("AppData").join("Roaming").join("DawnChat"),
        }
    } else {
        home.join(".local").join("share").join("DawnChat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_host_environment() {
        let config = PluginConfig::from_lookup(lookup_from(&[
            (ENV_PLUGIN_ID, "com.dawnchat.comfyui"),
            (ENV_HOST_PORT, "9123"),
            (ENV_DATA_DIR, "/data/dawn"),
            (ENV_PLUGIN_BASE_PATH, "/plugins/comfyui"),
        ]));
        assert_eq!(config.plugin_id, "com.dawnchat.comfyui");
        assert_eq!(config.host_url(), "http://127.0.0.1:9123");
        assert_eq!(config.base_path, Some(PathBuf::from("/plugins/comfyui")));
        assert_eq!(
            config.data_paths().download_tasks_file(),
            PathBuf::from("/data/dawn/plugins/com.dawnchat.comfyui/data/meta/download_tasks.json")
        );
    }

    #[test]
    fn falls_back_to_defaults() {
        let config = PluginConfig::from_lookup(lookup_from(&[
            (ENV_PLUGIN_ID, "   "),
            (ENV_HOST_PORT, "not-a-port"),
            ("HOME", "/home/dawn"),
        ]));
        assert_eq!(config.plugin_id, DEFAULT_PLUGIN_ID);
        assert_eq!(config.host_port, DEFAULT_HOST_PORT);
        assert!(config.data_root.starts_with("/home/dawn"));
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn cli_overrides_win() {
        let config = PluginConfig::from_lookup(lookup_from(&[(ENV_PLUGIN_ID, "from-env")]))
            .with_plugin_id(Some("from-cli".to_string()))
            .with_data_root(Some(PathBuf::from("/tmp/override")));
        assert_eq!(config.plugin_id, "from-cli");
        assert_eq!(config.data_root, PathBuf::from("/tmp/override"));
    }
}

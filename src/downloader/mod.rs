//! 模型下载：宿主下载服务的客户端、任务映射存储和模型管理

pub mod artifacts;
pub mod error;
pub mod facade;
pub mod manager;
pub mod models;
pub mod store;

pub use error::DownloadError;
pub use facade::{DownloadFacade, HostDownloadFacade};
pub use manager::{ModelManager, ModelSpec, model_tools, parse_hf_url};
pub use models::{DownloadSource, DownloadStatus, DownloadTask, HfDownloadRequest, UrlDownloadRequest};
pub use store::DownloadTaskStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP错误: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("任务未找到: {0}")]
    TaskNotFound(String),

    #[error("下载服务返回错误 {status}: {message}")]
    Facade { status: u16, message: String },
}

impl From<url::ParseError> for DownloadError {
    fn from(error: url::ParseError) -> Self {
        DownloadError::InvalidUrl(error.to_string())
    }
}

use clap::Parser;
use std::path::PathBuf;

/// DawnChat 示例插件
#[derive(Parser, Debug)]
#[command(name = "dawnchat-plugin")]
#[command(version)]
#[command(about = "DawnChat 插件进程：通过 /mcp 提供同步工具调用和异步任务", long_about = None)]
pub struct Cli {
    /// 监听地址
    #[arg(long, value_name = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// 监听端口
    #[arg(long, value_name = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// 插件 manifest 文件
    #[arg(long, value_name = "FILE", default_value = "./manifest.json")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub manifest: PathBuf,

    /// 插件 ID，未指定时读取 DAWNCHAT_PLUGIN_ID
    #[arg(long, value_name = "ID")]
    pub plugin_id: Option<String>,

    /// 数据根目录，未指定时读取 DAWNCHAT_DATA_DIR
    #[arg(long, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub data_dir: Option<PathBuf>,

    /// 日志级别 (RUST_LOG 优先)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// 关闭 tools/submit、tasks/get、tasks/cancel
    #[arg(long)]
    pub no_async_tasks: bool,
}

use std::path::Path;

use colored::*;
use serde_json::Value;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化 tracing 日志
///
/// 控制台总是输出；设置了日志目录时额外写入 `<dir>/<plugin_id>.log`。
/// 返回的 guard 需要在进程生命周期内持有，否则文件日志会丢失。
pub fn init_tracing(level: &str, plugin_id: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("无法创建日志目录 {}: {}", dir.display(), e);
                let _ = registry.try_init();
                return None;
            }
            let appender = tracing_appender::rolling::never(dir, format!("{plugin_id}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init();
            Some(guard)
        }
        None => {
            let _ = registry.try_init();
            None
        }
    }
}

/// 面向控制台的输出工具
pub struct PrettyLogger;

impl PrettyLogger {
    /// 宿主通过 stderr 上的这一行判断插件已就绪
    pub fn ready_handshake() {
        eprintln!("{}", serde_json::json!({"status": "ready"}));
    }

    /// 显示信息消息
    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    /// 显示警告消息
    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    /// 显示分割线
    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    /// 显示标题
    pub fn title(text: impl AsRef<str>) {
        let text = text.as_ref();
        let width = text.chars().count().min(48);
        let padding = (48 - width) / 2;
        println!(
            "{} {} {}",
            "─".repeat(padding).bright_black(),
            text.bold(),
            "─".repeat(48 - padding - width).bright_black()
        );
    }

    /// 显示模型下载状态表
    pub fn model_table(models: &[Value]) {
        Self::title("模型列表");
        for model in models {
            let id = model["id"].as_str().unwrap_or("?");
            let status = model["status"].as_str().unwrap_or("idle");
            let installed = model["installed"].as_bool().unwrap_or(false);
            let mark = if installed {
                "已安装".green()
            } else {
                status.yellow()
            };
            println!("  {:<24} {}", id.bold(), mark);
        }
        Self::separator();
    }
}

/// 便捷宏用于漂亮的日志输出
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::info(format!($($arg)*))
    };
}

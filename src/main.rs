use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{debug, info};

use dawnchat_plugin::common::config::PluginConfig;
use dawnchat_plugin::common::logger::PrettyLogger;
use dawnchat_plugin::downloader::{
    DownloadTaskStore, HostDownloadFacade, ModelManager, ModelSpec, model_tools,
};
use dawnchat_plugin::mcp::tools::{load_manifest, manifest_tools};
use dawnchat_plugin::mcp::{McpRouter, PluginInfo, PluginServer, TaskContext, ToolHandler};
use dawnchat_plugin::{common::logger::init_tracing, log_info};

mod cli;

/// 模型在宿主下载服务中的命名空间
const MODEL_NAMESPACE: &str = "demo";

fn demo_catalog() -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            model_id: "sdxl-base".to_string(),
            name: "SDXL Base 1.0".to_string(),
            description: "Stable Diffusion XL 基础模型".to_string(),
            download_url: "https://huggingface.co/stabilityai/stable-diffusion-xl-base-1.0/resolve/main/sd_xl_base_1.0.safetensors".to_string(),
            filename: "sd_xl_base_1.0.safetensors".to_string(),
            model_type: "checkpoints".to_string(),
            size_gb: 6.9,
            tags: vec!["image".to_string(), "sdxl".to_string()],
        },
        ModelSpec {
            model_id: "realesrgan-x4".to_string(),
            name: "RealESRGAN x4plus".to_string(),
            description: "四倍超分辨率模型".to_string(),
            download_url: "https://github.com/xinntao/Real-ESRGAN/releases/download/v0.1.0/RealESRGAN_x4plus.pth".to_string(),
            filename: "RealESRGAN_x4plus.pth".to_string(),
            model_type: "upscale_models".to_string(),
            size_gb: 0.07,
            tags: vec!["upscale".to_string()],
        },
    ]
}

fn echo_tool() -> ToolHandler {
    ToolHandler::sync(|args, _| Ok(json!({"echo": args})))
}

/// 分步生成，演示进度上报与协作式取消
fn slow_generate_tool() -> ToolHandler {
    ToolHandler::suspending(|args: Value, ctx: TaskContext| async move {
        let prompt = args
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or("untitled")
            .to_string();
        let steps = args.get("steps").and_then(Value::as_u64).unwrap_or(5).max(1);
        let delay = Duration::from_millis(args.get("delay_ms").and_then(Value::as_u64).unwrap_or(200));

        for step in 1..=steps {
            tokio::select! {
                _ = ctx.cancelled() => anyhow::bail!("生成已取消"),
                _ = tokio::time::sleep(delay) => {}
            }
            ctx.report_progress(step as f64 / steps as f64, format!("step {step}/{steps}"));
        }
        Ok(json!({"prompt": prompt, "images": [format!("{}.png", prompt.replace(' ', "_"))]}))
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 解析命令行参数
    let args = cli::Cli::parse();

    let config = PluginConfig::from_env()
        .with_plugin_id(args.plugin_id.clone())
        .with_data_root(args.data_dir.clone());

    // 初始化日志，guard 需要持有到进程退出
    let _log_guard = init_tracing(&args.log_level, &config.plugin_id, config.log_dir.as_deref());
    debug!("插件配置: {:?}", config);

    let paths = config
        .data_paths()
        .ensure_dirs()
        .await
        .context("创建插件数据目录失败")?;
    info!("插件数据目录: {}", paths.data_dir().display());

    let manifest = load_manifest(&args.manifest).await;
    let declared = manifest_tools(&manifest);

    let facade = HostDownloadFacade::new(&config.host_url()).context("无效的宿主地址")?;
    let store = Arc::new(DownloadTaskStore::new(paths.download_tasks_file()));
    let manager = Arc::new(ModelManager::new(
        MODEL_NAMESPACE,
        demo_catalog(),
        paths.models_dir(),
        Arc::new(facade),
        store,
    ));

    PrettyLogger::model_table(&manager.list_models().await);

    let router = McpRouter::builder()
        .manifest_tools(declared)
        .tool("echo", echo_tool())
        .tool("slow_generate", slow_generate_tool())
        .tools(model_tools(manager))
        .async_tasks(!args.no_async_tasks)
        .build();
    log_info!("已注册 {} 个工具", router.definitions().len());
    if args.no_async_tasks {
        PrettyLogger::warning("异步任务已关闭，只接受 tools/call");
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("无效的监听地址 {}:{}", args.host, args.port))?;

    PrettyLogger::title(&config.plugin_id);
    let info = PluginInfo {
        plugin_id: config.plugin_id.clone(),
        host_port: config.host_port,
    };
    PluginServer::new(router, info).run(addr).await
}

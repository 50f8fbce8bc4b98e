use std::net::SocketAddr;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::error::RouterError;
use super::protocol::{INTERNAL_ERROR, JsonRpcRequest, JsonRpcResponse};
use super::router::McpRouter;
use crate::common::logger::PrettyLogger;

/// `/api/info` 返回的插件信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginInfo {
    pub plugin_id: String,
    pub host_port: u16,
}

#[derive(Clone)]
struct AppState {
    router: McpRouter,
    info: PluginInfo,
}

/// 构建插件的 HTTP 应用
///
/// - `POST /mcp`      JSON-RPC 入口
/// - `GET /api/health`
/// - `GET /api/info`
pub fn build_app(router: McpRouter, info: PluginInfo) -> Router {
    Router::new()
        .route("/mcp", post(mcp_rpc))
        .route("/api/health", get(health))
        .route("/api/info", get(plugin_info))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { router, info })
}

async fn mcp_rpc(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<JsonRpcResponse>) {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err((id, e)) => {
            warn!("无效的 JSON-RPC 请求: {}", e);
            return (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, e.code(), e.to_string())),
            );
        }
    };

    let response = state.router.handle(request).await;
    // tools/call 中处理器异常没有任务可挂载，按传输层错误返回
    let status = if response.error_code() == Some(INTERNAL_ERROR) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(response))
}

/// 先按普通 JSON 解析，再转换为请求，两步失败分别对应不同的错误码
fn parse_request(body: &[u8]) -> Result<JsonRpcRequest, (Value, RouterError)> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| (Value::Null, RouterError::Parse(e.to_string())))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| (id, RouterError::InvalidRequest(e.to_string())))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn plugin_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "plugin_id": state.info.plugin_id,
        "host_port": state.info.host_port,
        "tools": state.router.definitions().len(),
    }))
}

/// 插件 HTTP 服务
pub struct PluginServer {
    router: McpRouter,
    info: PluginInfo,
}

impl PluginServer {
    pub fn new(router: McpRouter, info: PluginInfo) -> Self {
        Self { router, info }
    }

    /// 监听地址并运行，收到 Ctrl-C 后优雅退出
    pub async fn run(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("插件 {} 已启动，监听 {}", self.info.plugin_id, local);
        PrettyLogger::ready_handshake();

        let app = build_app(self.router, self.info);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        info!("插件服务已停止");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("无法监听退出信号: {}", e);
        std::future::pending::<()>().await;
    }
}

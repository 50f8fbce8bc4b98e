use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use dawnchat_plugin::mcp::protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, TASK_NOT_FOUND,
};
use dawnchat_plugin::mcp::{
    McpRouter, PluginInfo, TaskContext, TaskEvent, TaskSnapshot, ToolDefinition, ToolHandler,
    build_app, report_progress,
};
use dawnchat_plugin::normalize_tool_result;

/// 生成图片的模拟工具：等待、上报 0.4、再等待、返回结果
fn image_tool() -> ToolHandler {
    ToolHandler::suspending(|_, ctx: TaskContext| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.report_progress(0.4, "generating");
        tokio::time::sleep(Duration::from_millis(60)).await;
        Ok(json!({"images": ["sky.png"]}))
    })
}

fn test_router() -> McpRouter {
    McpRouter::builder()
        .tool("generate_image", image_tool())
        .tool("echo", ToolHandler::sync(|args, _| Ok(json!({"echo": args}))))
        .build()
}

async fn post_raw(router: &McpRouter, body: String) -> (StatusCode, Value) {
    let app = build_app(router.clone(), PluginInfo::default());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn rpc(router: &McpRouter, method: &str, params: Value) -> Value {
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
    post_raw(router, body.to_string()).await.1
}

async fn wait_terminal(router: &McpRouter, task_id: &str) -> Value {
    for _ in 0..200 {
        let response = rpc(router, "tasks/get", json!({"task_id": task_id})).await;
        let status = response["result"]["status"].as_str().unwrap_or_default();
        if matches!(status, "completed" | "failed" | "cancelled") {
            return response["result"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not finish");
}

#[tokio::test]
async fn submit_then_poll_until_completed() {
    let router = test_router();

    let submitted = rpc(&router, "tools/submit", json!({"name": "generate_image", "arguments": {"prompt": "sky"}})).await;
    assert_eq!(submitted["result"]["status"], "accepted");
    let task_id = submitted["result"]["task_id"].as_str().unwrap().to_string();

    let first = rpc(&router, "tasks/get", json!({"task_id": task_id})).await;
    let status = first["result"]["status"].as_str().unwrap();
    assert!(matches!(status, "accepted" | "running"), "unexpected status {status}");

    // 处理器上报 0.4 之后、返回之前的中间状态
    let mut midway = None;
    for _ in 0..200 {
        let polled = rpc(&router, "tasks/get", json!({"task_id": task_id})).await;
        if polled["result"]["progress_message"] == "generating" {
            midway = Some(polled["result"].clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let midway = midway.expect("never observed the generating step");
    assert_eq!(midway["status"], "running");
    assert_eq!(midway["progress"], 0.4);
    assert!(midway["result"].is_null());

    let done = wait_terminal(&router, &task_id).await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["progress"], 1.0);
    assert!(done["error"].is_null());
    assert!(done["completed_at"].is_string());

    let result = normalize_tool_result(&done["result"]);
    assert_eq!(result["code"], 200);
    assert_eq!(result["data"], json!({"images": ["sky.png"]}));
}

#[tokio::test]
async fn concurrent_tasks_report_progress_independently() {
    let gate = CancellationToken::new();
    let release = gate.clone();
    let router = McpRouter::builder()
        .tool(
            "stage",
            ToolHandler::suspending(move |args: Value, ctx: TaskContext| {
                let gate = gate.clone();
                async move {
                    let p = args["p"].as_f64().unwrap_or(0.0);
                    ctx.report_progress(p, format!("at {p}"));
                    gate.cancelled().await;
                    Ok(json!({"p": p}))
                }
            }),
        )
        .build();

    let a = rpc(&router, "tools/submit", json!({"name": "stage", "arguments": {"p": 0.2}})).await;
    let b = rpc(&router, "tools/submit", json!({"name": "stage", "arguments": {"p": 0.7}})).await;
    let a_id = a["result"]["task_id"].as_str().unwrap().to_string();
    let b_id = b["result"]["task_id"].as_str().unwrap().to_string();
    assert_ne!(a_id, b_id);

    // 等两个任务都上报过进度
    for _ in 0..200 {
        let a_snap = router.get_task(&a_id).unwrap();
        let b_snap = router.get_task(&b_id).unwrap();
        if a_snap.progress_message.starts_with("at") && b_snap.progress_message.starts_with("at") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let a_snap = router.get_task(&a_id).unwrap();
    let b_snap = router.get_task(&b_id).unwrap();
    assert_eq!(a_snap.progress, 0.2);
    assert_eq!(b_snap.progress, 0.7);
    assert_eq!(a_snap.progress_message, "at 0.2");
    assert_eq!(b_snap.progress_message, "at 0.7");

    release.cancel();
    wait_terminal(&router, &a_id).await;
    wait_terminal(&router, &b_id).await;
}

#[tokio::test]
async fn unknown_tool_and_unknown_task_are_distinct() {
    let router = test_router();

    let submitted = rpc(&router, "tools/submit", json!({"name": "missing_tool"})).await;
    assert!(submitted.get("error").is_none());
    assert_eq!(submitted["result"]["status"], "failed");
    assert!(submitted["result"]["task_id"].is_null());
    assert!(
        submitted["result"]["error"]
            .as_str()
            .unwrap()
            .contains("missing_tool")
    );

    let polled = rpc(&router, "tasks/get", json!({"task_id": "deadbeef"})).await;
    assert!(polled.get("result").is_none());
    assert_eq!(polled["error"]["code"], TASK_NOT_FOUND);

    let called = rpc(&router, "tools/call", json!({"name": "missing_tool"})).await;
    let normalized = normalize_tool_result(&called["result"]);
    assert_eq!(normalized["code"], 404);
}

#[tokio::test]
async fn failing_and_panicking_callbacks_do_not_change_outcome() {
    let seen: Arc<Mutex<Vec<TaskEvent>>> = Arc::default();
    let recorder = seen.clone();
    let router = McpRouter::builder()
        .tool("generate_image", image_tool())
        .hook(|_: TaskEvent, _: &TaskSnapshot| -> anyhow::Result<()> {
            anyhow::bail!("dashboard unreachable")
        })
        .hook(|event: TaskEvent, _: &TaskSnapshot| -> anyhow::Result<()> {
            if event == TaskEvent::Progress {
                panic!("observer bug");
            }
            Ok(())
        })
        .hook(move |event: TaskEvent, _: &TaskSnapshot| -> anyhow::Result<()> {
            recorder.lock().unwrap().push(event);
            Ok(())
        })
        .build();

    let submitted = rpc(&router, "tools/submit", json!({"name": "generate_image"})).await;
    let task_id = submitted["result"]["task_id"].as_str().unwrap().to_string();
    let done = wait_terminal(&router, &task_id).await;
    assert_eq!(done["status"], "completed");

    // 终态先写入记录，回调随后触发
    for _ in 0..100 {
        if seen.lock().unwrap().len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let events = seen.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![TaskEvent::Started, TaskEvent::Progress, TaskEvent::Completed]
    );
}

#[tokio::test]
async fn handler_error_marks_task_failed() {
    let router = McpRouter::builder()
        .tool(
            "broken",
            ToolHandler::suspending(|_, _| async move {
                Err::<Value, _>(anyhow::anyhow!("gpu out of memory"))
            }),
        )
        .build();

    let submitted = rpc(&router, "tools/submit", json!({"name": "broken"})).await;
    let task_id = submitted["result"]["task_id"].as_str().unwrap().to_string();
    let done = wait_terminal(&router, &task_id).await;
    assert_eq!(done["status"], "failed");
    assert!(done["error"].as_str().unwrap().contains("gpu out of memory"));
    assert!(done["result"].is_null());
}

#[tokio::test]
async fn cancel_stops_progress_and_stays_cancelled() {
    let router = McpRouter::builder()
        .tool(
            "forever",
            ToolHandler::suspending(|_, ctx: TaskContext| async move {
                let mut step = 0u32;
                while !ctx.is_cancelled() {
                    step += 1;
                    ctx.report_progress(0.5, format!("working {step}"));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(Value::Null)
            }),
        )
        .build();

    let submitted = rpc(&router, "tools/submit", json!({"name": "forever"})).await;
    let task_id = submitted["result"]["task_id"].as_str().unwrap().to_string();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancelled = rpc(&router, "tasks/cancel", json!({"task_id": task_id})).await;
    assert_eq!(cancelled["result"]["cancelled"], true);

    let snap = router.get_task(&task_id).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let later = router.get_task(&task_id).unwrap();
    assert_eq!(later.status.as_str(), "cancelled");
    assert_eq!(later.progress, snap.progress);
    assert_eq!(later.progress_message, snap.progress_message);

    let again = rpc(&router, "tasks/cancel", json!({"task_id": task_id})).await;
    assert_eq!(again["result"]["cancelled"], false);
    assert_eq!(again["result"]["status"], "cancelled");

    let unknown = rpc(&router, "tasks/cancel", json!({"task_id": "nope"})).await;
    assert_eq!(unknown["error"]["code"], TASK_NOT_FOUND);
}

#[tokio::test]
async fn protocol_errors_use_standard_codes() {
    let router = test_router();

    let wrong_version = json!({"jsonrpc": "1.0", "id": 7, "method": "ping"});
    let (_, response) = post_raw(&router, wrong_version.to_string()).await;
    assert_eq!(response["error"]["code"], INVALID_REQUEST);
    assert_eq!(response["id"], 7);

    let response = rpc(&router, "tools/frobnicate", json!({})).await;
    assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);

    let (status, response) = post_raw(&router, "{not json".to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["error"]["code"], PARSE_ERROR);
    assert!(response["id"].is_null());

    let response = rpc(&router, "tools/call", json!({"name": "echo", "arguments": [1, 2]})).await;
    assert_eq!(response["error"]["code"], INVALID_PARAMS);

    let response = rpc(&router, "tasks/get", json!({})).await;
    assert_eq!(response["error"]["code"], INVALID_PARAMS);

    let response = rpc(&router, "ping", json!({})).await;
    assert_eq!(response["result"]["status"], "ok");
}

#[tokio::test]
async fn task_methods_hidden_when_async_disabled() {
    let router = McpRouter::builder()
        .tool("echo", ToolHandler::sync(|args, _| Ok(args)))
        .async_tasks(false)
        .build();

    for method in ["tools/submit", "tasks/get", "tasks/cancel"] {
        let response = rpc(&router, method, json!({"name": "echo", "task_id": "x"})).await;
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND, "{method}");
    }

    let listed = rpc(&router, "tools/list", json!({})).await;
    assert!(listed["result"].get("capabilities").is_none());

    let called = rpc(&router, "tools/call", json!({"name": "echo", "arguments": {"a": 1}})).await;
    assert_eq!(normalize_tool_result(&called["result"])["data"], json!({"a": 1}));
}

#[tokio::test]
async fn tools_list_only_shows_tools_with_handlers() {
    let declared = vec![
        ToolDefinition::new("echo", "Echo arguments back", json!({"type": "object"})),
        ToolDefinition::new("declared_only", "No handler", json!({"type": "object"})),
    ];
    let router = McpRouter::builder()
        .manifest_tools(declared)
        .tool("echo", ToolHandler::sync(|args, _| Ok(args)))
        .tool("generate_image", image_tool())
        .build();

    let listed = rpc(&router, "tools/list", json!({})).await;
    let tools = listed["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["echo", "generate_image"]);
    assert_eq!(tools[0]["description"], "Echo arguments back");
    assert_eq!(tools[1]["description"], "Tool generate_image");
    assert_eq!(listed["result"]["capabilities"]["async"], true);
}

#[tokio::test]
async fn tools_call_handler_failure_is_internal_error() {
    let router = McpRouter::builder()
        .tool(
            "explode",
            ToolHandler::sync(|_, _| Err(anyhow::anyhow!("disk full"))),
        )
        .build();

    let body = json!({"jsonrpc": "2.0", "id": "c1", "method": "tools/call", "params": {"name": "explode"}});
    let (status, response) = post_raw(&router, body.to_string()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response["error"]["code"], INTERNAL_ERROR);
    assert!(response["error"]["message"].as_str().unwrap().contains("disk full"));
    assert_eq!(response["id"], "c1");
}

#[tokio::test]
async fn ambient_progress_resolves_to_running_task() {
    let router = McpRouter::builder()
        .tool(
            "sync_steps",
            ToolHandler::sync(|_, _| {
                report_progress(30.0, "thirty percent");
                std::thread::sleep(Duration::from_millis(80));
                Ok(json!({"done": true}))
            }),
        )
        .tool(
            "async_steps",
            ToolHandler::suspending(|_, _| async move {
                report_progress(0.6, "sixty");
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(json!({"done": true}))
            }),
        )
        .build();

    for (tool, expected, message) in [("sync_steps", 0.3, "thirty percent"), ("async_steps", 0.6, "sixty")] {
        let submitted = rpc(&router, "tools/submit", json!({"name": tool})).await;
        let task_id = submitted["result"]["task_id"].as_str().unwrap().to_string();

        let mut observed = None;
        for _ in 0..100 {
            let snap = router.get_task(&task_id).unwrap();
            if snap.progress_message == message {
                observed = Some(snap.progress);
                break;
            }
            if snap.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(observed, Some(expected), "{tool}");
        assert_eq!(wait_terminal(&router, &task_id).await["status"], "completed");
    }

    // 不在任务中调用时直接忽略
    report_progress(0.5, "outside");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_keep_ambient_progress_apart() {
    let gate = CancellationToken::new();
    let async_gate = gate.clone();
    let sync_gate = gate.clone();
    let router = McpRouter::builder()
        .tool(
            "ambient_async",
            ToolHandler::suspending(move |args: Value, _| {
                let gate = async_gate.clone();
                async move {
                    let p = args["p"].as_f64().unwrap_or(0.0);
                    report_progress(p, format!("at {p}"));
                    gate.cancelled().await;
                    Ok(json!({"p": p}))
                }
            }),
        )
        .tool(
            "ambient_sync",
            ToolHandler::sync(move |args, _| {
                let p = args["p"].as_f64().unwrap_or(0.0);
                report_progress(p, format!("at {p}"));
                while !sync_gate.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(json!({"p": p}))
            }),
        )
        .build();

    let mut expected = Vec::new();
    for (tool, p) in [
        ("ambient_async", 0.2),
        ("ambient_async", 0.5),
        ("ambient_sync", 0.7),
        ("ambient_sync", 0.9),
    ] {
        let submitted = rpc(&router, "tools/submit", json!({"name": tool, "arguments": {"p": p}})).await;
        let task_id = submitted["result"]["task_id"].as_str().unwrap().to_string();
        expected.push((task_id, p));
    }

    for _ in 0..400 {
        let all_reported = expected.iter().all(|(id, _)| {
            router
                .get_task(id)
                .is_ok_and(|snap| snap.progress_message.starts_with("at"))
        });
        if all_reported {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for (task_id, p) in &expected {
        let snap = router.get_task(task_id).unwrap();
        assert_eq!(snap.status.as_str(), "running", "{task_id}");
        assert_eq!(snap.progress, *p, "{task_id}");
        assert_eq!(snap.progress_message, format!("at {p}"));
    }

    gate.cancel();
    for (task_id, _) in &expected {
        assert_eq!(wait_terminal(&router, task_id).await["status"], "completed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_while_pruning() {
    let router = McpRouter::builder()
        .tool("noop", ToolHandler::suspending(|_, _| async move { Ok(Value::Null) }))
        .task_retention(Duration::ZERO)
        .build();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let router = router.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..500 {
                let accepted = router.submit_tool("noop", json!({}));
                assert_eq!(accepted["status"], "accepted");
                tokio::task::yield_now().await;
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    // HTTP 入口在大量清理之后依然返回完整的响应
    let response = rpc(&router, "tools/submit", json!({"name": "noop"})).await;
    assert_eq!(response["result"]["status"], "accepted");
}

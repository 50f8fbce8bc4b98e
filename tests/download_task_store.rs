use std::sync::Arc;

use dawnchat_plugin::DownloadTaskStore;
use dawnchat_plugin::common::config::PluginDataPaths;

fn store_in(dir: &tempfile::TempDir) -> DownloadTaskStore {
    let paths = PluginDataPaths::new("com.dawnchat.test", dir.path());
    DownloadTaskStore::new(paths.download_tasks_file())
}

#[tokio::test]
async fn set_overwrites_previous_task() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);

    assert!(store.load().await.is_empty());
    store.set("sdxl-base", "task-1").await.unwrap();
    store.set("sdxl-base", "task-2").await.unwrap();

    let mapping = store.load().await;
    assert_eq!(mapping.len(), 1);
    assert_eq!(store.get("sdxl-base").await.as_deref(), Some("task-2"));
}

#[tokio::test]
async fn remove_deletes_only_that_model() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);

    store.set("a", "t-a").await.unwrap();
    store.set("b", "t-b").await.unwrap();
    assert_eq!(store.remove("a").await.unwrap().as_deref(), Some("t-a"));
    assert_eq!(store.remove("a").await.unwrap(), None);

    assert_eq!(store.get("a").await, None);
    assert_eq!(store.get("b").await.as_deref(), Some("t-b"));
}

#[tokio::test]
async fn upsert_many_merges_observed_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    store.set("a", "old").await.unwrap();
    store.set("b", "keep").await.unwrap();

    let changed = store
        .upsert_many([("a", "new"), ("b", "keep"), ("c", "fresh")])
        .await
        .unwrap();
    assert_eq!(changed, 2);

    let mapping = store.load().await;
    assert_eq!(mapping.get("a").map(String::as_str), Some("new"));
    assert_eq!(mapping.get("b").map(String::as_str), Some("keep"));
    assert_eq!(mapping.get("c").map(String::as_str), Some("fresh"));

    let none: Vec<(String, String)> = Vec::new();
    assert_eq!(store.upsert_many(none).await.unwrap(), 0);
}

#[tokio::test]
async fn mapping_survives_new_store_instance() {
    let dir = tempfile::tempdir().unwrap();
    store_in(&dir).set("sdxl-base", "demo_sdxl-base").await.unwrap();

    let reopened = store_in(&dir);
    assert_eq!(
        reopened.get("sdxl-base").await.as_deref(),
        Some("demo_sdxl-base")
    );
    // 写入完成后不留临时文件
    let tmp = reopened.file_path().with_extension("json.tmp");
    assert!(!tmp.exists());
}

#[tokio::test]
async fn corrupt_file_reads_as_empty_and_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);
    tokio::fs::create_dir_all(store.file_path().parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(store.file_path(), b"{ not json").await.unwrap();

    assert!(store.load().await.is_empty());
    assert_eq!(store.get("anything").await, None);

    store.set("a", "t").await.unwrap();
    let raw = tokio::fs::read_to_string(store.file_path()).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed, serde_json::json!({"a": "t"}));
}

#[tokio::test]
async fn concurrent_writes_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(store_in(&dir));

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .set(&format!("model-{i}"), &format!("task-{i}"))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mapping = store.load().await;
    assert_eq!(mapping.len(), 20);
    assert_eq!(mapping.get("model-7").map(String::as_str), Some("task-7"));
}

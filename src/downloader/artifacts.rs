use std::path::{Path, PathBuf};

use super::models::DownloadTask;

/// 下载器在未完成时留下的临时文件后缀
const TEMP_SUFFIXES: [&str; 3] = [".downloading", ".partial", ".tmp"];

fn task_is_non_complete(task: Option<&DownloadTask>) -> bool {
    task.is_some_and(|t| t.status.is_non_complete())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

async fn has_temp_companion(file_path: &Path) -> bool {
    for suffix in TEMP_SUFFIXES {
        if tokio::fs::try_exists(with_suffix(file_path, suffix))
            .await
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// 单文件模型是否已完整安装
pub async fn is_single_file_installed(
    file_path: &Path,
    task: Option<&DownloadTask>,
    min_size_bytes: u64,
) -> bool {
    if task_is_non_complete(task) {
        return false;
    }
    let Ok(meta) = tokio::fs::metadata(file_path).await else {
        return false;
    };
    if !meta.is_file() || has_temp_companion(file_path).await {
        return false;
    }
    meta.len() >= min_size_bytes
}

/// 仓库型模型（目录）是否已完整安装
pub async fn is_repo_installed(
    repo_dir: &Path,
    task: Option<&DownloadTask>,
    required_entries: &[&str],
) -> bool {
    if task_is_non_complete(task) {
        return false;
    }
    match tokio::fs::metadata(repo_dir).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return false,
    }

    // 遍历目录，空目录或残留临时文件都视为未安装
    let mut stack = vec![repo_dir.to_path_buf()];
    let mut seen_any = false;
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return false;
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(_) => return false,
            };
            seen_any = true;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if TEMP_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                return false;
            }
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(path);
            }
        }
    }
    if !seen_any {
        return false;
    }

    for rel in required_entries {
        if !tokio::fs::try_exists(repo_dir.join(rel)).await.unwrap_or(false) {
            return false;
        }
    }
    true
}

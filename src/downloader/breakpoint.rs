use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::archive::ArchiveCursor;
use super::error::{DownloadError, Result};
use super::task::{Task, TransferProgress};

const BREAKPOINT_EXT: &str = "breakpoint";

fn default_level() -> u32 {
    6
}

/// 断点信息：每个任务一个 JSON 对象
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointInfo {
    pub task_id: String,
    pub downloaded_bytes: u64,
    pub completed_count: u32,
    pub failed_count: u32,
    pub current_file_index: usize,
    pub current_file_offset: u64,

    // 以下字段用于进程重启后重建任务
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub file_paths: Vec<PathBuf>,
    #[serde(default)]
    pub direct_download: bool,
    #[serde(default = "default_level")]
    pub compression_level: u32,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub archive: Option<ArchiveCursor>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl BreakpointInfo {
    pub fn new(task: &Task, cursor: &TransferProgress, archive: Option<ArchiveCursor>) -> Self {
        Self {
            task_id: task.task_id.clone(),
            downloaded_bytes: cursor.downloaded_bytes,
            completed_count: cursor.completed_count,
            failed_count: cursor.failed_count,
            current_file_index: cursor.current_file_index,
            current_file_offset: cursor.current_file_offset,
            user_id: task.user_id.clone(),
            file_paths: task.file_paths.clone(),
            direct_download: task.direct_download,
            compression_level: task.compression_level,
            total_bytes: task.total_bytes,
            archive,
            updated_at: Utc::now(),
        }
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            downloaded_bytes: self.downloaded_bytes,
            completed_count: self.completed_count,
            failed_count: self.failed_count,
            current_file_index: self.current_file_index,
            current_file_offset: self.current_file_offset,
        }
    }
}

/// 断点的持久化介质
#[async_trait]
pub trait BreakpointBackend: Send + Sync {
    async fn write(&self, task_id: &str, data: &[u8]) -> io::Result<()>;
    async fn read(&self, task_id: &str) -> io::Result<Option<Vec<u8>>>;
    async fn remove(&self, task_id: &str) -> io::Result<()>;
    async fn keys(&self) -> io::Result<Vec<String>>;
}

/// 目录下每个任务一个 {taskId}.breakpoint 文件
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, task_id: &str) -> io::Result<PathBuf> {
        let valid = !task_id.is_empty()
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("非法的任务ID: {task_id}"),
            ));
        }
        Ok(self.dir.join(format!("{task_id}.{BREAKPOINT_EXT}")))
    }
}

#[async_trait]
impl BreakpointBackend for FileBackend {
    async fn write(&self, task_id: &str, data: &[u8]) -> io::Result<()> {
        let path = self.path_for(task_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // 先写临时文件再重命名，避免写到一半崩溃留下残缺断点
        let tmp_path = path.with_extension("breakpoint.tmp");
        tokio::fs::write(&tmp_path, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }

    async fn read(&self, task_id: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(task_id)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, task_id: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(task_id)?).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn keys(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BREAKPOINT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// 断点存储：内存镜像 + 持久化介质
pub struct BreakpointStore {
    memory: DashMap<String, BreakpointInfo>,
    backend: Arc<dyn BreakpointBackend>,
}

impl BreakpointStore {
    pub fn new(backend: Arc<dyn BreakpointBackend>) -> Self {
        Self {
            memory: DashMap::new(),
            backend,
        }
    }

    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(FileBackend::new(dir)))
    }

    /// 同步写入持久化介质后再更新内存镜像
    pub async fn put(&self, info: BreakpointInfo) -> Result<()> {
        let data = serde_json::to_vec(&info)?;
        self.backend
            .write(&info.task_id, &data)
            .await
            .map_err(|e| {
                error!("保存断点信息失败：{}，{}", info.task_id, e);
                DownloadError::Io(e)
            })?;
        debug!(
            "断点已保存：{}，文件 {}，偏移 {}，已下载 {} 字节",
            info.task_id, info.current_file_index, info.current_file_offset, info.downloaded_bytes
        );
        self.memory.insert(info.task_id.clone(), info);
        Ok(())
    }

    /// 先查内存，再查持久化介质；损坏的断点视为不存在并删除
    pub async fn get(&self, task_id: &str) -> Option<BreakpointInfo> {
        if let Some(info) = self.memory.get(task_id) {
            return Some(info.clone());
        }

        let data = match self.backend.read(task_id).await {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                warn!("读取断点文件失败：{}，{}", task_id, e);
                return None;
            }
        };

        match serde_json::from_slice::<BreakpointInfo>(&data) {
            Ok(info) if info.task_id == task_id => {
                self.memory.insert(task_id.to_string(), info.clone());
                Some(info)
            }
            Ok(info) => {
                warn!("断点文件任务ID不匹配：{} != {}，已删除", info.task_id, task_id);
                let _ = self.backend.remove(task_id).await;
                None
            }
            Err(e) => {
                error!("加载断点信息失败：{}，{}，已删除损坏的断点", task_id, e);
                let _ = self.backend.remove(task_id).await;
                None
            }
        }
    }

    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.memory.remove(task_id);
        if let Err(e) = self.backend.remove(task_id).await {
            warn!("删除断点文件失败：{}，{}", task_id, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// 所有可读的持久化断点（用于启动时恢复任务）
    pub async fn list(&self) -> Vec<BreakpointInfo> {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("列出断点文件失败：{}", e);
                return Vec::new();
            }
        };
        let mut infos = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(info) = self.get(&key).await {
                infos.push(info);
            }
        }
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(task_id: &str) -> BreakpointInfo {
        let task = Task::new(
            task_id.to_string(),
            "u1".into(),
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")],
            false,
            6,
        );
        let cursor = TransferProgress {
            downloaded_bytes: 1_500_000,
            completed_count: 2,
            failed_count: 0,
            current_file_index: 2,
            current_file_offset: 1_000_000,
        };
        BreakpointInfo::new(&task, &cursor, None)
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let dir = TempDir::new().unwrap();
        let store = BreakpointStore::with_dir(dir.path());
        store.put(sample("task-1")).await.unwrap();

        // 新的实例只能从文件读取
        let reopened = BreakpointStore::with_dir(dir.path());
        let info = reopened.get("task-1").await.unwrap();
        assert_eq!(info.current_file_index, 2);
        assert_eq!(info.current_file_offset, 1_000_000);
        assert_eq!(info.file_paths.len(), 3);
        assert!(dir.path().join("task-1.breakpoint").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_absent_and_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.breakpoint");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = BreakpointStore::with_dir(dir.path());
        assert!(store.get("broken").await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_minimal_json_still_parses() {
        let dir = TempDir::new().unwrap();
        let json = r#"{"taskId":"old","downloadedBytes":10,"completedCount":0,"failedCount":0,"currentFileIndex":0,"currentFileOffset":10}"#;
        tokio::fs::write(dir.path().join("old.breakpoint"), json).await.unwrap();

        let store = BreakpointStore::with_dir(dir.path());
        let info = store.get("old").await.unwrap();
        assert_eq!(info.current_file_offset, 10);
        assert_eq!(info.compression_level, 6);
        assert!(info.archive.is_none());
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let dir = TempDir::new().unwrap();
        let store = BreakpointStore::with_dir(dir.path());
        store.put(sample("a")).await.unwrap();
        store.put(sample("b")).await.unwrap();
        assert_eq!(store.list().await.len(), 2);

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.is_none());
        let remaining: Vec<_> = store.list().await.into_iter().map(|i| i.task_id).collect();
        assert_eq!(remaining, vec!["b".to_string()]);

        // 删除不存在的断点不是错误
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_like_task_id() {
        let dir = TempDir::new().unwrap();
        let store = BreakpointStore::with_dir(dir.path());
        assert!(store.put(sample("../escape")).await.is_err());
        assert!(store.get("../escape").await.is_none());
    }
}

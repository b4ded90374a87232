use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::DuplexStream;

use super::error::DownloadError;

/// 提交下载的请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub file_paths: Vec<PathBuf>,
    pub user_id: String,
    #[serde(default)]
    pub direct_download: bool,
    #[serde(default)]
    pub compression_level: Option<i32>,
}

/// 对外接口统一的 {code, message} 结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: 200,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn with_task(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::ok(message)
        }
    }

    pub fn from_error(e: &DownloadError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            task_id: None,
        }
    }
}

/// 直传模式交给调用方的响应流
pub struct DirectStream {
    pub task_id: String,
    pub reader: DuplexStream,
    pub file_name: String,
    pub content_type: &'static str,
    /// 单文件：(起始偏移, 文件大小)，起始偏移大于 0 时应返回 206
    pub range: Option<(u64, u64)>,
    /// 压缩包：本次输出在完整压缩包中的起始位置
    pub resume_offset: u64,
}

impl std::fmt::Debug for DirectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectStream")
            .field("task_id", &self.task_id)
            .field("file_name", &self.file_name)
            .field("range", &self.range)
            .field("resume_offset", &self.resume_offset)
            .finish()
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// 服务器存储：返回任务ID供后续查询
    Stored { task_id: String },
    Direct(DirectStream),
}

impl SubmitOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            SubmitOutcome::Stored { task_id } => task_id,
            SubmitOutcome::Direct(stream) => &stream.task_id,
        }
    }
}

#[derive(Debug)]
pub enum ResumeOutcome {
    AlreadyRunning,
    Resumed(SubmitOutcome),
}

/// 服务器上已完成的输出文件
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size: u64,
    pub file_name: String,
    pub content_type: &'static str,
}

pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("zip") => "application/zip",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// 解析 `bytes=N-` 形式的 Range 头，只取起始位置
pub fn parse_range_start(header: &str) -> Option<u64> {
    let range = header.trim().strip_prefix("bytes=")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

pub fn content_range(start: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, size.saturating_sub(1), size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_start() {
        assert_eq!(parse_range_start("bytes=1000-"), Some(1000));
        assert_eq!(parse_range_start("bytes=0-499"), Some(0));
        assert_eq!(parse_range_start("bytes=-500"), None);
        assert_eq!(parse_range_start("items=1-"), None);
    }

    #[test]
    fn test_content_range() {
        assert_eq!(content_range(1000, 5000), "bytes 1000-4999/5000");
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime(Path::new("/a/B.ZIP")), "application/zip");
        assert_eq!(guess_mime(Path::new("/a/photo.jpeg")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("/a/data")), "application/octet-stream");
    }

    #[test]
    fn test_request_defaults() {
        let request: DownloadRequest =
            serde_json::from_str(r#"{"filePaths": ["/a"], "userId": "u1"}"#).unwrap();
        assert!(!request.direct_download);
        assert!(request.compression_level.is_none());
    }
}

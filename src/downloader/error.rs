use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("参数无效: {0}")]
    InvalidArgument(String),

    #[error("任务未找到: {0}")]
    TaskNotFound(String),

    #[error("文件不存在: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("磁盘剩余空间不足: {}（剩余 {available} 字节，需要 ≥{required} 字节）", path.display())]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("无权限操作该任务: {0}")]
    Unauthorized(String),

    #[error("无效的状态: {0}")]
    InvalidState(String),

    #[error("请求范围无效: 起始位置 {start} 超出文件大小 {size}")]
    RangeNotSatisfiable { start: u64, size: u64 },

    // 单个文件读写失败，只计入失败数，不中断整个任务
    #[error("文件读写失败: {path}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // 目录/目标不可用，整个任务失败
    #[error("目标不可用: {0}")]
    FatalIo(String),

    #[error("压缩包超出限制: {0}")]
    ArchiveLimit(String),

    #[error("线程池已关闭")]
    PoolClosed,

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DownloadError {
    /// 对外接口使用的结果码
    pub fn code(&self) -> u16 {
        match self {
            DownloadError::InvalidArgument(_) => 400,
            DownloadError::Unauthorized(_) => 401,
            DownloadError::TaskNotFound(_) | DownloadError::FileNotFound(_) => 404,
            DownloadError::InvalidState(_) => 409,
            DownloadError::RangeNotSatisfiable { .. } => 416,
            DownloadError::InsufficientSpace { .. } => 507,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

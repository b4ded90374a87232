use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Sizing,
    Transferring,
    Completed,
    Cancelled,
    Failed,
    Interrupted, // 客户端断开或进程重启，可恢复
}

/// 传输游标：执行器推进、断点保存的那部分进度
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub downloaded_bytes: u64,
    pub completed_count: u32,
    pub failed_count: u32,
    pub current_file_index: usize,
    pub current_file_offset: u64,
}

/// 下载任务（对外可见的状态快照）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub user_id: String,
    pub file_paths: Vec<PathBuf>,
    pub single_file: bool,
    pub direct_download: bool,
    pub compression_level: u32,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub total_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub progress: u8,
    pub current_file_index: usize,
    pub current_file_offset: u64,
    pub finished: bool,
    pub cancelled: bool,
    pub status: TaskStatus,
    pub target_file_path: Option<PathBuf>,
    pub output_bytes: u64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_id: String,
        user_id: String,
        file_paths: Vec<PathBuf>,
        direct_download: bool,
        compression_level: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            user_id,
            single_file: file_paths.len() == 1,
            total_count: file_paths.len() as u32,
            file_paths,
            direct_download,
            compression_level,
            total_bytes: 0,
            downloaded_bytes: 0,
            completed_count: 0,
            failed_count: 0,
            progress: 0,
            current_file_index: 0,
            current_file_offset: 0,
            finished: false,
            cancelled: false,
            status: TaskStatus::Pending,
            target_file_path: None,
            output_bytes: 0,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn cursor(&self) -> TransferProgress {
        TransferProgress {
            downloaded_bytes: self.downloaded_bytes,
            completed_count: self.completed_count,
            failed_count: self.failed_count,
            current_file_index: self.current_file_index,
            current_file_offset: self.current_file_offset,
        }
    }

    /// 同步执行器的进度。任务结束后不再接受任何进度变更。
    pub fn apply_progress(&mut self, cursor: &TransferProgress) -> bool {
        if self.finished {
            return false;
        }
        debug_assert!(cursor.completed_count + cursor.failed_count <= self.total_count);

        self.downloaded_bytes = cursor.downloaded_bytes;
        self.completed_count = cursor.completed_count;
        self.failed_count = cursor.failed_count;
        self.current_file_index = cursor.current_file_index;
        self.current_file_offset = cursor.current_file_offset;
        // 源文件在统计大小之后变大
        if self.total_bytes > 0 && self.downloaded_bytes > self.total_bytes {
            self.total_bytes = self.downloaded_bytes;
        }
        if !self.cancelled {
            self.progress = self.progress.max(self.byte_progress());
        }
        self.updated_at = Utc::now();
        true
    }

    /// 基于字节数的进度（0-100）
    pub fn byte_progress(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let percent = self.downloaded_bytes.saturating_mul(100) / self.total_bytes;
        percent.min(100) as u8
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        if !self.finished {
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    /// 已取消的任务不会再被标记为完成，finished 与 cancelled 互斥
    pub fn mark_completed(&mut self, target: Option<PathBuf>, output_bytes: u64) -> bool {
        if self.finished || self.cancelled {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.finished = true;
        self.target_file_path = target;
        self.output_bytes = output_bytes;
        self.updated_at = Utc::now();
        true
    }

    pub fn mark_cancelled(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.cancelled = true;
        self.status = TaskStatus::Cancelled;
        self.updated_at = Utc::now();
        true
    }

    /// 不可恢复的失败：剩余未完成的文件全部计为失败
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        if self.finished {
            return;
        }
        self.failed_count = self.total_count - self.completed_count;
        self.status = TaskStatus::Failed;
        self.finished = true;
        self.message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_interrupted(&mut self, message: impl Into<String>) {
        if self.finished || self.cancelled {
            return;
        }
        self.status = TaskStatus::Interrupted;
        self.message = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// 已取消或中断的任务重新提交前清除标记
    pub fn reset_for_resume(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.cancelled = false;
        self.status = TaskStatus::Pending;
        self.message = None;
        self.updated_at = Utc::now();
        true
    }

    /// 进度推送在这些状态下停止
    pub fn is_terminal(&self) -> bool {
        self.finished || self.cancelled || self.status == TaskStatus::Interrupted
    }
}

use colored::*;

use crate::downloader::{Task, TaskStatus};

/// 命令行里给人看的输出（与 tracing 日志分开）
pub struct PrettyLogger;

impl PrettyLogger {
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    pub fn error(message: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), message.as_ref());
    }

    /// 显示步骤开始
    pub fn step_start(step: impl AsRef<str>) {
        println!("\n{} {}", "▶".cyan().bold(), step.as_ref().bold());
    }

    pub fn file_info(label: impl AsRef<str>, path: impl AsRef<str>) {
        println!("{} {}: {}", "📁".blue().bold(), label.as_ref().bold(), path.as_ref());
    }

    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    /// 居中标题，两侧用横线补齐
    pub fn title(text: impl AsRef<str>) {
        let text = text.as_ref();
        let width = text.chars().count();
        let left = 48usize.saturating_sub(width) / 2;
        let right = 48usize.saturating_sub(width + left);
        println!(
            "{} {} {}",
            "─".repeat(left).bright_black(),
            text.bold(),
            "─".repeat(right).bright_black()
        );
    }

    /// 任务结束后的汇总
    pub fn task_summary(task: &Task) {
        let headline = match task.status {
            TaskStatus::Completed if task.failed_count == 0 => "🎉 下载完成！".green().bold(),
            TaskStatus::Completed => "⚠ 下载完成，部分文件失败".yellow().bold(),
            TaskStatus::Cancelled => "⏹ 任务已取消".yellow().bold(),
            TaskStatus::Interrupted => "⏸ 任务已中断，可稍后恢复".yellow().bold(),
            _ => "✗ 下载失败".red().bold(),
        };
        println!("\n{}", headline);
        println!("  任务ID: {}", task.task_id);
        println!(
            "  文件: 成功 {} / 失败 {} / 共 {}",
            task.completed_count, task.failed_count, task.total_count
        );
        println!("  已读取: {}", human_bytes(task.downloaded_bytes));
        if task.output_bytes > 0 {
            println!("  输出大小: {}", human_bytes(task.output_bytes));
        }
        if let Some(message) = &task.message {
            println!("  说明: {}", message);
        }
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// 便捷宏用于漂亮的日志输出
#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::success(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::warning(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::error(format!($($arg)*))
    };
}

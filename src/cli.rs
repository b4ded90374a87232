use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// 断点续传的文件下载服务
#[derive(Parser, Debug)]
#[command(name = "packdl")]
#[command(version = "1.0")]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "支持断点续传与流式打包的文件下载服务", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// 配置文件 (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// 服务器存储目录
    #[arg(long, global = true, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub store_dir: Option<PathBuf>,

    /// 断点文件目录
    #[arg(long, global = true, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub breakpoint_dir: Option<PathBuf>,

    /// 限速（字节/秒），0 表示不限速
    #[arg(long, global = true, value_name = "BYTES")]
    #[arg(help = "限速(字节/秒)，同时作用于前端直传和服务器存储，0 表示不限速")]
    pub rate_limit: Option<i64>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 启动 HTTP 服务
    #[cfg(feature = "http")]
    Serve {
        #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:8080")]
        listen: std::net::SocketAddr,
    },

    /// 在本机把文件下载到存储目录（多个文件打包为 zip）
    Run {
        #[arg(required = true, value_name = "FILE")]
        #[arg(value_hint = clap::ValueHint::FilePath)]
        files: Vec<PathBuf>,

        #[arg(long, value_name = "USER", default_value = "local")]
        user: String,

        /// 压缩级别 (0-9)
        #[arg(long, value_name = "LEVEL")]
        level: Option<i32>,
    },

    /// 恢复一个被取消或中断的任务
    Resume {
        #[arg(value_name = "TASK_ID")]
        task_id: String,

        #[arg(long, value_name = "USER", default_value = "local")]
        user: String,
    },

    /// 列出断点目录中可恢复的任务
    List,
}

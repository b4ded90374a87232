use anyhow::{Context, bail};
use clap::Parser;
use colored::Colorize;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use pack_downloader::common::config::ServiceConfig;
use pack_downloader::common::logger::{PrettyLogger, human_bytes};
use pack_downloader::downloader::{DownloadManager, DownloadRequest, ResumeOutcome, SubmitOutcome, Task};
use pack_downloader::{log_error, log_info, log_success, log_warning};

mod cli;

use cli::{Cli, Command};

/// 读取配置文件，再用命令行参数覆盖
async fn build_config(args: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = ServiceConfig::load(args.config.as_deref())
        .await
        .context("读取配置文件失败")?;
    if let Some(dir) = &args.store_dir {
        config.storage.store_dir = dir.clone();
    }
    if let Some(dir) = &args.breakpoint_dir {
        config.storage.breakpoint_dir = dir.clone();
    }
    if let Some(limit) = args.rate_limit {
        config.transfer.rate_limit = limit;
        config.transfer.server_rate_limit = limit;
    }
    debug!("生效配置: {:?}", config);
    Ok(config)
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
    )
    .map(|style| style.progress_chars("#>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// 跟随进度直到任务结束；Ctrl+C 取消任务并保存断点
async fn watch(manager: &DownloadManager, task_id: &str) -> Option<Task> {
    let pb = progress_bar();
    let mut events = manager.subscribe(task_id);
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                if event.code != 200 {
                    break;
                }
                pb.set_length(event.total_bytes);
                pb.set_position(event.downloaded_bytes);
                pb.set_message(format!("成功 {} 失败 {}", event.completed_count, event.failed_count));
            }
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                if signal.is_ok() {
                    pb.println(format!("{} 正在取消，保存断点...", "⏹".yellow()));
                    if let Err(e) = manager.cancel(task_id).await {
                        log_error!("取消失败: {}", e);
                    }
                }
            }
        }
    }
    pb.finish_and_clear();

    // 等执行器写完断点/收尾
    manager.shutdown().await;
    manager.get_task(task_id)
}

fn report(task: Option<Task>) -> anyhow::Result<()> {
    let Some(task) = task else {
        bail!("任务状态丢失");
    };
    PrettyLogger::task_summary(&task);
    if let Some(path) = &task.target_file_path {
        if task.finished {
            PrettyLogger::file_info("输出文件", path.display().to_string());
        }
    }
    if !task.finished {
        log_info!("可以使用 `packdl resume {} --user {}` 继续", task.task_id, task.user_id);
    }
    Ok(())
}

async fn run(config: ServiceConfig, files: Vec<std::path::PathBuf>, user: String, level: Option<i32>) -> anyhow::Result<()> {
    let manager = DownloadManager::new(config);
    PrettyLogger::title("packdl");
    for file in &files {
        PrettyLogger::file_info("源文件", file.display().to_string());
    }

    PrettyLogger::step_start("提交任务");
    let request = DownloadRequest {
        file_paths: files,
        user_id: user,
        direct_download: false,
        compression_level: level,
    };
    let outcome = manager.submit(request, None).await?;
    let task_id = outcome.task_id().to_string();
    if let Some(task) = manager.get_task(&task_id) {
        log_success!("任务 {} 已创建，共 {}", task_id, human_bytes(task.total_bytes));
    }

    report(watch(&manager, &task_id).await)
}

async fn resume(config: ServiceConfig, task_id: String, user: String) -> anyhow::Result<()> {
    let manager = DownloadManager::new(config);
    manager.recover().await;

    let Some(task) = manager.get_task(&task_id) else {
        bail!("没有找到任务 {} 的断点", task_id);
    };
    if task.direct_download {
        bail!("前端直传任务只能通过 HTTP 接口恢复");
    }

    PrettyLogger::step_start(format!("恢复任务 {}（已完成 {}%）", task_id, task.progress));
    match manager.resume(&task_id, &user, None).await? {
        ResumeOutcome::AlreadyRunning => log_warning!("任务已在运行"),
        ResumeOutcome::Resumed(SubmitOutcome::Stored { .. }) => {}
        ResumeOutcome::Resumed(SubmitOutcome::Direct(_)) => bail!("前端直传任务只能通过 HTTP 接口恢复"),
    }
    report(watch(&manager, &task_id).await)
}

async fn list(config: ServiceConfig) -> anyhow::Result<()> {
    let manager = DownloadManager::new(config);
    let count = manager.recover().await;
    if count == 0 {
        log_info!("没有可恢复的任务");
        return Ok(());
    }
    PrettyLogger::title(format!("可恢复的任务 ({})", count));
    for task in manager.list_tasks() {
        println!(
            "{} {:>3}% {} 用户 {} {} 个文件",
            "•".cyan(),
            task.progress,
            task.task_id.bold(),
            task.user_id,
            task.total_count
        );
    }
    PrettyLogger::separator();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    // 初始化日志
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = build_config(&args).await?;
    match args.command {
        #[cfg(feature = "http")]
        Command::Serve { listen } => {
            let manager = std::sync::Arc::new(DownloadManager::new(config));
            let recovered = manager.recover().await;
            info!("启动完成，恢复了 {} 个中断的任务", recovered);
            pack_downloader::http::serve(listen, manager).await?;
        }
        Command::Run { files, user, level } => run(config, files, user, level).await?,
        Command::Resume { task_id, user } => resume(config, task_id, user).await?,
        Command::List => list(config).await?,
    }
    Ok(())
}

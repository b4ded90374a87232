use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::breakpoint::{BreakpointInfo, BreakpointStore};
use super::core::{Destination, Outcome, TransferExecutor, TransferJob, remove_partial_output};
use super::error::{DownloadError, Result};
use super::models::{
    CommandResult, DirectStream, DownloadRequest, ResumeOutcome, StoredFile, SubmitOutcome, guess_mime,
};
use super::pool::{Dispatch, Job, WorkerPool};
use super::progress::{ProgressEvent, ProgressPublisher};
use super::space::{Fs2SpaceProbe, SpaceProbe, check_free_space};
use super::store::TaskStore;
use super::task::{Task, TaskStatus, TransferProgress};
use crate::common::config::ServiceConfig;

/// 任务编排：校验请求、统计大小、提交到线程池、管理任务状态
pub struct DownloadManager {
    config: ServiceConfig,
    tasks: Arc<TaskStore>,
    breakpoints: Arc<BreakpointStore>,
    executor: Arc<TransferExecutor>,
    publisher: ProgressPublisher,
    pool: WorkerPool,
    running: Arc<DashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    space: Arc<dyn SpaceProbe>,
}

impl DownloadManager {
    /// 需要在 tokio 运行时内调用
    pub fn new(config: ServiceConfig) -> Self {
        let breakpoints = Arc::new(BreakpointStore::with_dir(&config.storage.breakpoint_dir));
        Self::with_parts(config, breakpoints, Arc::new(Fs2SpaceProbe))
    }

    pub fn with_parts(
        config: ServiceConfig,
        breakpoints: Arc<BreakpointStore>,
        space: Arc<dyn SpaceProbe>,
    ) -> Self {
        let tasks = Arc::new(TaskStore::new(config.cache.capacity, config.cache.ttl()));
        let executor = Arc::new(TransferExecutor::new(
            tasks.clone(),
            breakpoints.clone(),
            config.transfer.clone(),
        ));
        let publisher = ProgressPublisher::new(tasks.clone(), config.progress.clone());
        let pool = WorkerPool::new(config.pool.clone());
        Self {
            config,
            tasks,
            breakpoints,
            executor,
            publisher,
            pool,
            running: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            space,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id)
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.tasks.list_all()
    }

    pub fn subscribe(&self, task_id: &str) -> BoxStream<'static, ProgressEvent> {
        self.publisher.subscribe(task_id)
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    /// 提交下载。服务器存储模式返回任务ID，直传模式返回响应流。
    /// range_start 只对单文件直传有效。
    pub async fn submit(&self, request: DownloadRequest, range_start: Option<u64>) -> Result<SubmitOutcome> {
        if request.file_paths.is_empty() {
            return Err(DownloadError::InvalidArgument("文件列表为空".into()));
        }
        validate_user_id(&request.user_id)?;
        let level = self.compression_level(request.compression_level);

        self.check_space(&request.file_paths, request.direct_download)?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let file_count = request.file_paths.len();
        let task = Task::new(
            task_id.clone(),
            request.user_id.clone(),
            request.file_paths,
            request.direct_download,
            level,
        );
        self.tasks.save(task);
        info!(
            "新建任务：{}，用户 {}，{} 个文件，{}",
            task_id,
            request.user_id,
            file_count,
            if request.direct_download { "前端直传" } else { "服务器存储" }
        );

        self.size_task(&task_id).await;
        if let Some(task) = self.tasks.get(&task_id) {
            if let Err(e) = check_range(&task, range_start) {
                self.tasks.remove(&task_id);
                return Err(e);
            }
        }
        let breakpoint = self.breakpoints.get(&task_id).await;
        self.dispatch(&task_id, breakpoint, range_start).await
    }

    /// 取消任务：已结束的任务不受影响
    pub async fn cancel(&self, task_id: &str) -> Result<CommandResult> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))?;
        if task.finished {
            return Ok(CommandResult::ok("任务已完成，无需取消"));
        }
        if task.cancelled {
            return Ok(CommandResult::ok("任务已取消"));
        }

        // 执行器可能刚好完成，以这次原子更新的结果为准
        if self.tasks.update(task_id, |t| t.mark_cancelled()) != Some(true) {
            return Ok(CommandResult::ok("任务已完成，无需取消"));
        }
        let token = self.running.get(task_id).map(|entry| entry.value().clone());
        match token {
            // 执行器在下一个数据块之前看到标记，保存断点后退出
            Some(token) => token.cancel(),
            None => {
                if self.config.transfer.discard_partial_on_cancel {
                    self.discard_resume_state(&task).await;
                } else if self.breakpoints.get(task_id).await.is_none() {
                    let info = BreakpointInfo::new(&task, &task.cursor(), None);
                    if let Err(e) = self.breakpoints.put(info).await {
                        warn!("取消时保存断点失败：{}，{}", task_id, e);
                    }
                }
            }
        }
        info!("任务已取消：{}", task_id);
        Ok(CommandResult::ok("任务已取消"))
    }

    /// 恢复已取消或中断的任务，沿用原任务ID
    pub async fn resume(&self, task_id: &str, user_id: &str, range_start: Option<u64>) -> Result<ResumeOutcome> {
        let task = self.owned_task(task_id, user_id)?;
        if task.finished {
            return Err(DownloadError::InvalidState(format!(
                "任务已结束（{:?}），无法恢复",
                task.status
            )));
        }
        if self.is_running(task_id) {
            if task.cancelled {
                return Err(DownloadError::InvalidState("任务正在停止，请稍后再试".into()));
            }
            return Ok(ResumeOutcome::AlreadyRunning);
        }
        if !task.cancelled && task.status != TaskStatus::Interrupted {
            return Ok(ResumeOutcome::AlreadyRunning);
        }
        check_range(&task, range_start)?;

        self.tasks.update(task_id, |t| t.reset_for_resume());
        let breakpoint = self.breakpoints.get(task_id).await;
        info!(
            "恢复任务：{}，{}",
            task_id,
            if breakpoint.is_some() { "从断点继续" } else { "没有断点，从头开始" }
        );
        let outcome = self.dispatch(task_id, breakpoint, range_start).await?;
        Ok(ResumeOutcome::Resumed(outcome))
    }

    /// 用失败任务的输入和断点新建任务，原任务保持不变
    pub async fn retry(&self, task_id: &str, user_id: &str) -> Result<SubmitOutcome> {
        let failed = self.owned_task(task_id, user_id)?;
        if failed.status != TaskStatus::Failed {
            return Err(DownloadError::InvalidState("只能重试失败的任务".into()));
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let task = Task::new(
            new_id.clone(),
            failed.user_id.clone(),
            failed.file_paths.clone(),
            failed.direct_download,
            failed.compression_level,
        );
        self.tasks.save(task);
        self.size_task(&new_id).await;

        let mut breakpoint = self.breakpoints.get(task_id).await;
        if let Some(info) = breakpoint.as_mut() {
            // 断点和部分输出一起转给新任务
            info.task_id = new_id.clone();
            if !failed.direct_download {
                self.move_partial_output(&failed, &new_id).await;
            }
            if let Err(e) = self.breakpoints.put(info.clone()).await {
                warn!("转移断点失败：{}，{}", new_id, e);
            }
            if let Err(e) = self.breakpoints.delete(task_id).await {
                warn!("删除旧断点失败：{}，{}", task_id, e);
            }
            let progress = info.progress();
            self.tasks.update(&new_id, |t| t.apply_progress(&progress));
        }
        info!("重试失败任务：{} -> {}", task_id, new_id);
        self.dispatch(&new_id, breakpoint, None).await
    }

    /// 丢弃已取消或中断任务的断点和部分输出
    pub async fn discard(&self, task_id: &str, user_id: &str) -> Result<()> {
        let task = self.owned_task(task_id, user_id)?;
        if self.is_running(task_id) || !(task.cancelled || task.status == TaskStatus::Interrupted) {
            return Err(DownloadError::InvalidState("只能丢弃已取消或中断的任务".into()));
        }
        self.discard_resume_state(&task).await;
        Ok(())
    }

    /// 启动时根据持久化的断点重建任务，状态为 Interrupted
    pub async fn recover(&self) -> usize {
        let mut recovered = 0;
        for info in self.breakpoints.list().await {
            if self.tasks.contains(&info.task_id) {
                continue;
            }
            if info.file_paths.is_empty() || info.user_id.is_empty() {
                warn!("断点缺少任务信息，无法恢复：{}", info.task_id);
                continue;
            }
            let mut task = Task::new(
                info.task_id.clone(),
                info.user_id.clone(),
                info.file_paths.clone(),
                info.direct_download,
                info.compression_level.min(9),
            );
            task.total_bytes = info.total_bytes;
            task.created_at = info.updated_at;
            task.apply_progress(&info.progress());
            task.mark_interrupted("服务重启，等待恢复");
            debug!("已恢复任务：{}，进度 {}%", task.task_id, task.progress);
            self.tasks.save(task);
            recovered += 1;
        }
        if recovered > 0 {
            info!("从断点恢复了 {} 个任务", recovered);
        }
        recovered
    }

    /// 获取已完成的服务器存储任务的输出文件
    pub async fn open_stored(&self, task_id: &str, user_id: &str) -> Result<StoredFile> {
        let task = self.owned_task(task_id, user_id)?;
        if task.direct_download {
            return Err(DownloadError::InvalidState("直传任务没有服务器副本".into()));
        }
        if task.status != TaskStatus::Completed {
            return Err(DownloadError::InvalidState("任务尚未完成".into()));
        }
        let path = task
            .target_file_path
            .clone()
            .ok_or_else(|| DownloadError::FileNotFound(self.output_path(&task)))?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| DownloadError::FileNotFound(path.clone()))?;
        Ok(StoredFile {
            file_name: output_name(&task),
            content_type: guess_mime(&path),
            size: metadata.len(),
            path,
        })
    }

    /// 停止接收新任务，等待进行中的任务；超时后通知它们保存断点退出
    pub async fn shutdown(&self) {
        info!("正在关闭下载服务，进行中的任务 {} 个", self.running.len());
        let shutdown = self.shutdown.clone();
        self.pool.shutdown(move || shutdown.cancel()).await;
    }

    fn owned_task(&self, task_id: &str, user_id: &str) -> Result<Task> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))?;
        if task.user_id != user_id {
            return Err(DownloadError::Unauthorized(task_id.to_string()));
        }
        Ok(task)
    }

    fn compression_level(&self, requested: Option<i32>) -> u32 {
        let level = requested.unwrap_or(self.config.transfer.default_compression_level as i32);
        level.clamp(0, 9) as u32
    }

    fn check_space(&self, files: &[PathBuf], direct: bool) -> Result<()> {
        let min_free = self.config.storage.min_free_space;
        let mut checked = HashSet::new();
        for dir in files.iter().filter_map(|p| p.parent()) {
            if checked.insert(dir.to_path_buf()) {
                check_free_space(self.space.as_ref(), dir, min_free)?;
            }
        }
        if !direct {
            check_free_space(self.space.as_ref(), &self.config.storage.store_dir, min_free)?;
        }
        Ok(())
    }

    /// PENDING -> SIZING：统计存在的源文件大小，缺失的文件计 0
    async fn size_task(&self, task_id: &str) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        self.tasks.update(task_id, |t| t.set_status(TaskStatus::Sizing));
        let mut total = 0;
        for path in &task.file_paths {
            match tokio::fs::metadata(path).await {
                Ok(metadata) if metadata.is_file() => total += metadata.len(),
                Ok(_) => warn!("不是普通文件，将计为失败：{}", path.display()),
                Err(e) => warn!("源文件不可用，将计为失败：{}，{}", path.display(), e),
            }
        }
        self.tasks.update(task_id, |t| t.total_bytes = total);
        debug!("任务 {} 总大小 {} 字节", task_id, total);
    }

    fn output_path(&self, task: &Task) -> PathBuf {
        self.config
            .storage
            .store_dir
            .join(&task.user_id)
            .join(&task.task_id)
            .join(output_name(task))
    }

    async fn discard_resume_state(&self, task: &Task) {
        if !task.direct_download {
            remove_partial_output(&self.output_path(task)).await;
        }
        if let Err(e) = self.breakpoints.delete(&task.task_id).await {
            warn!("删除断点失败：{}，{}", task.task_id, e);
        }
        info!("已丢弃任务的断点和部分输出：{}", task.task_id);
    }

    async fn move_partial_output(&self, from: &Task, new_id: &str) {
        let source = self.output_path(from);
        if !source.exists() {
            return;
        }
        let mut renamed = from.clone();
        renamed.task_id = new_id.to_string();
        let target = self.output_path(&renamed);
        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("创建输出目录失败：{}，{}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = tokio::fs::rename(&source, &target).await {
            warn!("转移部分输出失败：{} -> {}，{}", source.display(), target.display(), e);
        }
    }

    /// 组装执行参数并提交到线程池
    async fn dispatch(
        &self,
        task_id: &str,
        breakpoint: Option<BreakpointInfo>,
        range_start: Option<u64>,
    ) -> Result<SubmitOutcome> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))?;

        let (mut start, archive) = match breakpoint {
            Some(info) => (info.progress(), info.archive),
            None => (TransferProgress::default(), None),
        };

        let (destination, outcome) = if task.direct_download {
            let (writer, reader) = tokio::io::duplex(self.config.transfer.buffer_size.max(1024) * 2);
            let mut stream = DirectStream {
                task_id: task_id.to_string(),
                reader,
                file_name: output_name(&task),
                content_type: "application/zip",
                range: None,
                resume_offset: 0,
            };
            if task.single_file {
                // 单文件直传以客户端的 Range 为准
                let size = task.total_bytes;
                let offset = range_start.unwrap_or(0).min(size);
                start = TransferProgress {
                    downloaded_bytes: offset,
                    current_file_offset: offset,
                    ..TransferProgress::default()
                };
                stream.content_type = guess_mime(&task.file_paths[0]);
                stream.range = Some((offset, size));
            } else {
                stream.resume_offset = archive.as_ref().map_or(0, |c| c.bytes_written);
            }
            (Destination::Direct(writer), SubmitOutcome::Direct(stream))
        } else {
            (
                Destination::Store(self.output_path(&task)),
                SubmitOutcome::Stored {
                    task_id: task_id.to_string(),
                },
            )
        };

        let job = TransferJob {
            task_id: task_id.to_string(),
            files: task.file_paths.clone(),
            compression_level: task.compression_level,
            start,
            archive,
            destination,
        };
        let token = self.shutdown.child_token();
        self.running.insert(task_id.to_string(), token.clone());
        let work = self.work(job, token, &task);

        let dispatched = if task.direct_download {
            // 直传任务由响应流驱动，线程池饱和时在单独的任务里运行
            self.pool.try_execute(work).map(|dispatch| {
                if let Dispatch::Saturated(work) = dispatch {
                    warn!("线程池已满，直传任务 {} 由请求自行驱动", task_id);
                    tokio::spawn(work);
                }
            })
        } else {
            self.pool.execute(work).await
        };

        if let Err(e) = dispatched {
            self.running.remove(task_id);
            self.tasks.update(task_id, |t| t.mark_failed(e.to_string()));
            return Err(e);
        }
        Ok(outcome)
    }

    fn work(&self, job: TransferJob, token: CancellationToken, task: &Task) -> Job {
        let executor = self.executor.clone();
        let tasks = self.tasks.clone();
        let running = self.running.clone();
        let breakpoints = self.breakpoints.clone();
        let discard = self.config.transfer.discard_partial_on_cancel && !task.direct_download;
        let output = self.output_path(task);
        let task_id = task.task_id.clone();

        Box::pin(async move {
            let outcome = supervise(executor.run(job, token), &task_id, &tasks, running).await;
            if outcome == Outcome::Cancelled && discard {
                remove_partial_output(&output).await;
                if let Err(e) = breakpoints.delete(&task_id).await {
                    warn!("删除断点失败：{}，{}", task_id, e);
                }
            }
            debug!("任务 {} 执行结束：{:?}", task_id, outcome);
        })
    }
}

/// 离开作用域时把任务移出运行表，执行被中止或 panic 时同样生效
struct RunningGuard {
    running: Arc<DashMap<String, CancellationToken>>,
    task_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.task_id);
    }
}

/// 运行一次执行；执行器 panic 时任务记为失败
async fn supervise(
    run: impl Future<Output = Outcome>,
    task_id: &str,
    tasks: &TaskStore,
    running: Arc<DashMap<String, CancellationToken>>,
) -> Outcome {
    let _guard = RunningGuard {
        running,
        task_id: task_id.to_string(),
    };
    match AssertUnwindSafe(run).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!("任务 {} 执行时发生panic：{}", task_id, reason);
            let message = format!("执行异常终止: {reason}");
            tasks.update(task_id, |t| t.mark_failed(message.clone()));
            Outcome::Failed(message)
        }
    }
}

/// 单文件直传的 Range 起点必须落在文件内
fn check_range(task: &Task, range_start: Option<u64>) -> Result<()> {
    match range_start {
        Some(start) if task.direct_download && task.single_file && start > 0 && start >= task.total_bytes => {
            Err(DownloadError::RangeNotSatisfiable {
                start,
                size: task.total_bytes,
            })
        }
        _ => Ok(()),
    }
}

/// 输出文件名：单文件沿用源文件名，多文件为 {taskId}.zip
fn output_name(task: &Task) -> String {
    if task.single_file {
        task.file_paths[0]
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| task.task_id.clone())
    } else {
        format!("{}.zip", task.task_id)
    }
}

/// userId 会成为存储路径的一部分
fn validate_user_id(user_id: &str) -> Result<()> {
    let valid = !user_id.is_empty()
        && user_id != "."
        && user_id != ".."
        && !user_id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(DownloadError::InvalidArgument(format!("非法的用户ID: {user_id}")))
    }
}

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::archive::{ArchiveCursor, ArchiveWriter, entry_names};
use super::breakpoint::{BreakpointInfo, BreakpointStore};
use super::error::{DownloadError, Result};
use super::rate_limit::RateLimitedWriter;
use super::store::TaskStore;
use super::task::{TaskStatus, TransferProgress};
use crate::common::config::TransferConfig;

type BoxSink = Box<dyn AsyncWrite + Send + Unpin>;

/// 字节的去向
pub enum Destination {
    /// 服务器存储：写入该路径
    Store(PathBuf),
    /// 前端直传：写入响应流
    Direct(DuplexStream),
}

impl Destination {
    pub fn is_direct(&self) -> bool {
        matches!(self, Destination::Direct(_))
    }
}

/// 一次执行所需的全部输入
pub struct TransferJob {
    pub task_id: String,
    pub files: Vec<PathBuf>,
    pub compression_level: u32,
    /// 恢复游标，全新任务为默认值
    pub start: TransferProgress,
    pub archive: Option<ArchiveCursor>,
    pub destination: Destination,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { output_bytes: u64 },
    Cancelled,
    Interrupted(String),
    Failed(String),
}

/// 可以从这里继续的位置
#[derive(Debug, Clone)]
struct Checkpoint {
    progress: TransferProgress,
    archive: Option<ArchiveCursor>,
}

struct Done {
    progress: TransferProgress,
    output_bytes: u64,
    target: Option<PathBuf>,
    /// 完成前被取消时从这里恢复
    resume_point: Checkpoint,
}

enum Halt {
    Cancelled(Checkpoint),
    /// 输出流写入失败（直传时即客户端断开）
    SinkLost(Checkpoint, DownloadError),
    /// 目标不可用或超出压缩包限制
    Fatal(Checkpoint, DownloadError),
}

/// 传输执行器：驱动一个任务从 TRANSFERRING 走到终态
pub struct TransferExecutor {
    tasks: Arc<TaskStore>,
    breakpoints: Arc<BreakpointStore>,
    config: TransferConfig,
}

impl TransferExecutor {
    pub fn new(tasks: Arc<TaskStore>, breakpoints: Arc<BreakpointStore>, config: TransferConfig) -> Self {
        Self {
            tasks,
            breakpoints,
            config,
        }
    }

    pub async fn run(&self, job: TransferJob, cancel: CancellationToken) -> Outcome {
        let task_id = job.task_id.clone();
        let direct = job.destination.is_direct();

        if cancel.is_cancelled() {
            debug!("任务在开始前已取消：{}", task_id);
            let checkpoint = Checkpoint {
                progress: job.start,
                archive: job.archive,
            };
            return self.finish_halt(&task_id, direct, Halt::Cancelled(checkpoint)).await;
        }

        self.tasks
            .update(&task_id, |t| t.set_status(TaskStatus::Transferring));
        info!(
            "开始传输：{}，{} 个文件，{}，从第 {} 个文件偏移 {} 处开始",
            task_id,
            job.files.len(),
            if direct { "前端直传" } else { "服务器存储" },
            job.start.current_file_index,
            job.start.current_file_offset
        );

        let result = if job.files.len() == 1 {
            self.run_single(job, &cancel).await
        } else {
            self.run_archive(job, &cancel).await
        };

        match result {
            Ok(done) => {
                // 取消可能发生在最后一次检查之后；与取消标记在同一次更新中判断
                let committed = self
                    .tasks
                    .update(&task_id, |t| {
                        if t.cancelled {
                            return false;
                        }
                        t.apply_progress(&done.progress);
                        t.mark_completed(done.target.clone(), done.output_bytes)
                    })
                    .unwrap_or(false);
                if !committed {
                    debug!("任务在收尾阶段被取消：{}", task_id);
                    return self
                        .finish_halt(&task_id, direct, Halt::Cancelled(done.resume_point))
                        .await;
                }
                if let Err(e) = self.breakpoints.delete(&task_id).await {
                    warn!("删除断点失败：{}，{}", task_id, e);
                }
                info!(
                    "传输完成：{}，成功 {} 个，失败 {} 个，输出 {} 字节",
                    task_id, done.progress.completed_count, done.progress.failed_count, done.output_bytes
                );
                Outcome::Completed {
                    output_bytes: done.output_bytes,
                }
            }
            Err(halt) => self.finish_halt(&task_id, direct, halt).await,
        }
    }

    async fn finish_halt(&self, task_id: &str, direct: bool, halt: Halt) -> Outcome {
        match halt {
            Halt::Cancelled(checkpoint) => {
                self.save(task_id, &checkpoint).await;
                // 用户取消时任务已带有取消标记；否则是服务关闭，任务保持可恢复
                let by_user = self
                    .tasks
                    .update(task_id, |t| {
                        t.apply_progress(&checkpoint.progress);
                        if t.cancelled {
                            t.mark_cancelled();
                            return true;
                        }
                        t.mark_interrupted("服务关闭，任务已暂停");
                        false
                    })
                    .unwrap_or(true);
                info!(
                    "任务已停止：{}，断点停在第 {} 个文件偏移 {}",
                    task_id, checkpoint.progress.current_file_index, checkpoint.progress.current_file_offset
                );
                if by_user {
                    Outcome::Cancelled
                } else {
                    Outcome::Interrupted("服务关闭，任务已暂停".into())
                }
            }
            Halt::SinkLost(checkpoint, e) if direct => {
                self.save(task_id, &checkpoint).await;
                let message = format!("客户端连接已断开: {e}");
                self.tasks.update(task_id, |t| {
                    t.apply_progress(&checkpoint.progress);
                    t.mark_interrupted(message.clone());
                });
                warn!("直传中断：{}，{}", task_id, e);
                Outcome::Interrupted(message)
            }
            Halt::SinkLost(checkpoint, e) | Halt::Fatal(checkpoint, e) => {
                self.save(task_id, &checkpoint).await;
                let message = e.to_string();
                self.tasks.update(task_id, |t| {
                    t.apply_progress(&checkpoint.progress);
                    t.mark_failed(message.clone());
                });
                error!("传输失败：{}，{}", task_id, e);
                Outcome::Failed(message)
            }
        }
    }

    async fn run_single(&self, job: TransferJob, cancel: &CancellationToken) -> std::result::Result<Done, Halt> {
        let task_id = job.task_id.as_str();
        let path = &job.files[0];
        let mut progress = job.start;

        let (mut sink, target) = match job.destination {
            Destination::Store(out) => {
                let resume_at = progress.current_file_offset;
                let (file, at) = open_store_file(&out, resume_at).await.map_err(|e| {
                    Halt::Fatal(
                        Checkpoint {
                            progress,
                            archive: None,
                        },
                        e,
                    )
                })?;
                if at != resume_at {
                    warn!("已存储的部分文件与断点不符，从头开始：{}", out.display());
                    progress = TransferProgress::default();
                }
                let sink: BoxSink = Box::new(file);
                (RateLimitedWriter::new(sink, self.config.server_rate_limit), Some(out))
            }
            Destination::Direct(stream) => {
                let sink: BoxSink = Box::new(stream);
                (RateLimitedWriter::new(sink, self.config.rate_limit), None)
            }
        };

        let mut source = match open_source(path, progress.current_file_offset).await {
            Ok(source) => source,
            Err(e) => {
                warn!("{}，计为失败", source_error(path, e));
                return Ok(self.single_failed(progress, target).await);
            }
        };

        let mut buf = vec![0u8; self.config.buffer_size.max(1)];
        loop {
            if cancel.is_cancelled() {
                let _ = sink.flush().await;
                return Err(Halt::Cancelled(Checkpoint {
                    progress,
                    archive: None,
                }));
            }
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("{}，计为失败", source_error(path, e));
                    return Ok(self.single_failed(progress, target).await);
                }
            };
            if let Err(e) = sink.write_all(&buf[..n]).await {
                let checkpoint = Checkpoint {
                    progress,
                    archive: None,
                };
                return Err(Halt::SinkLost(checkpoint, e.into()));
            }
            if self.advance(task_id, &mut progress, n) {
                if let Err(e) = sink.flush().await {
                    let checkpoint = Checkpoint {
                        progress,
                        archive: None,
                    };
                    return Err(Halt::SinkLost(checkpoint, e.into()));
                }
                self.save(
                    task_id,
                    &Checkpoint {
                        progress,
                        archive: None,
                    },
                )
                .await;
            }
        }

        if let Err(e) = sink.shutdown().await {
            let checkpoint = Checkpoint {
                progress,
                archive: None,
            };
            return Err(Halt::SinkLost(checkpoint, e.into()));
        }
        let output_bytes = progress.current_file_offset;
        let resume_point = Checkpoint {
            progress,
            archive: None,
        };
        progress.completed_count = 1;
        progress.current_file_index = 1;
        progress.current_file_offset = 0;
        Ok(Done {
            progress,
            output_bytes,
            target,
            resume_point,
        })
    }

    /// 单文件模式下源文件不可用：不留下部分输出
    async fn single_failed(&self, mut progress: TransferProgress, target: Option<PathBuf>) -> Done {
        if let Some(out) = &target {
            remove_partial_output(out).await;
        }
        let resume_point = Checkpoint {
            progress,
            archive: None,
        };
        progress.failed_count = 1;
        progress.current_file_index = 1;
        progress.current_file_offset = 0;
        Done {
            progress,
            output_bytes: 0,
            target: None,
            resume_point,
        }
    }

    async fn run_archive(&self, job: TransferJob, cancel: &CancellationToken) -> std::result::Result<Done, Halt> {
        let task_id = job.task_id.as_str();
        let files = &job.files;
        let mut progress = job.start;
        let mut archive = job.archive;

        if archive.is_none() && progress != TransferProgress::default() {
            warn!("断点缺少压缩包写入位置，从头开始：{}", task_id);
            progress = TransferProgress::default();
        }

        let (sink, target) = match job.destination {
            Destination::Store(out) => {
                let resume_at = archive.as_ref().map_or(0, |c| c.bytes_written);
                let (file, at) = open_store_file(&out, resume_at).await.map_err(|e| {
                    Halt::Fatal(
                        Checkpoint {
                            progress,
                            archive: archive.clone(),
                        },
                        e,
                    )
                })?;
                if at != resume_at {
                    warn!("已存储的部分压缩包与断点不符，从头开始：{}", out.display());
                    progress = TransferProgress::default();
                    archive = None;
                }
                let sink: BoxSink = Box::new(file);
                (RateLimitedWriter::new(sink, self.config.server_rate_limit), Some(out))
            }
            Destination::Direct(stream) => {
                let sink: BoxSink = Box::new(stream);
                (RateLimitedWriter::new(sink, self.config.rate_limit), None)
            }
        };

        let mut saved = Checkpoint {
            progress,
            archive: Some(archive.clone().unwrap_or_default()),
        };
        let mut writer = match archive {
            Some(cursor) => ArchiveWriter::resume(sink, job.compression_level, cursor),
            None => ArchiveWriter::new(sink, job.compression_level),
        };
        let names = entry_names(files);
        let mut buf = vec![0u8; self.config.buffer_size.max(1)];

        while progress.current_file_index < files.len() {
            let index = progress.current_file_index;
            let path = &files[index];
            if cancel.is_cancelled() {
                return Err(cancelled(&mut writer, progress, &saved).await);
            }

            let continuing = writer.open_source_index() == Some(index);
            if !continuing && writer.open_source_index().is_some() {
                writer.abandon_entry().await.map_err(|e| halt(e, &saved))?;
            }
            let offset = if continuing { progress.current_file_offset } else { 0 };

            let mut source = match open_source(path, offset).await {
                Ok(source) => source,
                Err(e) => {
                    warn!("{}，跳过", source_error(path, e));
                    if continuing {
                        writer.abandon_entry().await.map_err(|e| halt(e, &saved))?;
                    }
                    progress.failed_count += 1;
                    saved = self.next_file(task_id, &mut writer, &mut progress, &saved).await?;
                    continue;
                }
            };

            if !continuing {
                let metadata = source.metadata().await.ok();
                let size = metadata.as_ref().map_or(0, |m| m.len());
                if size > u32::MAX as u64 {
                    warn!("文件超过 4GiB，无法放入压缩包，跳过：{}", path.display());
                    progress.failed_count += 1;
                    saved = self.next_file(task_id, &mut writer, &mut progress, &saved).await?;
                    continue;
                }
                let modified = metadata
                    .and_then(|m| m.modified().ok())
                    .unwrap_or_else(SystemTime::now);
                writer
                    .start_entry(&names[index], index, modified)
                    .await
                    .map_err(|e| halt(e, &saved))?;
                progress.current_file_offset = 0;
                debug!("开始打包：{} -> {}", path.display(), names[index]);
            }

            let mut read_failed = false;
            loop {
                if cancel.is_cancelled() {
                    return Err(cancelled(&mut writer, progress, &saved).await);
                }
                let n = match source.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("{}，跳过", source_error(path, e));
                        read_failed = true;
                        break;
                    }
                };
                writer
                    .write_data(&buf[..n])
                    .await
                    .map_err(|e| halt(e, &saved))?;
                if self.advance(task_id, &mut progress, n) {
                    saved = self.checkpoint(task_id, &mut writer, progress, &saved).await?;
                }
            }

            if read_failed {
                writer.abandon_entry().await.map_err(|e| halt(e, &saved))?;
                progress.failed_count += 1;
            } else {
                writer.finish_entry().await.map_err(|e| halt(e, &saved))?;
                progress.completed_count += 1;
            }
            saved = self.next_file(task_id, &mut writer, &mut progress, &saved).await?;
        }

        let (mut sink, output_bytes) = writer.finish().await.map_err(|e| halt(e, &saved))?;
        sink.shutdown()
            .await
            .map_err(|e| Halt::SinkLost(saved.clone(), e.into()))?;
        Ok(Done {
            progress,
            output_bytes,
            target,
            resume_point: saved,
        })
    }

    /// 当前文件处理完（成功或失败），移到下一个文件并保存断点
    async fn next_file<W: AsyncWrite + Unpin>(
        &self,
        task_id: &str,
        writer: &mut ArchiveWriter<W>,
        progress: &mut TransferProgress,
        saved: &Checkpoint,
    ) -> std::result::Result<Checkpoint, Halt> {
        progress.current_file_index += 1;
        progress.current_file_offset = 0;
        self.publish(task_id, progress);
        self.checkpoint(task_id, writer, *progress, saved).await
    }

    async fn checkpoint<W: AsyncWrite + Unpin>(
        &self,
        task_id: &str,
        writer: &mut ArchiveWriter<W>,
        progress: TransferProgress,
        saved: &Checkpoint,
    ) -> std::result::Result<Checkpoint, Halt> {
        let cursor = writer.checkpoint().await.map_err(|e| halt(e, saved))?;
        let checkpoint = Checkpoint {
            progress,
            archive: Some(cursor),
        };
        self.save(task_id, &checkpoint).await;
        Ok(checkpoint)
    }

    /// 推进计数并同步到任务；返回是否跨过了分片边界
    fn advance(&self, task_id: &str, progress: &mut TransferProgress, n: usize) -> bool {
        let before = progress.downloaded_bytes;
        progress.downloaded_bytes += n as u64;
        progress.current_file_offset += n as u64;
        self.publish(task_id, progress);

        let shard = self.config.shard_size.max(1);
        before / shard != progress.downloaded_bytes / shard
    }

    fn publish(&self, task_id: &str, progress: &TransferProgress) {
        self.tasks.update(task_id, |t| t.apply_progress(progress));
    }

    async fn save(&self, task_id: &str, checkpoint: &Checkpoint) {
        let Some(task) = self.tasks.get(task_id) else {
            warn!("任务不存在，无法保存断点：{}", task_id);
            return;
        };
        let info = BreakpointInfo::new(&task, &checkpoint.progress, checkpoint.archive.clone());
        if let Err(e) = self.breakpoints.put(info).await {
            error!("断点持久化失败：{}，{}", task_id, e);
        }
    }
}

async fn cancelled<W: AsyncWrite + Unpin>(
    writer: &mut ArchiveWriter<W>,
    progress: TransferProgress,
    saved: &Checkpoint,
) -> Halt {
    match writer.checkpoint().await {
        Ok(cursor) => Halt::Cancelled(Checkpoint {
            progress,
            archive: Some(cursor),
        }),
        Err(e) => {
            warn!("取消时刷新压缩包失败，使用上一个断点：{}", e);
            Halt::Cancelled(saved.clone())
        }
    }
}

fn halt(e: DownloadError, saved: &Checkpoint) -> Halt {
    match e {
        DownloadError::ArchiveLimit(_) | DownloadError::FatalIo(_) => Halt::Fatal(saved.clone(), e),
        e => Halt::SinkLost(saved.clone(), e),
    }
}

fn source_error(path: &Path, e: io::Error) -> DownloadError {
    if e.kind() == io::ErrorKind::NotFound {
        DownloadError::FileNotFound(path.to_path_buf())
    } else {
        DownloadError::TransientIo {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

async fn open_source(path: &Path, offset: u64) -> io::Result<File> {
    let mut file = File::open(path).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(file)
}

/// 打开服务器存储的输出文件并定位到 resume_at；
/// 已有内容比 resume_at 短时说明部分输出已丢失，截断为空并返回 0
async fn open_store_file(path: &Path, resume_at: u64) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DownloadError::FatalIo(format!("无法创建输出目录 {}: {e}", parent.display()))
        })?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| DownloadError::FatalIo(format!("无法打开输出文件 {}: {e}", path.display())))?;

    let existing = file.metadata().await?.len();
    let at = if resume_at > 0 && existing >= resume_at {
        resume_at
    } else {
        0
    };
    file.set_len(at).await?;
    file.seek(SeekFrom::Start(at)).await?;
    Ok((file, at))
}

pub async fn remove_partial_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("已删除部分输出：{}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除部分输出失败：{}，{}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::Task;
    use std::io::{Cursor, Read};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        tasks: Arc<TaskStore>,
        breakpoints: Arc<BreakpointStore>,
        executor: TransferExecutor,
    }

    fn fixture(shard_size: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let tasks = Arc::new(TaskStore::new(100, Duration::from_secs(60)));
        let breakpoints = Arc::new(BreakpointStore::with_dir(dir.path().join("bp")));
        let config = TransferConfig {
            buffer_size: 1024,
            shard_size,
            ..TransferConfig::default()
        };
        let executor = TransferExecutor::new(tasks.clone(), breakpoints.clone(), config);
        Fixture {
            dir,
            tasks,
            breakpoints,
            executor,
        }
    }

    impl Fixture {
        fn source(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.dir.path().join("src").join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            path
        }

        fn register(&self, id: &str, files: &[PathBuf]) {
            let mut task = Task::new(id.into(), "u1".into(), files.to_vec(), false, 6);
            task.total_bytes = files
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum();
            self.tasks.save(task);
        }

        fn job(&self, id: &str, files: &[PathBuf], out: &Path) -> TransferJob {
            TransferJob {
                task_id: id.into(),
                files: files.to_vec(),
                compression_level: 6,
                start: TransferProgress::default(),
                archive: None,
                destination: Destination::Store(out.to_path_buf()),
            }
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    fn unzip(path: &Path) -> Vec<(String, Vec<u8>)> {
        let bytes = std::fs::read(path).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut content = Vec::new();
                file.read_to_end(&mut content).unwrap();
                (file.name().to_string(), content)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_file_copy() {
        let f = fixture(4096);
        let content = pattern(10_000, 1);
        let src = f.source("a.bin", &content);
        let out = f.dir.path().join("out/a.bin");
        f.register("t1", &[src.clone()]);

        let outcome = f.executor.run(f.job("t1", &[src], &out), CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Completed { output_bytes: 10_000 });
        assert_eq!(std::fs::read(&out).unwrap(), content);

        let task = f.tasks.get("t1").unwrap();
        assert!(task.finished);
        assert_eq!(task.progress, 100);
        assert_eq!(task.completed_count, 1);
        assert_eq!(task.target_file_path, Some(out));
        assert!(f.breakpoints.get("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_single_file_leaves_no_output() {
        let f = fixture(4096);
        let src = f.dir.path().join("src/missing.bin");
        let out = f.dir.path().join("out/missing.bin");
        f.register("t1", &[src.clone()]);

        f.executor.run(f.job("t1", &[src], &out), CancellationToken::new()).await;
        let task = f.tasks.get("t1").unwrap();
        assert_eq!((task.completed_count, task.failed_count), (0, 1));
        assert!(task.finished);
        assert_eq!(task.progress, 100);
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_archive_skips_missing_file() {
        let f = fixture(4096);
        let a = f.source("a.txt", &pattern(3000, 1));
        let missing = f.dir.path().join("src/gone.txt");
        let c = f.source("c.txt", &pattern(5000, 3));
        let files = vec![a, missing, c];
        let out = f.dir.path().join("out/t1.zip");
        f.register("t1", &files);

        let outcome = f.executor.run(f.job("t1", &files, &out), CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Completed { .. }));

        let task = f.tasks.get("t1").unwrap();
        assert_eq!((task.completed_count, task.failed_count), (2, 1));
        let entries = unzip(&out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("a.txt".to_string(), pattern(3000, 1)));
        assert_eq!(entries[1], ("c.txt".to_string(), pattern(5000, 3)));
    }

    #[tokio::test]
    async fn test_cancel_before_start_keeps_cursor() {
        let f = fixture(4096);
        let src = f.source("a.bin", &pattern(100, 0));
        let out = f.dir.path().join("out/a.bin");
        f.register("t1", &[src.clone()]);
        f.tasks.update("t1", |t| t.mark_cancelled());

        let token = CancellationToken::new();
        token.cancel();
        let outcome = f.executor.run(f.job("t1", &[src], &out), token).await;
        assert_eq!(outcome, Outcome::Cancelled);

        let task = f.tasks.get("t1").unwrap();
        assert!(task.cancelled);
        assert!(!task.finished);
        assert!(f.breakpoints.get("t1").await.is_some());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_resume_archive_from_open_entry() {
        let f = fixture(2048);
        let first = pattern(6000, 5);
        let second = pattern(4000, 6);
        let files = vec![f.source("one.bin", &first), f.source("two.bin", &second)];
        let out = f.dir.path().join("out/t1.zip");
        f.register("t1", &files);

        // 先手工写出一个停在第一个文件中间的压缩包
        std::fs::create_dir_all(out.parent().unwrap()).unwrap();
        let file =tokio::fs::File::create(&out).await.unwrap();
        let mut writer = ArchiveWriter::new(file, 6);
        writer.start_entry("one.bin", 0, SystemTime::now()).await.unwrap();
        writer.write_data(&first[..2500]).await.unwrap();
        let cursor = writer.checkpoint().await.unwrap();
        drop(writer);

        let mut job = f.job("t1", &files, &out);
        job.start = TransferProgress {
            downloaded_bytes: 2500,
            current_file_index: 0,
            current_file_offset: 2500,
            ..Default::default()
        };
        job.archive = Some(cursor);

        let outcome = f.executor.run(job, CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Completed { .. }));
        let task = f.tasks.get("t1").unwrap();
        assert_eq!(task.downloaded_bytes, 10_000);
        assert_eq!(task.completed_count, 2);

        let entries = unzip(&out);
        assert_eq!(entries[0].1, first);
        assert_eq!(entries[1].1, second);
    }

    #[tokio::test]
    async fn test_cancel_during_finalization_keeps_task_resumable() {
        let f = fixture(4096);
        let files = vec![f.source("p.bin", &pattern(1000, 1)), f.source("q.bin", &pattern(1000, 2))];
        let out = f.dir.path().join("out/t1.zip");
        f.register("t1", &files);
        // 取消标记已写入，但执行器已经过了最后一次检查
        f.tasks.update("t1", |t| t.mark_cancelled());

        let outcome = f.executor.run(f.job("t1", &files, &out), CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Cancelled);

        let task = f.tasks.get("t1").unwrap();
        assert!(task.cancelled);
        assert!(!task.finished);
        assert_eq!(task.status, TaskStatus::Cancelled);

        let saved = f.breakpoints.get("t1").await.expect("应保留断点");
        assert_eq!(saved.current_file_index, 2);
        assert_eq!(saved.completed_count, 2);
        let cursor = saved.archive.clone().unwrap();
        assert_eq!(cursor.entries.len(), 2);

        // 从断点恢复只需补写目录
        f.tasks.update("t1", |t| t.reset_for_resume());
        let mut job = f.job("t1", &files, &out);
        job.start = saved.progress();
        job.archive = Some(cursor);
        let outcome = f.executor.run(job, CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Completed { .. }));

        let task = f.tasks.get("t1").unwrap();
        assert!(task.finished);
        assert!(!task.cancelled);
        let entries = unzip(&out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], ("q.bin".to_string(), pattern(1000, 2)));
    }

    #[tokio::test]
    async fn test_direct_disconnect_interrupts() {
        let f = fixture(1024);
        let src = f.source("big.bin", &pattern(200_000, 2));
        f.register("t1", &[src.clone()]);

        let (writer, reader) = tokio::io::duplex(4096);
        drop(reader);
        let job = TransferJob {
            task_id: "t1".into(),
            files: vec![src],
            compression_level: 6,
            start: TransferProgress::default(),
            archive: None,
            destination: Destination::Direct(writer),
        };
        let outcome = f.executor.run(job, CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Interrupted(_)));

        let task = f.tasks.get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Interrupted);
        assert!(!task.finished);
        assert!(f.breakpoints.get("t1").await.is_some());
    }

    #[tokio::test]
    async fn test_direct_stream_delivers_archive() {
        let f = fixture(4096);
        let files = vec![f.source("x.txt", b"hello"), f.source("y.txt", b"world")];
        f.register("t1", &files);

        let (writer, mut reader) = tokio::io::duplex(1024);
        let job = TransferJob {
            task_id: "t1".into(),
            files,
            compression_level: 6,
            start: TransferProgress::default(),
            archive: None,
            destination: Destination::Direct(writer),
        };
        let collect = tokio::spawn(async move {
            let mut bytes = Vec::new();
            tokio::io::copy(&mut reader, &mut bytes).await.unwrap();
            bytes
        });
        let outcome = f.executor.run(job, CancellationToken::new()).await;
        let bytes = collect.await.unwrap();
        assert_eq!(outcome, Outcome::Completed { output_bytes: bytes.len() as u64 });

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        archive.by_name("y.txt").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "world");
    }

    #[tokio::test]
    async fn test_unwritable_destination_fails_task() {
        let f = fixture(4096);
        let src = f.source("a.bin", &pattern(100, 0));
        // 输出目录的父路径是一个普通文件
        let blocker = f.source("blocker", b"x");
        let out = blocker.join("out.bin");
        f.register("t1", &[src.clone()]);

        let outcome = f.executor.run(f.job("t1", &[src], &out), CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Failed(_)));
        let task = f.tasks.get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.finished);
        assert_eq!(task.failed_count, 1);
        assert!(f.breakpoints.get("t1").await.is_some());
    }
}

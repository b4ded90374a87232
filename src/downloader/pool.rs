use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::error::{DownloadError, Result};
use crate::common::config::PoolConfig;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const ABORT_GRACE: Duration = Duration::from_secs(5);

/// 提交结果
pub enum Dispatch {
    Accepted,
    /// 队列已满且工作者已达上限，任务交还给调用方执行
    Saturated(Job),
}

/// 固定数量的常驻工作者 + 按需扩容的临时工作者，共享一个有界队列
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<JoinSet<()>>,
    active: Arc<AtomicUsize>,
    config: PoolConfig,
}

impl WorkerPool {
    /// 需要在 tokio 运行时内调用
    pub fn new(config: PoolConfig) -> Self {
        let core = config.core_workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let pool = Self {
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(JoinSet::new()),
            active: Arc::new(AtomicUsize::new(core)),
            config,
        };
        {
            let mut workers = pool.workers.lock().unwrap_or_else(|e| e.into_inner());
            for id in 0..core {
                workers.spawn(worker_loop(
                    format!("core-{id}"),
                    None,
                    pool.receiver.clone(),
                    pool.active.clone(),
                    None,
                ));
            }
        }
        debug!("线程池已启动：常驻 {} 个工作者", core);
        pool
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn try_execute(&self, job: Job) -> Result<Dispatch> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DownloadError::PoolClosed)?;

        let job = match sender.try_send(job) {
            Ok(()) => return Ok(Dispatch::Accepted),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(DownloadError::PoolClosed),
            Err(mpsc::error::TrySendError::Full(job)) => job,
        };

        let max = self.config.max_workers.max(self.config.core_workers);
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok();
        if !reserved {
            return Ok(Dispatch::Saturated(job));
        }

        let id = self.active.load(Ordering::SeqCst);
        debug!("队列已满，扩容临时工作者（当前 {} 个）", id);
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .spawn(worker_loop(
                format!("elastic-{id}"),
                Some(job),
                self.receiver.clone(),
                self.active.clone(),
                Some(self.config.keep_alive()),
            ));
        Ok(Dispatch::Accepted)
    }

    /// 提交任务；线程池饱和时在调用方直接执行
    pub async fn execute(&self, job: Job) -> Result<()> {
        if let Dispatch::Saturated(job) = self.try_execute(job)? {
            warn!("线程池已满，任务由调用方执行");
            run_guarded("caller", job).await;
        }
        Ok(())
    }

    /// 停止接收新任务并等待已提交的任务完成。
    /// 超时后调用 on_timeout（用于通知任务尽快保存断点退出），再等待片刻后强制终止。
    pub async fn shutdown(&self, on_timeout: impl FnOnce()) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));

        let drain = async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!("工作者异常退出：{}", e);
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout(), drain).await.is_ok() {
            info!("线程池已关闭");
            return;
        }

        warn!(
            "等待任务结束超时（{:?}），通知剩余任务退出",
            self.config.shutdown_timeout()
        );
        on_timeout();
        let drain = async { while workers.join_next().await.is_some() {} };
        if tokio::time::timeout(ABORT_GRACE, drain).await.is_err() {
            warn!("仍有 {} 个工作者未退出，强制终止", workers.len());
            workers.abort_all();
        }
    }
}

async fn run_guarded(worker: &str, job: Job) {
    if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        error!("任务执行时发生panic（{}）：{}", worker, reason);
    }
}

async fn worker_loop(
    name: String,
    first: Option<Job>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    active: Arc<AtomicUsize>,
    keep_alive: Option<Duration>,
) {
    if let Some(job) = first {
        run_guarded(&name, job).await;
    }

    loop {
        let next = async { receiver.lock().await.recv().await };
        let job = match keep_alive {
            None => next.await,
            Some(idle) => match tokio::time::timeout(idle, next).await {
                Ok(job) => job,
                Err(_) => {
                    debug!("工作者 {} 空闲超时退出", name);
                    break;
                }
            },
        };
        let Some(job) = job else { break };
        run_guarded(&name, job).await;
    }
    active.fetch_sub(1, Ordering::SeqCst);
}

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use super::store::TaskStore;
use super::task::{Task, TaskStatus};
use crate::common::config::ProgressConfig;

/// 推送给订阅者的一次进度快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub code: u16,
    pub task_id: String,
    pub progress: u8,
    pub completed_count: u32,
    pub failed_count: u32,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub finished: bool,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn from_task(task: &Task) -> Self {
        Self {
            code: 200,
            task_id: task.task_id.clone(),
            progress: task.progress,
            completed_count: task.completed_count,
            failed_count: task.failed_count,
            downloaded_bytes: task.downloaded_bytes,
            total_bytes: task.total_bytes,
            finished: task.finished,
            cancelled: task.cancelled,
            status: Some(task.status),
            message: task.message.clone(),
        }
    }

    pub fn not_found(task_id: &str) -> Self {
        Self {
            code: 404,
            task_id: task_id.to_string(),
            progress: 0,
            completed_count: 0,
            failed_count: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            finished: false,
            cancelled: false,
            status: None,
            message: Some("任务不存在".into()),
        }
    }
}

/// 去重用的键：进度与终态标记
type Fingerprint = (u8, bool, bool, bool);

fn fingerprint(task: &Task) -> Fingerprint {
    (
        task.progress,
        task.finished,
        task.cancelled,
        task.status == TaskStatus::Interrupted,
    )
}

struct Subscription {
    tasks: Arc<TaskStore>,
    config: ProgressConfig,
    task_id: String,
    last: Option<Fingerprint>,
    polled: bool,
    done: bool,
}

/// 轮询任务存储，生成去重后的进度事件流
#[derive(Clone)]
pub struct ProgressPublisher {
    tasks: Arc<TaskStore>,
    config: ProgressConfig,
}

impl ProgressPublisher {
    pub fn new(tasks: Arc<TaskStore>, config: ProgressConfig) -> Self {
        Self { tasks, config }
    }

    /// 事件流在发出终态快照（或任务不存在）后结束；每个订阅者各自去重
    pub fn subscribe(&self, task_id: &str) -> BoxStream<'static, ProgressEvent> {
        let subscription = Subscription {
            tasks: self.tasks.clone(),
            config: self.config.clone(),
            task_id: task_id.to_string(),
            last: None,
            polled: false,
            done: false,
        };

        stream::unfold(subscription, |mut sub| async move {
            if sub.done {
                return None;
            }
            loop {
                if sub.polled {
                    let progress = sub.last.map_or(0, |(progress, ..)| progress);
                    tokio::time::sleep(sub.config.interval_for(progress)).await;
                }
                sub.polled = true;

                let Some(task) = sub.tasks.get(&sub.task_id) else {
                    sub.done = true;
                    let event = ProgressEvent::not_found(&sub.task_id);
                    return Some((event, sub));
                };

                let current = fingerprint(&task);
                if sub.last != Some(current) {
                    sub.last = Some(current);
                    sub.done = task.is_terminal();
                    return Some((ProgressEvent::from_task(&task), sub));
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::TransferProgress;
    use std::path::PathBuf;
    use std::time::Duration;

    fn store_with_task() -> Arc<TaskStore> {
        let store = Arc::new(TaskStore::new(10, Duration::from_secs(60)));
        let mut task = Task::new("t1".into(), "u1".into(), vec![PathBuf::from("/a")], false, 6);
        task.total_bytes = 100;
        store.save(task);
        store
    }

    #[tokio::test]
    async fn test_unknown_task_emits_single_not_found() {
        let store = Arc::new(TaskStore::new(10, Duration::from_secs(60)));
        let publisher = ProgressPublisher::new(store, ProgressConfig::default());
        let events: Vec<_> = publisher.subscribe("missing").collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, 404);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_and_terminal() {
        let store = store_with_task();
        let publisher = ProgressPublisher::new(store.clone(), ProgressConfig::default());
        let mut events = publisher.subscribe("t1");

        let first = events.next().await.unwrap();
        assert_eq!(first.progress, 0);

        let writer = tokio::spawn({
            let store = store.clone();
            async move {
                for downloaded in [30, 30, 30, 70, 100] {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    store.update("t1", |t| {
                        t.apply_progress(&TransferProgress {
                            downloaded_bytes: downloaded,
                            ..Default::default()
                        })
                    });
                }
                store.update("t1", |t| t.mark_completed(None, 100));
            }
        });

        let rest: Vec<_> = events.collect().await;
        writer.await.unwrap();

        let progresses: Vec<u8> = rest.iter().map(|e| e.progress).collect();
        for pair in progresses.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        let last = rest.last().unwrap();
        assert!(last.finished);
        assert_eq!(last.progress, 100);

        // 没有连续重复的事件
        let mut all = vec![first];
        all.extend(rest);
        for pair in all.windows(2) {
            assert_ne!(
                (pair[0].progress, pair[0].finished, pair[0].cancelled),
                (pair[1].progress, pair[1].finished, pair[1].cancelled)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_ends_stream() {
        let store = store_with_task();
        store.update("t1", |t| t.mark_cancelled());
        let publisher = ProgressPublisher::new(store, ProgressConfig::default());
        let events: Vec<_> = publisher.subscribe("t1").collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_are_independent() {
        let store = store_with_task();
        let publisher = ProgressPublisher::new(store.clone(), ProgressConfig::default());
        let mut a = publisher.subscribe("t1");
        let mut b = publisher.subscribe("t1");
        assert_eq!(a.next().await.unwrap().progress, 0);

        store.update("t1", |t| t.mark_completed(None, 0));
        assert!(a.next().await.unwrap().finished);
        // b 还没有收到过任何事件，第一次就看到终态
        let first_b = b.next().await.unwrap();
        assert!(first_b.finished);
        assert!(b.next().await.is_none());
    }
}

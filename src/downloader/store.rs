use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::task::Task;

struct CachedTask {
    task: Task,
    cached_at: Instant,
}

/// 有容量上限和过期时间的读缓存
struct TaskCache {
    entries: DashMap<String, CachedTask>,
    capacity: usize,
    ttl: Duration,
}

impl TaskCache {
    fn get(&self, task_id: &str) -> Option<Task> {
        {
            let entry = self.entries.get(task_id)?;
            if entry.cached_at.elapsed() < self.ttl {
                return Some(entry.task.clone());
            }
        }
        self.entries
            .remove_if(task_id, |_, entry| entry.cached_at.elapsed() >= self.ttl);
        None
    }

    fn put(&self, task: &Task) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&task.task_id) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            task.task_id.clone(),
            CachedTask {
                task: task.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.cached_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

/// 任务存储：主存储 + 读缓存，两者的内容始终一致
pub struct TaskStore {
    tasks: DashMap<String, Task>,
    cache: TaskCache,
}

impl TaskStore {
    pub fn new(cache_capacity: usize, cache_ttl: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            cache: TaskCache {
                entries: DashMap::new(),
                capacity: cache_capacity,
                ttl: cache_ttl,
            },
        }
    }

    /// 缓存只在持有主存储条目锁时写入
    pub fn save(&self, task: Task) {
        let entry = self.tasks.entry(task.task_id.clone()).insert(task);
        self.cache.put(entry.value());
    }

    /// 先查缓存，未命中再查主存储；不存在返回 None
    pub fn get(&self, task_id: &str) -> Option<Task> {
        if let Some(task) = self.cache.get(task_id) {
            return Some(task);
        }
        let entry = self.tasks.get(task_id)?;
        self.cache.put(entry.value());
        Some(entry.value().clone())
    }

    /// 原地修改任务，修改后同步刷新缓存
    pub fn update<R>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut entry = self.tasks.get_mut(task_id)?;
        let result = f(entry.value_mut());
        self.cache.put(entry.value());
        Some(result)
    }

    pub fn remove(&self, task_id: &str) -> Option<Task> {
        let removed = self.tasks.remove(task_id).map(|(_, task)| task);
        self.cache.entries.remove(task_id);
        removed
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// 所有任务的快照，按创建时间排序
    pub fn list_all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!("当前共有 {} 个任务", tasks.len());
        tasks
    }
}

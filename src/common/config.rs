use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 服务配置（JSON 文件，可缺省字段）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 服务器存储目录，输出为 store_dir/{userId}/{taskId}/...
    pub store_dir: PathBuf,
    pub breakpoint_dir: PathBuf,
    /// 源盘与目标盘的最小剩余空间
    pub min_free_space: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/tmp/download/server"),
            breakpoint_dir: PathBuf::from("/tmp/download/breakpoint"),
            min_free_space: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub buffer_size: usize,
    pub shard_size: u64,
    /// 前端直传限速（字节/秒），≤0 不限速
    pub rate_limit: i64,
    /// 服务器存储限速（字节/秒），≤0 不限速
    pub server_rate_limit: i64,
    pub default_compression_level: u32,
    pub discard_partial_on_cancel: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            shard_size: 5 * 1024 * 1024,
            rate_limit: 0,
            server_rate_limit: 0,
            default_compression_level: 6,
            discard_partial_on_cancel: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub core_workers: usize,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub keep_alive_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_workers: 10,
            max_workers: 50,
            queue_capacity: 200,
            keep_alive_secs: 60,
            shutdown_timeout_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 2000,
            ttl_secs: 30 * 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub fast_interval_ms: u64,
    pub slow_interval_ms: u64,
    /// 进度低于该值时使用较短的轮询间隔
    pub slow_threshold: u8,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 500,
            slow_interval_ms: 1000,
            slow_threshold: 50,
        }
    }
}

impl ProgressConfig {
    pub fn interval_for(&self, progress: u8) -> Duration {
        if progress < self.slow_threshold {
            Duration::from_millis(self.fast_interval_ms)
        } else {
            Duration::from_millis(self.slow_interval_ms)
        }
    }
}

impl ServiceConfig {
    /// 读取配置文件；未指定或文件不存在时使用默认值
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            debug!("未指定配置文件，使用默认配置");
            return Ok(Self::default());
        };
        if !path.exists() {
            info!("配置文件不存在，使用默认配置: {}", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&content)?;
        info!("已加载配置文件: {}", path.display());
        Ok(config)
    }
}

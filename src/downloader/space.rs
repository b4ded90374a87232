use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::error::{DownloadError, Result};

/// 查询某个路径所在磁盘的可用空间
pub trait SpaceProbe: Send + Sync {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

pub struct Fs2SpaceProbe;

impl SpaceProbe for Fs2SpaceProbe {
    fn available(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(existing_ancestor(path))
    }
}

/// 目标目录可能还没创建，向上找到第一个存在的目录
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// 剩余空间低于 min_free 时返回 InsufficientSpace；查询失败只记日志不拦截
pub fn check_free_space(probe: &dyn SpaceProbe, path: &Path, min_free: u64) -> Result<()> {
    match probe.available(path) {
        Ok(available) if available < min_free => Err(DownloadError::InsufficientSpace {
            path: path.to_path_buf(),
            available,
            required: min_free,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("查询磁盘空间失败：{}，{}", path.display(), e);
            Ok(())
        }
    }
}

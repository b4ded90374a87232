use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::time::{Instant, Sleep};

/// 软限速：保证从开始到现在的平均速率不超过 bytes_per_second
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_second: i64,
    started: Instant,
    written: u64,
}

impl RateLimiter {
    pub fn new(bytes_per_second: i64) -> Self {
        Self {
            bytes_per_second,
            started: Instant::now(),
            written: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_second <= 0
    }

    /// 再写入 len 字节前需要等待的时间
    pub fn delay_for(&self, len: usize) -> Option<Duration> {
        if self.is_unlimited() {
            return None;
        }
        let expected_nanos =
            (self.written as u128 + len as u128) * 1_000_000_000 / self.bytes_per_second as u128;
        let expected = Duration::from_nanos(expected_nanos.min(u64::MAX as u128) as u64);
        let elapsed = self.started.elapsed();
        (expected > elapsed).then(|| expected - elapsed)
    }

    pub fn record(&mut self, len: usize) {
        self.written += len as u64;
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

/// 带限速的输出流包装
pub struct RateLimitedWriter<W> {
    inner: W,
    limiter: RateLimiter,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<W> RateLimitedWriter<W> {
    pub fn new(inner: W, bytes_per_second: i64) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(bytes_per_second),
            sleep: None,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RateLimitedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some(sleep) = this.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                this.sleep = None;
                break;
            }
            match this.limiter.delay_for(buf.len()) {
                Some(delay) if !delay.is_zero() => {
                    this.sleep = Some(Box::pin(tokio::time::sleep(delay)));
                }
                _ => break,
            }
        }

        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.limiter.record(written);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::trace;

use crate::config::MAX_SEND_CHUNK_SIZE;
use crate::error::CatsError;
use crate::wire::HEADER_SEPARATOR;

/// Buffered reading side of a connection. Every read suspends, and every
///  read is guarded by the idle timeout: as long as bytes keep arriving the
///  connection stays alive, however large the frame.
pub struct FrameReader<R> {
    stream: BufReader<R>,
    idle_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> FrameReader<R> {
        FrameReader {
            stream: BufReader::new(stream),
            idle_timeout: None,
        }
    }

    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    pub async fn read_u8(&mut self) -> Result<u8, CatsError> {
        guard(self.idle_timeout, self.stream.read_u8()).await
    }

    pub async fn read_u16(&mut self) -> Result<u16, CatsError> {
        guard(self.idle_timeout, self.stream.read_u16()).await
    }

    pub async fn read_u32(&mut self) -> Result<u32, CatsError> {
        guard(self.idle_timeout, self.stream.read_u32()).await
    }

    pub async fn read_u64(&mut self) -> Result<u64, CatsError> {
        guard(self.idle_timeout, self.stream.read_u64()).await
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, CatsError> {
        let mut buf = vec![0u8; n];
        guard(self.idle_timeout, self.stream.read_exact(&mut buf)).await?;
        Ok(buf)
    }

    /// One partial read into `buf`, for spooling large payloads without
    ///  materializing them. Returns the number of bytes read; 0 means EOF.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, CatsError> {
        guard(self.idle_timeout, self.stream.read(buf)).await
    }

    /// Reads until the `\x00\x00` header separator, returning the bytes
    ///  including the separator. Not finding the separator within `max`
    ///  bytes is a protocol error.
    pub async fn read_until_separator(&mut self, max: usize) -> Result<Vec<u8>, CatsError> {
        let mut buf = Vec::new();
        loop {
            if buf.len() >= max {
                return Err(CatsError::protocol(
                    "message headers exceed the declared body length",
                ));
            }
            let byte = guard(self.idle_timeout, self.stream.read_u8()).await?;
            buf.push(byte);
            if buf.len() >= 2 && buf[buf.len() - 2..] == HEADER_SEPARATOR[..] {
                return Ok(buf);
            }
        }
    }
}

async fn guard<T>(
    timeout: Option<Duration>,
    op: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T, CatsError> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CatsError::IdleTimeout),
        },
        None => Ok(op.await?),
    }
}

/// Writing side of a connection. All frames go through this behind the
///  per-connection write lock; payload bytes additionally go through the
///  pacer so the emitted byte rate stays under the peer's download speed.
pub struct FrameWriter<W> {
    stream: W,
    pacer: Pacer,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W, download_speed: u32) -> FrameWriter<W> {
        FrameWriter {
            stream,
            pacer: Pacer::new(download_speed),
        }
    }

    pub fn set_speed(&mut self, bytes_per_sec: u32) {
        self.pacer.set_limit(bytes_per_sec);
    }

    pub fn speed(&self) -> u32 {
        self.pacer.limit
    }

    /// Unpaced write, for the frame type byte and fixed headers.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), CatsError> {
        self.stream.write_all(buf).await?;
        Ok(())
    }

    /// Rate-limited payload write. The buffer is partitioned so no
    ///  one-second window carries more than the configured limit.
    pub async fn write_paced(&mut self, buf: &[u8]) -> Result<(), CatsError> {
        let mut left = buf;
        while !left.is_empty() {
            let max = self.pacer.max_chunk();
            let n = left.len().min(max);
            self.pacer.admit(n).await;
            self.stream.write_all(&left[..n]).await?;
            left = &left[n..];
        }
        Ok(())
    }

    /// Streams a spooled payload file through the pacer.
    pub async fn write_file_paced(&mut self, path: &std::path::Path, len: u64) -> Result<(), CatsError> {
        let mut fh = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; (1usize << 20).min(self.pacer.max_chunk())];
        let mut left = len;
        while left > 0 {
            let want = buf.len().min(left as usize);
            let n = fh.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(CatsError::protocol("spooled payload shorter than declared"));
            }
            self.write_paced(&buf[..n]).await?;
            left -= n as u64;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), CatsError> {
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), CatsError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Advisory rate limiter over one-second windows. Never drops writes, only
///  delays them until the current window has room again.
struct Pacer {
    /// bytes per second, 0 = unlimited
    limit: u32,
    window_start: Instant,
    sent_in_window: usize,
}

impl Pacer {
    fn new(limit: u32) -> Pacer {
        Pacer {
            limit,
            window_start: Instant::now(),
            sent_in_window: 0,
        }
    }

    fn set_limit(&mut self, limit: u32) {
        trace!("download speed set to {} bytes/sec", limit);
        self.limit = limit;
        self.window_start = Instant::now();
        self.sent_in_window = 0;
    }

    fn max_chunk(&self) -> usize {
        if self.limit == 0 {
            MAX_SEND_CHUNK_SIZE
        } else {
            self.limit as usize
        }
    }

    /// Waits until `n` more bytes fit into the current one-second window.
    ///  `n` must not exceed `max_chunk()`.
    async fn admit(&mut self, n: usize) {
        if self.limit == 0 {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.sent_in_window = 0;
        }
        if self.sent_in_window + n > self.limit as usize {
            let next_window = self.window_start + Duration::from_secs(1);
            tokio::time::sleep_until(next_window).await;
            self.window_start = next_window;
            self.sent_in_window = 0;
        }
        self.sent_in_window += n;
    }
}

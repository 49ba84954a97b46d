//! Byte pumps.
//!
//! A pump copies one stream into another until the source reaches
//! end-of-stream or the destination refuses a write. Bidirectional pipes are
//! two independent pumps, one per direction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// Copy buffer size (16 KB)
pub const BUFFER_SIZE: usize = 16 * 1024;

/// How long the remote side may keep talking after the local side closed
pub const LOCAL_CLOSE_DRAIN: Duration = Duration::from_millis(500);

/// How a pump finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Source reached end-of-stream; the destination was shut down.
    Eof,
    /// Read or write failed.
    Broken,
}

/// Result of a finished pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub bytes: u64,
    pub end: PumpEnd,
}

/// Copy `src` into `dst` until either side gives up.
///
/// Every chunk is flushed before the next read so interactive streams
/// (child stdio, desktop protocols) are not held back.
pub async fn pump<R, W>(label: &str, src: R, dst: W) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pump_counted(label, src, dst, &AtomicU64::new(0)).await
}

/// [`pump`] that also publishes its running byte count to `copied`.
async fn pump_counted<R, W>(label: &str, mut src: R, mut dst: W, copied: &AtomicU64) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break PumpEnd::Eof,
            Ok(n) => n,
            Err(e) => {
                debug!("[{}] read ended: {}", label, e);
                break PumpEnd::Broken;
            }
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            debug!("[{}] write ended: {}", label, e);
            break PumpEnd::Broken;
        }
        if let Err(e) = dst.flush().await {
            debug!("[{}] flush ended: {}", label, e);
            break PumpEnd::Broken;
        }
        bytes += n as u64;
        copied.store(bytes, Ordering::Relaxed);
    };

    if end == PumpEnd::Eof {
        let _ = dst.shutdown().await;
    }
    debug!("[{}] pump finished after {} bytes ({:?})", label, bytes, end);

    PumpReport { bytes, end }
}

/// Byte totals of a finished bidirectional pipe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// Bytes copied from the local side to the remote side
    pub sent: u64,
    /// Bytes copied from the remote side to the local side
    pub received: u64,
    /// True when either direction ended on an error rather than EOF
    pub broken: bool,
}

/// Aborts the pump task when the owning pipe future is dropped
struct PumpTask(JoinHandle<PumpReport>);

impl Drop for PumpTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Pipe `local` and `remote` into each other with one task per direction.
///
/// Resolves once the local connection is done with:
///
/// * If one direction breaks, the other is aborted, which drops its halves
///   and closes both streams.
/// * If the local side reaches EOF, the remote side gets
///   [`LOCAL_CLOSE_DRAIN`] to finish sending before it is cut off.
/// * If the remote side reaches EOF first, local data keeps flowing until
///   the local side closes too.
///
/// Dropping the returned future aborts both directions.
pub async fn pipe<L, R>(label: &str, local: L, remote: R) -> PipeStats
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local_rd, local_wr) = tokio::io::split(local);
    let (remote_rd, remote_wr) = tokio::io::split(remote);

    let up_bytes = Arc::new(AtomicU64::new(0));
    let down_bytes = Arc::new(AtomicU64::new(0));

    let up_label = format!("{} local->remote", label);
    let down_label = format!("{} remote->local", label);
    let counter = up_bytes.clone();
    let mut up = PumpTask(tokio::spawn(async move {
        pump_counted(&up_label, local_rd, remote_wr, &counter).await
    }));
    let counter = down_bytes.clone();
    let mut down = PumpTask(tokio::spawn(async move {
        pump_counted(&down_label, remote_rd, local_wr, &counter).await
    }));

    let broken = PumpReport { bytes: 0, end: PumpEnd::Broken };
    let (up_first, first) = tokio::select! {
        res = &mut up.0 => (true, res.unwrap_or(broken)),
        res = &mut down.0 => (false, res.unwrap_or(broken)),
    };
    let (rest, rest_bytes) = if up_first { (&mut down.0, &down_bytes) } else { (&mut up.0, &up_bytes) };

    let second = if first.end == PumpEnd::Broken {
        rest.abort();
        PumpReport {
            bytes: rest_bytes.load(Ordering::Relaxed),
            end: PumpEnd::Broken,
        }
    } else if up_first {
        match timeout(LOCAL_CLOSE_DRAIN, &mut *rest).await {
            Ok(res) => res.unwrap_or(broken),
            Err(_) => {
                debug!("[{}] remote still open {:?} after local close; cutting off", label, LOCAL_CLOSE_DRAIN);
                rest.abort();
                PumpReport {
                    bytes: rest_bytes.load(Ordering::Relaxed),
                    end: PumpEnd::Eof,
                }
            }
        }
    } else {
        rest.await.unwrap_or(broken)
    };

    let (up_report, down_report) = if up_first { (first, second) } else { (second, first) };
    PipeStats {
        sent: up_report.bytes,
        received: down_report.bytes,
        broken: first.end == PumpEnd::Broken || second.end == PumpEnd::Broken,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_copies_until_eof() {
        let src: &[u8] = b"hello desktop";
        let mut dst = Vec::new();
        let report = pump("test", src, &mut dst).await;
        assert_eq!(report, PumpReport { bytes: 13, end: PumpEnd::Eof });
        assert_eq!(dst, b"hello desktop");
    }

    #[tokio::test]
    async fn test_pipe_round_trip() {
        let (local, mut local_peer) = tokio::io::duplex(64);
        let (remote, mut remote_peer) = tokio::io::duplex(64);

        let handle = tokio::spawn(async move { pipe("test", local, remote).await });

        local_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        local_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(local_peer);
        drop(remote_peer);

        let stats = handle.await.unwrap();
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.received, 5);
    }

    #[tokio::test]
    async fn test_pipe_ends_when_local_closes_and_remote_stays_silent() {
        let (local, mut local_peer) = tokio::io::duplex(64);
        let (remote, mut remote_peer) = tokio::io::duplex(64);

        let handle = tokio::spawn(async move { pipe("test", local, remote).await });

        remote_peer.write_all(b"frame").await.unwrap();
        let mut buf = [0u8; 5];
        local_peer.read_exact(&mut buf).await.unwrap();
        drop(local_peer);

        let stats = tokio::time::timeout(LOCAL_CLOSE_DRAIN + Duration::from_secs(2), handle)
            .await
            .expect("pipe kept running after the local side closed")
            .unwrap();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.received, 5);
        assert!(!stats.broken);

        // The remote side sees the close once its half is dropped.
        let mut rest = Vec::new();
        remote_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_pipe_keeps_local_flowing_after_remote_eof() {
        let (local, mut local_peer) = tokio::io::duplex(64);
        let (remote, mut remote_peer) = tokio::io::duplex(64);

        let handle = tokio::spawn(async move { pipe("test", local, remote).await });

        remote_peer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        local_peer.read_to_end(&mut rest).await.unwrap();

        local_peer.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 4];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");

        drop(local_peer);
        let stats = handle.await.unwrap();
        assert_eq!(stats.sent, 4);
        assert!(!stats.broken);
    }
}

//! Best-effort traffic mirror
//!
//! A mirror sink dials its target in the background and drains a bounded
//! queue of chunks into it. When the mirror falls a full queue behind (slow
//! reader, or a dial still pending) the sink gives up on it instead of
//! holding up the primary connection or buffering without limit.

use bytes::Bytes;
use portsforward_config::MirrorTarget;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pump::Direction;

/// Chunks a mirror may fall behind before it is abandoned
pub const MIRROR_QUEUE_CHUNKS: usize = 64;

/// Sending end of a per-connection mirror
pub struct MirrorSink {
    tx: mpsc::Sender<Bytes>,
    direction: Direction,
    connection_id: u64,
}

impl MirrorSink {
    /// Start mirroring to `target`
    ///
    /// The returned handle resolves to the number of bytes the mirror
    /// accepted once the sink is dropped and the queue is drained.
    pub fn spawn(
        target: MirrorTarget,
        direction: Direction,
        connection_id: u64,
    ) -> (Self, JoinHandle<u64>) {
        let (tx, rx) = mpsc::channel(MIRROR_QUEUE_CHUNKS);
        let handle = tokio::spawn(run_mirror(target, direction, connection_id, rx));
        let sink = Self {
            tx,
            direction,
            connection_id,
        };
        (sink, handle)
    }

    /// Queue a copy of `data` without waiting
    ///
    /// Returns `false` once the mirror is gone or its queue is full; the
    /// caller should drop the sink then, which lets the mirror task flush
    /// what it already holds and close.
    pub fn send(&self, data: &[u8]) -> bool {
        match self.tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "{} mirror is {} chunks behind, dropping it for connection {}",
                    self.direction, MIRROR_QUEUE_CHUNKS, self.connection_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

async fn run_mirror(
    target: MirrorTarget,
    direction: Direction,
    connection_id: u64,
    mut rx: mpsc::Receiver<Bytes>,
) -> u64 {
    let mut stream = match TcpStream::connect(target.addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Connection to {} mirror {} failed. Skipping mirror for connection {}. Error: {}",
                direction, target, connection_id, e
            );
            return 0;
        }
    };
    info!(
        "Connected to {} mirror {} for connection {}",
        direction, target, connection_id
    );

    let mut total = 0u64;
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stream.write_all(&chunk).await {
            warn!(
                "Writing to {} mirror {} failed for connection {}: {}",
                direction, target, connection_id, e
            );
            return total;
        }
        total += chunk.len() as u64;
        debug!("{}: Writing to mirror done, n={}", direction.label(), chunk.len());
    }

    let _ = stream.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_mirror_receives_chunks_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let collector = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let (sink, handle) =
            MirrorSink::spawn(MirrorTarget::new("127.0.0.1", port), Direction::Upstream, 1);
        assert!(sink.send(b"abc"));
        assert!(sink.send(b"def"));
        drop(sink);

        assert_eq!(handle.await.unwrap(), 6);
        let received = tokio::time::timeout(Duration::from_secs(5), collector)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"abcdef");
    }

    #[tokio::test]
    async fn test_unreachable_mirror_gives_up_quietly() {
        // Grab a free port and release it so nothing is listening there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (sink, handle) =
            MirrorSink::spawn(MirrorTarget::new("127.0.0.1", port), Direction::Downstream, 2);
        assert_eq!(handle.await.unwrap(), 0);
        assert!(!sink.send(b"dropped"));
    }

    #[tokio::test]
    async fn test_stalled_mirror_is_abandoned_at_queue_limit() {
        // Accept the mirror connection but never read from it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stalled = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let (sink, _handle) =
            MirrorSink::spawn(MirrorTarget::new("127.0.0.1", port), Direction::Upstream, 3);
        let chunk = vec![0u8; 1024 * 1024];

        let mut queued = 0;
        for _ in 0..256 {
            if !sink.send(&chunk) {
                break;
            }
            queued += 1;
        }

        assert!(queued > 0);
        assert!(queued <= MIRROR_QUEUE_CHUNKS);
        stalled.abort();
    }
}

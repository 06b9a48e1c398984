//! Stream pump: the one-directional copy loop of a forwarded connection
//!
//! Reads up to `buffer_size` bytes at a time from the source, writes them to
//! the destination, and tees each chunk to the optional mirror and data file.
//! When the loop ends, for whatever reason, the pump shuts its writer down and
//! fires the pair's close token so the sibling pump stops too.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::mirror::MirrorSink;
use crate::tap::DataTap;

/// Which way a pump moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Source connection to destination
    Upstream,
    /// Destination back to the source connection
    Downstream,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::Upstream => "src->dst",
            Direction::Downstream => "dst->src",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "upstream"),
            Direction::Downstream => write!(f, "downstream"),
        }
    }
}

/// Copies of the traffic besides the real destination
#[derive(Default)]
pub struct Tee {
    pub mirror: Option<MirrorSink>,
    pub tap: Option<Arc<DataTap>>,
}

#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    pub direction: Direction,
    pub buffer_size: usize,
    pub connection_id: u64,
}

/// Why a pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source reached end of stream
    Eof,
    /// The sibling pump closed the pair first
    Closed,
    /// A read or write failed
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpReport {
    pub direction: Direction,
    pub bytes: u64,
    pub outcome: PumpOutcome,
}

/// Move bytes from `source` to `destination` until either side is done
pub async fn pump<R, W>(
    mut source: R,
    mut destination: W,
    tee: Tee,
    pair_closed: CancellationToken,
    options: PumpOptions,
) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let label = options.direction.label();
    let mut buf = vec![0u8; options.buffer_size.max(1)];
    let mut bytes = 0u64;
    let mut mirror = tee.mirror;

    if mirror.is_some() {
        debug!("{}: initializing with mirror", label);
    } else {
        debug!("{}: initializing without mirror", label);
    }

    let outcome = loop {
        let n = tokio::select! {
            _ = pair_closed.cancelled() => break PumpOutcome::Closed,
            read = source.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{}: EOF received, connection closed", label);
                    break PumpOutcome::Eof;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{}: Breaking stream fwd due to error: {}", label, e);
                    break PumpOutcome::Error(e.to_string());
                }
            },
        };
        let chunk = &buf[..n];
        trace!(
            "{}: forwarding data, n={} (connection {})",
            label,
            n,
            options.connection_id
        );

        let write = async {
            destination.write_all(chunk).await?;
            destination.flush().await
        };
        tokio::select! {
            _ = pair_closed.cancelled() => break PumpOutcome::Closed,
            written = write => {
                if let Err(e) = written {
                    debug!("{}: Breaking stream fwd due to write error: {}", label, e);
                    break PumpOutcome::Error(e.to_string());
                }
            }
        }
        bytes += n as u64;

        if let Some(sink) = &mirror {
            if !sink.send(chunk) {
                debug!("{}: mirror gone, continuing without it", label);
                mirror = None;
            }
        }

        if let Some(tap) = &tee.tap {
            if let Err(e) = tap.append(chunk).await {
                warn!(
                    "{}: Failed to write {} data to {}: {}",
                    label,
                    options.direction,
                    tap.path().display(),
                    e
                );
            }
        }
    };

    let _ = destination.shutdown().await;
    pair_closed.cancel();
    debug!("{}: exiting stream fwd after {} bytes", label, bytes);

    PumpReport {
        direction: options.direction,
        bytes,
        outcome,
    }
}

//! Rate-limited TCP listener

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::rate::{Budget, RateConfig};
use crate::stream::RateLimitedStream;

/// The four budgets applied by a [`RateLimitedListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Shared by every connection of the listener
    pub read_server_rate: RateConfig,
    pub write_server_rate: RateConfig,
    /// Fresh budget for each accepted connection
    pub read_conn_rate: RateConfig,
    pub write_conn_rate: RateConfig,
}

impl ListenerConfig {
    /// Same aggregate rate both ways, same per-connection rate both ways
    pub fn symmetric(server_rate: RateConfig, conn_rate: RateConfig) -> Self {
        Self {
            read_server_rate: server_rate,
            write_server_rate: server_rate,
            read_conn_rate: conn_rate,
            write_conn_rate: conn_rate,
        }
    }

    pub fn unlimited() -> Self {
        Self::symmetric(RateConfig::unlimited(), RateConfig::unlimited())
    }
}

/// Outcome of [`RateLimitedListener::accept`]
pub enum Accepted {
    Connection(RateLimitedStream, SocketAddr),
    /// The listener's cancellation token fired
    Shutdown,
}

/// Listener whose connections are throttled per connection and in aggregate
///
/// Dropping it closes the socket and frees the port.
pub struct RateLimitedListener {
    inner: TcpListener,
    shutdown: CancellationToken,
    config: ListenerConfig,
    read_server: Option<Budget>,
    write_server: Option<Budget>,
}

impl RateLimitedListener {
    pub fn new(shutdown: CancellationToken, config: ListenerConfig, inner: TcpListener) -> Self {
        Self {
            inner,
            shutdown,
            read_server: config.read_server_rate.budget(),
            write_server: config.write_server_rate.budget(),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for the next connection or for cancellation
    ///
    /// Cancellation is reported as [`Accepted::Shutdown`], never as an error,
    /// so callers can tell a reconfiguration from a transport fault.
    pub async fn accept(&self) -> io::Result<Accepted> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Ok(Accepted::Shutdown),
            accepted = self.inner.accept() => {
                let (socket, peer_addr) = accepted?;
                trace!("Wrapping connection from {} with rate limits", peer_addr);
                let stream = self.wrap(socket)?;
                Ok(Accepted::Connection(stream, peer_addr))
            }
        }
    }

    fn wrap(&self, socket: tokio::net::TcpStream) -> io::Result<RateLimitedStream> {
        let read_budgets = self
            .config
            .read_conn_rate
            .budget()
            .into_iter()
            .chain(self.read_server.clone())
            .collect();
        let write_budgets = self
            .config
            .write_conn_rate
            .budget()
            .into_iter()
            .chain(self.write_server.clone())
            .collect();

        RateLimitedStream::new(socket, read_budgets, write_budgets)
    }
}

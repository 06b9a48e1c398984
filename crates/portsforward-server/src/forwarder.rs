//! Connection forwarder
//!
//! Dials the rule's destination for one accepted connection and runs the two
//! stream pumps of the pair until both have finished.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use portsforward_bandwidth::RateLimitedStream;
use portsforward_config::{ForwardRule, ForwardSettings, MirrorTarget};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ServerError;
use crate::mirror::MirrorSink;
use crate::pump::{pump, Direction, PumpOptions, PumpReport, Tee};
use crate::tap::DataTaps;

/// Connection ID generator for log correlation
#[derive(Clone)]
pub struct ConnectionIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one forwarded connection
#[derive(Debug, Clone)]
pub struct ForwardReport {
    pub connection_id: u64,
    pub upstream: PumpReport,
    pub downstream: PumpReport,
}

impl ForwardReport {
    pub fn bytes_up(&self) -> u64 {
        self.upstream.bytes
    }

    pub fn bytes_down(&self) -> u64 {
        self.downstream.bytes
    }
}

/// Relays accepted connections to their destinations
pub struct ConnectionForwarder {
    settings: Arc<ForwardSettings>,
    taps: DataTaps,
    ids: ConnectionIdGenerator,
}

impl ConnectionForwarder {
    pub fn new(settings: Arc<ForwardSettings>, taps: DataTaps) -> Self {
        Self {
            settings,
            taps,
            ids: ConnectionIdGenerator::new(),
        }
    }

    /// Forward one connection, logging instead of returning errors
    ///
    /// A failed dial only drops this connection.
    pub async fn handle(&self, source: RateLimitedStream, peer_addr: SocketAddr, rule: &ForwardRule) {
        match self.forward(source, rule).await {
            Ok(report) => {
                info!(
                    "Connection {} from {} closed ({} bytes up, {} bytes down)",
                    report.connection_id,
                    peer_addr,
                    report.bytes_up(),
                    report.bytes_down()
                );
            }
            Err(e) => error!("{}", failure_message(peer_addr, &e)),
        }
    }

    /// Dial the destination and pump both directions until both are done
    pub async fn forward(
        &self,
        source: RateLimitedStream,
        rule: &ForwardRule,
    ) -> Result<ForwardReport, ServerError> {
        let connection_id = self.ids.generate();
        let address = rule.destination_addr();

        let destination = TcpStream::connect(&address)
            .await
            .map_err(|source| ServerError::DialError {
                address: address.clone(),
                source,
            })?;
        info!(
            "Dialed {} -> {} (connection {})",
            destination.local_addr()?,
            destination.peer_addr()?,
            connection_id
        );

        let (source_read, source_write) = source.into_split();
        let (destination_read, destination_write) = destination.into_split();
        let pair_closed = CancellationToken::new();

        let upstream = tokio::spawn(pump(
            source_read,
            destination_write,
            self.tee(Direction::Upstream, connection_id),
            pair_closed.clone(),
            self.pump_options(Direction::Upstream, connection_id),
        ));
        let downstream = tokio::spawn(pump(
            destination_read,
            source_write,
            self.tee(Direction::Downstream, connection_id),
            pair_closed,
            self.pump_options(Direction::Downstream, connection_id),
        ));

        // The pair is released only after both directions are done
        let (upstream, downstream) = tokio::join!(upstream, downstream);
        let report = ForwardReport {
            connection_id,
            upstream: joined(upstream, Direction::Upstream)?,
            downstream: joined(downstream, Direction::Downstream)?,
        };
        debug!(
            "Connection {} finished: upstream {:?}, downstream {:?}",
            connection_id, report.upstream.outcome, report.downstream.outcome
        );

        Ok(report)
    }

    fn tee(&self, direction: Direction, connection_id: u64) -> Tee {
        let mirror = self.mirror_target(direction).cloned().map(|target| {
            // The mirror task finishes on its own once the pump drops the sink
            let (sink, _handle) = MirrorSink::spawn(target, direction, connection_id);
            sink
        });

        Tee {
            mirror,
            tap: self.taps.for_direction(direction),
        }
    }

    fn mirror_target(&self, direction: Direction) -> Option<&MirrorTarget> {
        match direction {
            Direction::Upstream => self.settings.mirror_up.as_ref(),
            Direction::Downstream => self.settings.mirror_down.as_ref(),
        }
    }

    fn pump_options(&self, direction: Direction, connection_id: u64) -> PumpOptions {
        PumpOptions {
            direction,
            buffer_size: self.settings.buffer_size,
            connection_id,
        }
    }
}

/// Log line for a connection that could not be forwarded
fn failure_message(peer_addr: SocketAddr, err: &ServerError) -> String {
    match err {
        ServerError::DialError { .. } => format!(
            "Connection to destination failed. Skipping connection from {}. Error: {}",
            peer_addr, err
        ),
        other => format!("Forwarding connection from {} failed: {}", peer_addr, other),
    }
}

fn joined(
    result: Result<PumpReport, tokio::task::JoinError>,
    direction: Direction,
) -> Result<PumpReport, ServerError> {
    result.map_err(|e| ServerError::PumpFailed(format!("{} pump: {}", direction, e)))
}

/// Spawn [`ConnectionForwarder::handle`] for one accepted connection
pub(crate) fn spawn_forward(
    forwarder: Arc<ConnectionForwarder>,
    source: RateLimitedStream,
    peer_addr: SocketAddr,
    rule: Arc<ForwardRule>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        forwarder.handle(source, peer_addr, &rule).await;
        drop(permit);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one raw connection and wrap it without limits
    async fn accepted_pair() -> (TcpStream, RateLimitedStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        (
            client,
            RateLimitedStream::new(socket, Vec::new(), Vec::new()).unwrap(),
        )
    }

    #[test]
    fn test_connection_id_generator() {
        let ids = ConnectionIdGenerator::new();
        assert_eq!(ids.generate(), 1);
        assert_eq!(ids.clone().generate(), 2);
        assert_eq!(ids.generate(), 3);
    }

    #[tokio::test]
    async fn test_forward_round_trip() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
            // Wait for the client to go away
            let _ = socket.read(&mut buf).await;
        });

        let forwarder = ConnectionForwarder::new(Arc::new(ForwardSettings::default()), DataTaps::none());
        let rule = ForwardRule::new(1, "127.0.0.1", echo_port, 0);
        let (mut client, source) = accepted_pair().await;

        let forwarding = tokio::spawn(async move { forwarder.forward(source, &rule).await });

        client.write_all(b"abcdef").await.unwrap();
        let mut reply = [0u8; 6];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"abcdef");
        drop(client);

        let report = tokio::time::timeout(Duration::from_secs(5), forwarding)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.bytes_up(), 6);
        assert_eq!(report.bytes_down(), 6);
    }

    #[test]
    fn test_failure_message_names_the_cause() {
        let peer: SocketAddr = "10.0.0.7:40000".parse().unwrap();

        let dial = ServerError::DialError {
            address: "db:5432".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        let message = failure_message(peer, &dial);
        assert!(message.starts_with("Connection to destination failed"));
        assert!(message.contains("db:5432"));

        let pump = ServerError::PumpFailed("upstream pump: task panicked".to_string());
        let message = failure_message(peer, &pump);
        assert!(!message.contains("Connection to destination failed"));
        assert!(message.contains("upstream pump: task panicked"));

        let io = ServerError::IoError(std::io::Error::from(std::io::ErrorKind::NotConnected));
        assert!(failure_message(peer, &io).starts_with("Forwarding connection from 10.0.0.7:40000"));
    }

    #[tokio::test]
    async fn test_refused_destination_is_a_dial_error() {
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let forwarder = ConnectionForwarder::new(Arc::new(ForwardSettings::default()), DataTaps::none());
        let rule = ForwardRule::new(1, "127.0.0.1", closed_port, 0);
        let (_client, source) = accepted_pair().await;

        let err = forwarder.forward(source, &rule).await.unwrap_err();
        assert!(matches!(err, ServerError::DialError { .. }));
    }
}

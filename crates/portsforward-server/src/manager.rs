//! Listener manager
//!
//! Keeps exactly one rate-limited listener per forwarding rule. Every
//! reconfiguration tears the previous listener set down as a whole (through a
//! single cancellation token) and binds a fresh set for the new rules.
//! Connections already in flight are not part of the set and run to
//! completion against their original destination.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portsforward_bandwidth::{Accepted, ListenerConfig, RateConfig, RateLimitedListener};
use portsforward_config::{ForwardRule, ForwardSettings, RuleSet, RuleStore};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::forwarder::{spawn_forward, ConnectionForwarder};
use crate::tap::DataTaps;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Listeners serving one version of the rules
struct ActiveListenerSet {
    shutdown: CancellationToken,
    addrs: Vec<SocketAddr>,
    accept_loops: Vec<JoinHandle<()>>,
}

impl ActiveListenerSet {
    /// Stop accepting and wait until every listener socket is closed
    async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.accept_loops {
            if let Err(e) = handle.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
    }
}

pub struct ListenerManager {
    settings: Arc<ForwardSettings>,
    forwarder: Arc<ConnectionForwarder>,
    store: Arc<RuleStore>,
    active: Mutex<Option<ActiveListenerSet>>,
}

impl ListenerManager {
    pub fn new(settings: Arc<ForwardSettings>, taps: DataTaps) -> Self {
        Self {
            forwarder: Arc::new(ConnectionForwarder::new(settings.clone(), taps)),
            settings,
            store: Arc::new(RuleStore::new()),
            active: Mutex::new(None),
        }
    }

    /// Rules currently being served
    pub fn rule_store(&self) -> Arc<RuleStore> {
        self.store.clone()
    }

    /// Addresses of the bound listeners, in rule order
    pub async fn active_addrs(&self) -> Vec<SocketAddr> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|set| set.addrs.clone())
            .unwrap_or_default()
    }

    /// Source ports currently being listened on
    pub async fn active_ports(&self) -> Vec<u16> {
        self.active_addrs()
            .await
            .into_iter()
            .map(|addr| addr.port())
            .collect()
    }

    /// Replace the whole listener set with one serving `rules`
    ///
    /// A bind failure leaves no listeners running and is returned to the
    /// caller.
    pub async fn reconfigure(&self, rules: RuleSet) -> Result<(), ServerError> {
        let mut active = self.active.lock().await;

        if let Some(previous) = active.take() {
            let count = previous.addrs.len();
            previous.stop().await;
            info!("Stopped {} listener(s) of the previous rule set", count);
        }

        let mut bound = Vec::with_capacity(rules.len());
        for rule in rules.iter() {
            let listener = bind_with_retry(rule.bind_addr()).await?;
            let addr = listener.local_addr()?;
            bound.push((Arc::new(rule.clone()), listener, addr));
        }

        self.store.replace(rules);

        let shutdown = CancellationToken::new();
        let mut set = ActiveListenerSet {
            shutdown: shutdown.clone(),
            addrs: Vec::with_capacity(bound.len()),
            accept_loops: Vec::with_capacity(bound.len()),
        };

        for (rule, listener, addr) in bound {
            let listener =
                RateLimitedListener::new(shutdown.clone(), self.listener_config(&rule), listener);
            set.addrs.push(addr);

            let limit = self
                .settings
                .max_connections_per_rule
                .map(|max| Arc::new(Semaphore::new(max)));
            set.accept_loops.push(tokio::spawn(accept_loop(
                listener,
                rule,
                self.forwarder.clone(),
                limit,
                shutdown.clone(),
            )));
        }

        info!("Serving {} forwarding rule(s)", set.addrs.len());
        *active = Some(set);
        Ok(())
    }

    /// Stop every listener; in-flight connections keep running
    pub async fn shutdown(&self) {
        if let Some(set) = self.active.lock().await.take() {
            set.stop().await;
            info!("All listeners stopped");
        }
    }

    fn listener_config(&self, rule: &ForwardRule) -> ListenerConfig {
        let server = self.settings.server_rate;
        let per_conn = rule.bandwidth_bytes_per_sec();
        ListenerConfig::symmetric(
            RateConfig::new(server.bytes_per_sec, server.burst),
            RateConfig::new(per_conn, per_conn),
        )
    }
}

async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    // A port released by the previous rule set can take a moment to free up
    for attempt in 1..=3 {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Successfully bound to {} on attempt {}/3", addr, attempt);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Port {} is in use (attempt {}/3), retrying in 1 second...",
                    addr.port(),
                    attempt
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(ServerError::BindError {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(ServerError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: "Address in use after 3 retry attempts".to_string(),
    })
}

/// Delay before the accept after `current`, doubling up to the cap
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(ACCEPT_BACKOFF_MAX)
}

async fn accept_loop(
    listener: RateLimitedListener,
    rule: Arc<ForwardRule>,
    forwarder: Arc<ConnectionForwarder>,
    limit: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
) {
    info!("Forwarding {}", rule);
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        let permit = match &limit {
            Some(semaphore) => tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        debug!("Listening for connection on port {}", rule.source_port);
        match listener.accept().await {
            Ok(Accepted::Connection(stream, peer_addr)) => {
                backoff = ACCEPT_BACKOFF_MIN;
                info!("Got connection {} -> {}", peer_addr, stream.local_addr());
                spawn_forward(forwarder.clone(), stream, peer_addr, rule.clone(), permit);
            }
            Ok(Accepted::Shutdown) => break,
            Err(e) => {
                error!(
                    "Failed to accept connection on port {}: {}",
                    rule.source_port, e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff);
            }
        }
    }

    info!("Stopped listening on port {}", rule.source_port);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ListenerManager {
        ListenerManager::new(Arc::new(ForwardSettings::default()), DataTaps::none())
    }

    #[tokio::test]
    async fn test_empty_rules_bind_nothing() {
        let manager = manager();
        manager.reconfigure(RuleSet::default()).await.unwrap();
        assert!(manager.active_addrs().await.is_empty());
        assert!(manager.rule_store().load().is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        // Occupy a port so the rule cannot bind it
        let blocker = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let manager = manager();
        let rules = RuleSet::new(vec![ForwardRule::new(port, "127.0.0.1", 9, 0)]);
        let err = manager.reconfigure(rules).await.unwrap_err();

        assert!(matches!(err, ServerError::BindError { port: p, .. } if p == port));
        assert!(manager.active_addrs().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_ports() {
        let manager = manager();
        let rules = RuleSet::new(vec![ForwardRule::new(0, "127.0.0.1", 9, 0)]);
        manager.reconfigure(rules).await.unwrap();

        let addrs = manager.active_addrs().await;
        assert_eq!(addrs.len(), 1);
        assert_eq!(manager.active_ports().await, vec![addrs[0].port()]);

        manager.shutdown().await;
        assert!(manager.active_addrs().await.is_empty());
        // The port can be bound again right away
        TcpListener::bind(addrs[0]).await.unwrap();
    }

    #[test]
    fn test_accept_backoff_doubles_up_to_cap() {
        let mut backoff = ACCEPT_BACKOFF_MIN;
        let mut steps = vec![backoff];
        for _ in 0..6 {
            backoff = next_backoff(backoff);
            steps.push(backoff);
        }

        let millis: Vec<u128> = steps.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn test_listener_config_uses_rule_bandwidth() {
        let manager = manager();
        let config = manager.listener_config(&ForwardRule::new(1, "h", 2, 3));
        assert_eq!(config.read_conn_rate, RateConfig::new(3072, 3072));
        assert_eq!(config.write_server_rate.bytes_per_sec, 100_000 * 1024);

        let unlimited = manager.listener_config(&ForwardRule::new(1, "h", 2, 0));
        assert!(unlimited.write_conn_rate.is_unlimited());
    }
}

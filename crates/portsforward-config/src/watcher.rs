//! Rules file watcher
//!
//! Loads the rules file once, then re-checks its size and modification time on
//! every poll tick. Filesystem notifications (when the platform provides them)
//! only wake the check early; the decision to reload is always the same
//! size/mtime comparison, so an untouched file is never re-parsed.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::rule::{ensure_rules_file, parse_rules, RuleSet};
use crate::settings::ForwardSettings;

/// Delay between a change notification and the stat, so writers can finish
const NOTIFY_SETTLE: Duration = Duration::from_millis(100);

/// Size and modification time of the rules file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileFingerprint {
    pub async fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

/// Watches the rules file and reports every new rule set
pub struct ConfigWatcher {
    settings: Arc<ForwardSettings>,
    last_seen: Option<FileFingerprint>,
    last_rules: Option<RuleSet>,
}

impl ConfigWatcher {
    pub fn new(settings: Arc<ForwardSettings>) -> Self {
        Self {
            settings,
            last_seen: None,
            last_rules: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.settings.rules_path
    }

    /// Read (seeding if needed) and parse the rules file
    pub async fn load(&mut self) -> Result<RuleSet, ConfigError> {
        let fingerprint = FileFingerprint::of(&self.settings.rules_path).await.ok();
        self.read_rules(fingerprint).await
    }

    /// Parse the file and remember `fingerprint`, taken before the read
    ///
    /// An edit landing after the stat leaves a stale fingerprint behind, so
    /// the next poll re-reads the file instead of missing the edit.
    async fn read_rules(
        &mut self,
        fingerprint: Option<FileFingerprint>,
    ) -> Result<RuleSet, ConfigError> {
        let content =
            ensure_rules_file(&self.settings.rules_path, &self.settings.default_rule).await?;
        let rules = parse_rules(&content);
        self.last_seen = fingerprint;
        self.last_rules = Some(rules.clone());
        Ok(rules)
    }

    /// Re-parse the file if its size or modification time moved
    ///
    /// Returns `None` when nothing changed, when the new content parses to the
    /// rules already delivered, or when the check failed; failures are
    /// retried on the next call.
    pub async fn poll_once(&mut self) -> Option<RuleSet> {
        let current = match FileFingerprint::of(&self.settings.rules_path).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                debug!("Failed to stat {:?}: {}", self.settings.rules_path, e);
                return None;
            }
        };

        if self.last_seen == Some(current) {
            return None;
        }

        info!("{} changed.", self.settings.rules_path.display());

        let previous = self.last_rules.take();
        match self.read_rules(Some(current)).await {
            Ok(rules) if previous.as_ref() == Some(&rules) => {
                debug!("Rules unchanged, nothing to apply");
                None
            }
            Ok(rules) => Some(rules),
            Err(e) => {
                warn!("Failed to reload rules: {}", e);
                self.last_rules = previous;
                None
            }
        }
    }

    /// Deliver the initial rule set, then every change, to `on_change`
    ///
    /// Runs until `shutdown` fires. An error from `on_change` ends the watch
    /// and is returned to the caller.
    pub async fn run<F, Fut, E>(
        mut self,
        shutdown: CancellationToken,
        mut on_change: F,
    ) -> Result<(), ConfigError>
    where
        F: FnMut(RuleSet) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let rules = self.load().await?;
        info!(
            "Loaded {} forwarding rule(s) from {}",
            rules.len(),
            self.settings.rules_path.display()
        );
        on_change(rules)
            .await
            .map_err(|e| ConfigError::ReloadFailed(e.into()))?;

        // Keep the notifier alive for the lifetime of the loop
        let (_notifier, mut events) = match spawn_notifier(&self.settings.rules_path) {
            Ok((notifier, rx)) => (Some(notifier), Some(rx)),
            Err(e) => {
                debug!("File notifications unavailable, polling only: {}", e);
                (None, None)
            }
        };

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Config watcher stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
                notified = next_event(&mut events) => {
                    if !notified {
                        events = None;
                        continue;
                    }
                    tokio::time::sleep(NOTIFY_SETTLE).await;
                    if let Some(rx) = events.as_mut() {
                        while rx.try_recv().is_ok() {}
                    }
                }
            }

            if let Some(rules) = self.poll_once().await {
                on_change(rules)
                    .await
                    .map_err(|e| ConfigError::ReloadFailed(e.into()))?;
            }
        }
    }
}

/// Wait for the next notification, or forever when there is no notifier
async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<()>>) -> bool {
    match events {
        Some(rx) => rx.recv().await.is_some(),
        None => std::future::pending().await,
    }
}

fn spawn_notifier(
    path: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let file_name = path.file_name().map(|n| n.to_os_string());
    let dir: PathBuf = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else {
            return;
        };
        let touches_rules = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
        if touches_rules {
            let _ = tx.send(());
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::DEFAULT_RULE_LINE;
    use std::sync::Mutex;

    fn settings_for(path: PathBuf, interval: Duration) -> Arc<ForwardSettings> {
        Arc::new(
            ForwardSettings::default()
                .with_rules_path(path)
                .with_poll_interval(interval),
        )
    }

    #[tokio::test]
    async fn test_initial_load_seeds_default_rule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portsforward.conf");
        let mut watcher = ConfigWatcher::new(settings_for(path.clone(), Duration::from_secs(10)));

        let rules = watcher.load().await.unwrap();
        assert_eq!(rules.source_ports(), vec![22001]);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().trim(),
            DEFAULT_RULE_LINE
        );
    }

    #[tokio::test]
    async fn test_unchanged_file_is_not_reparsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portsforward.conf");
        std::fs::write(&path, "8000,localhost,8001,0\n").unwrap();

        let mut watcher = ConfigWatcher::new(settings_for(path, Duration::from_secs(10)));
        watcher.load().await.unwrap();

        assert!(watcher.poll_once().await.is_none());
        assert!(watcher.poll_once().await.is_none());
    }

    #[tokio::test]
    async fn test_changed_file_is_reparsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portsforward.conf");
        std::fs::write(&path, "8000,localhost,8001,0\n").unwrap();

        let mut watcher = ConfigWatcher::new(settings_for(path.clone(), Duration::from_secs(10)));
        watcher.load().await.unwrap();

        std::fs::write(&path, "8000,localhost,8001,0\n8002,localhost,8003,0\n").unwrap();
        let rules = watcher.poll_once().await.expect("change should be detected");
        assert_eq!(rules.source_ports(), vec![8000, 8002]);

        // The new fingerprint is remembered
        assert!(watcher.poll_once().await.is_none());
    }

    #[tokio::test]
    async fn test_edit_after_stat_is_picked_up_next_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portsforward.conf");
        std::fs::write(&path, "8000,localhost,8001,0\n").unwrap();

        let mut watcher = ConfigWatcher::new(settings_for(path.clone(), Duration::from_secs(10)));
        watcher.load().await.unwrap();

        // The file is stat'ed, then edited before it is read
        let stale = FileFingerprint::of(&path).await.unwrap();
        std::fs::write(&path, "8000,localhost,8001,0\n8002,localhost,8003,0\n").unwrap();
        let rules = watcher.read_rules(Some(stale)).await.unwrap();
        assert_eq!(rules.source_ports(), vec![8000, 8002]);
        assert_eq!(watcher.last_seen, Some(stale));

        // The stale fingerprint forces a re-read; identical rules are not re-delivered
        assert!(watcher.poll_once().await.is_none());
        assert_eq!(watcher.last_seen, Some(FileFingerprint::of(&path).await.unwrap()));

        std::fs::write(&path, "9000,localhost,9001,0\n").unwrap();
        let rules = watcher.poll_once().await.unwrap();
        assert_eq!(rules.source_ports(), vec![9000]);
    }

    #[tokio::test]
    async fn test_seeding_blank_file_is_not_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portsforward.conf");
        std::fs::write(&path, "\n").unwrap();

        let mut watcher = ConfigWatcher::new(settings_for(path, Duration::from_secs(10)));
        let rules = watcher.load().await.unwrap();
        assert_eq!(rules.source_ports(), vec![22001]);

        // Our own seed write moved the fingerprint, but the rules are the same
        assert!(watcher.poll_once().await.is_none());
        assert!(watcher.poll_once().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portsforward.conf");
        std::fs::write(&path, "8000,localhost,8001,0\n").unwrap();

        let mut watcher = ConfigWatcher::new(settings_for(path.clone(), Duration::from_secs(10)));
        watcher.load().await.unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(watcher.poll_once().await.is_none());

        std::fs::write(&path, "9000,localhost,9001,0\n").unwrap();
        let rules = watcher.poll_once().await.unwrap();
        assert_eq!(rules.source_ports(), vec![9000]);
    }

    #[tokio::test]
    async fn test_run_delivers_initial_and_changed_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portsforward.conf");
        std::fs::write(&path, "8000,localhost,8001,0\n").unwrap();

        let watcher = ConfigWatcher::new(settings_for(path.clone(), Duration::from_millis(50)));
        let seen: Arc<Mutex<Vec<Vec<u16>>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let handle = {
            let seen = seen.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                watcher
                    .run(shutdown, move |rules: RuleSet| {
                        seen.lock().unwrap().push(rules.source_ports());
                        async { Ok::<(), ConfigError>(()) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(&path, "8000,localhost,8001,0\n8100,localhost,8101,0\n").unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if seen.lock().unwrap().len() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("reload should be delivered");

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], vec![8000]);
        assert_eq!(seen.last().unwrap(), &vec![8000, 8100]);
    }

    #[tokio::test]
    async fn test_handler_error_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portsforward.conf");

        let watcher = ConfigWatcher::new(settings_for(path, Duration::from_millis(50)));
        let result = watcher
            .run(CancellationToken::new(), |_rules: RuleSet| async {
                Err::<(), ConfigError>(ConfigError::Invalid("bind failed".to_string()))
            })
            .await;

        assert!(matches!(result, Err(ConfigError::ReloadFailed(_))));
    }
}

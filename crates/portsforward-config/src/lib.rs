//! Forwarding rules and process configuration
//!
//! Parses the `portsforward.conf` rule file, holds the current rule set behind
//! an atomic snapshot, and watches the file so the listener set can be rebuilt
//! whenever it changes.

pub mod error;
pub mod rule;
pub mod settings;
pub mod store;
pub mod watcher;

pub use error::ConfigError;
pub use rule::{ensure_rules_file, parse_rules, ForwardRule, RuleSet, DEFAULT_RULE_LINE};
pub use settings::{ForwardSettings, MirrorTarget, ServerRate};
pub use store::RuleStore;
pub use watcher::{ConfigWatcher, FileFingerprint};

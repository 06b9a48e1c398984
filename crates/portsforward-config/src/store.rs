//! Atomically swapped rule snapshot

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::rule::RuleSet;

/// Holds the most recently applied rule set
///
/// Readers get a whole `Arc<RuleSet>` snapshot; a reload replaces the pointer
/// in one step, so no reader ever sees rules from two file versions.
pub struct RuleStore {
    current: ArcSwap<RuleSet>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
        }
    }

    pub fn load(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Swap in a new rule set, returning the one it replaced
    pub fn replace(&self, rules: RuleSet) -> Arc<RuleSet> {
        self.current.swap(Arc::new(rules))
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::parse_rules;

    #[test]
    fn test_starts_empty() {
        let store = RuleStore::new();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_replace_returns_previous_snapshot() {
        let store = RuleStore::new();
        store.replace(parse_rules("8000,a,80,0"));

        let held = store.load();
        let previous = store.replace(parse_rules("9000,b,90,0\n9001,c,91,0"));

        // Snapshots taken before the swap stay intact
        assert_eq!(held.source_ports(), vec![8000]);
        assert_eq!(previous.source_ports(), vec![8000]);
        assert_eq!(store.load().source_ports(), vec![9000, 9001]);
    }
}

//! Ordered set of tracked torrents, keyed by name.
//!
//! Every mutation builds a fresh vector and swaps it in, so a snapshot handed
//! to the renderer or the poller is never touched afterwards.

use std::{
    str::FromStr,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::Deserialize;

use crate::model::TorrentStatus;

pub type Snapshot = Arc<Vec<TorrentStatus>>;

/// What `add` does when the name is already tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    #[default]
    Reject,
    Replace,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown duplicate policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Replaced,
    Rejected,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<Snapshot>,
    policy: DuplicatePolicy,
}

impl Registry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            policy,
        }
    }

    /// Appends `entry`, or resolves a name clash per the duplicate policy.
    /// A replaced entry keeps its position.
    pub fn add(&self, entry: TorrentStatus) -> AddOutcome {
        let mut guard = self.write();
        let existing = guard.iter().position(|t| t.name == entry.name);
        let (next, outcome) = match (existing, self.policy) {
            (Some(_), DuplicatePolicy::Reject) => return AddOutcome::Rejected,
            (Some(index), DuplicatePolicy::Replace) => {
                let mut next = guard.as_ref().clone();
                next[index] = entry;
                (next, AddOutcome::Replaced)
            }
            (None, _) => {
                let mut next = guard.as_ref().clone();
                next.push(entry);
                (next, AddOutcome::Added)
            }
        };
        *guard = Arc::new(next);
        outcome
    }

    /// Replaces the entry carrying `update.name` wholesale. Unknown names are
    /// dropped so a late response cannot resurrect a removed torrent.
    pub fn merge(&self, update: TorrentStatus) -> bool {
        let mut guard = self.write();
        let Some(index) = guard.iter().position(|t| t.name == update.name) else {
            return false;
        };
        if guard[index] == update {
            return true;
        }
        let mut next = guard.as_ref().clone();
        next[index] = update;
        *guard = Arc::new(next);
        true
    }

    /// Returns whether an entry was actually removed.
    pub fn remove_by_name(&self, name: &str) -> bool {
        let mut guard = self.write();
        if !guard.iter().any(|t| t.name == name) {
            return false;
        }
        let next = guard
            .iter()
            .filter(|t| t.name != name)
            .cloned()
            .collect::<Vec<_>>();
        *guard = Arc::new(next);
        true
    }

    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.read())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A poisoned lock still holds a whole vector: writers only ever swap the Arc.
    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.entries.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.entries.write().unwrap_or_else(|err| err.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn status(name: &str, progress: u8) -> TorrentStatus {
        TorrentStatus {
            name: name.to_string(),
            progress,
            download_speed: 2048.0,
            size: 4096,
        }
    }

    fn names(registry: &Registry) -> Vec<String> {
        registry.snapshot().iter().map(|t| t.name.clone()).collect()
    }

    #[test]
    fn add_preserves_insertion_order() {
        let registry = Registry::default();
        for name in ["b.torrent", "a.torrent", "c.torrent"] {
            assert_eq!(
                registry.add(TorrentStatus::optimistic(name)),
                AddOutcome::Added
            );
        }
        assert_eq!(names(&registry), ["b.torrent", "a.torrent", "c.torrent"]);
    }

    #[test]
    fn reject_policy_keeps_existing_entry() {
        let registry = Registry::new(DuplicatePolicy::Reject);
        registry.add(status("x.torrent", 30));
        assert_eq!(
            registry.add(TorrentStatus::optimistic("x.torrent")),
            AddOutcome::Rejected
        );
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].progress, 30);
    }

    #[test]
    fn replace_policy_swaps_in_place() {
        let registry = Registry::new(DuplicatePolicy::Replace);
        registry.add(status("a.torrent", 10));
        registry.add(status("x.torrent", 30));
        registry.add(status("z.torrent", 50));
        assert_eq!(
            registry.add(TorrentStatus::optimistic("x.torrent")),
            AddOutcome::Replaced
        );
        assert_eq!(names(&registry), ["a.torrent", "x.torrent", "z.torrent"]);
        assert_eq!(registry.snapshot()[1], TorrentStatus::optimistic("x.torrent"));
    }

    #[test]
    fn merge_replaces_whole_entry() {
        let registry = Registry::default();
        registry.add(TorrentStatus::optimistic("x.torrent"));
        let update = TorrentStatus {
            name: "x.torrent".to_string(),
            progress: 40,
            download_speed: 1024.0,
            size: 10240,
        };
        assert!(registry.merge(update.clone()));
        assert_eq!(registry.snapshot().as_ref(), &vec![update]);
    }

    #[test]
    fn merge_is_idempotent() {
        let registry = Registry::default();
        registry.add(TorrentStatus::optimistic("x.torrent"));
        registry.add(TorrentStatus::optimistic("y.torrent"));
        registry.merge(status("x.torrent", 55));
        let once = registry.snapshot();
        registry.merge(status("x.torrent", 55));
        let twice = registry.snapshot();
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_never_adds_unknown_names() {
        let registry = Registry::default();
        registry.add(TorrentStatus::optimistic("x.torrent"));
        assert!(!registry.merge(status("ghost.torrent", 80)));
        assert_eq!(names(&registry), ["x.torrent"]);
    }

    #[test]
    fn removed_entries_stay_removed() {
        let registry = Registry::default();
        registry.add(TorrentStatus::optimistic("x.torrent"));
        assert!(registry.remove_by_name("x.torrent"));
        assert!(!registry.merge(status("x.torrent", 90)));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::default();
        registry.add(TorrentStatus::optimistic("x.torrent"));
        registry.add(TorrentStatus::optimistic("y.torrent"));
        assert!(registry.remove_by_name("x.torrent"));
        assert!(!registry.remove_by_name("x.torrent"));
        assert!(!registry.remove_by_name("never.torrent"));
        assert_eq!(names(&registry), ["y.torrent"]);
    }

    #[test]
    fn snapshots_are_not_affected_by_later_mutation() {
        let registry = Registry::default();
        registry.add(TorrentStatus::optimistic("x.torrent"));
        let before = registry.snapshot();
        registry.merge(status("x.torrent", 70));
        registry.add(TorrentStatus::optimistic("y.torrent"));
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].progress, 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn names_stay_unique_under_mixed_operations() {
        for policy in [DuplicatePolicy::Reject, DuplicatePolicy::Replace] {
            let registry = Registry::new(policy);
            let ops = ["a", "b", "a", "c", "b", "a", "d", "c"];
            for (step, name) in ops.iter().enumerate() {
                let name = format!("{name}.torrent");
                match step % 3 {
                    0 => {
                        registry.add(TorrentStatus::optimistic(name.as_str()));
                    }
                    1 => {
                        registry.merge(status(&name, step as u8));
                        registry.add(status(&name, step as u8));
                    }
                    _ => {
                        registry.remove_by_name(&name);
                        registry.add(TorrentStatus::optimistic(name.as_str()));
                        registry.add(TorrentStatus::optimistic(name.as_str()));
                    }
                }
                let snapshot = registry.snapshot();
                let unique = snapshot.iter().map(|t| &t.name).collect::<HashSet<_>>();
                assert_eq!(unique.len(), snapshot.len(), "policy {policy:?}");
            }
        }
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("Replace".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::Replace));
        assert_eq!("reject".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::Reject));
        assert!("keep".parse::<DuplicatePolicy>().is_err());
    }
}

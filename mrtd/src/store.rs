//! Authoritative in-memory record of the VIF table and rule set, with
//! durable snapshots.
//!
//! Pure bookkeeping: no kernel calls originate here. The coordinator is the
//! only mutator. Persistence writes the snapshot to a temporary file and
//! renames it over the committed one, so a crash mid-write never corrupts
//! the previous state.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::MAXVIFS;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file IO: {0}")]
    Io(#[from] io::Error),

    #[error("state file corrupt: {0}")]
    Corrupt(String),

    #[error("state file inconsistent: {0}")]
    Inconsistent(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One kernel virtual-interface slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VifEntry {
    /// Underlying network interface name; unique key.
    pub name: String,
    /// Kernel interface index bound at creation time.
    pub index: u32,
    /// Slot in `[0, MAXVIFS)`, unique among live VIFs.
    pub slot: u16,
    /// Number of rules referencing this VIF as input or output.
    pub ref_count: u32,
}

/// One desired `(source, group) -> {outputs}` mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleEntry {
    /// `0.0.0.0` is the "any source" wildcard.
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub input: String,
    pub outputs: BTreeSet<String>,
}

impl RuleEntry {
    pub fn key(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.source, self.group)
    }

    /// Every distinct interface this rule references (input and outputs;
    /// the sets are disjoint by validation).
    pub fn interfaces(&self) -> BTreeSet<String> {
        let mut set = self.outputs.clone();
        set.insert(self.input.clone());
        set
    }
}

/// Immutable copy of the full store, used for rollback and persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub vifs: Vec<VifEntry>,
    pub rules: Vec<RuleEntry>,
    /// Zero-reference VIFs whose kernel removal failed; their slots stay
    /// reserved until a later retry succeeds.
    #[serde(default)]
    pub orphans: Vec<VifEntry>,
}

#[derive(Debug, Default)]
pub struct Store {
    vifs: BTreeMap<String, VifEntry>,
    rules: BTreeMap<(Ipv4Addr, Ipv4Addr), RuleEntry>,
    orphans: Vec<VifEntry>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Load the durable snapshot from `path`. A missing file yields an
    /// empty store; an unreadable or internally inconsistent one is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no state file, starting fresh");
            return Ok(Store::new());
        }
        let data = fs::read(path)?;
        let snapshot: Snapshot =
            serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        validate_snapshot(&snapshot)?;

        let mut store = Store::new();
        store.restore(snapshot);
        info!(
            path = %path.display(),
            vifs = store.vifs.len(),
            rules = store.rules.len(),
            "state loaded"
        );
        Ok(store)
    }

    /// Write the current snapshot to `path` via temp-file-then-rename.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let tmp = tmp_path(path);
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), bytes = data.len(), "state persisted");
        Ok(())
    }

    /// Immutable copy of the current tables, in deterministic order.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            vifs: self.vifs.values().cloned().collect(),
            rules: self.rules.values().cloned().collect(),
            orphans: self.orphans.clone(),
        }
    }

    /// Atomically replace the in-memory tables with `snapshot`.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.vifs = snapshot
            .vifs
            .into_iter()
            .map(|v| (v.name.clone(), v))
            .collect();
        self.rules = snapshot.rules.into_iter().map(|r| (r.key(), r)).collect();
        self.orphans = snapshot.orphans;
    }

    pub fn vif(&self, name: &str) -> Option<&VifEntry> {
        self.vifs.get(name)
    }

    pub fn vifs(&self) -> impl Iterator<Item = &VifEntry> {
        self.vifs.values()
    }

    pub fn rule(&self, source: Ipv4Addr, group: Ipv4Addr) -> Option<&RuleEntry> {
        self.rules.get(&(source, group))
    }

    pub fn rules(&self) -> impl Iterator<Item = &RuleEntry> {
        self.rules.values()
    }

    pub fn orphans(&self) -> &[VifEntry] {
        &self.orphans
    }

    /// Lowest slot in `[0, MAXVIFS)` not held by a live VIF, an orphan, or
    /// anything in `reserved`.
    pub fn free_slot(&self, reserved: &BTreeSet<u16>) -> Option<u16> {
        let used: BTreeSet<u16> = self
            .vifs
            .values()
            .map(|v| v.slot)
            .chain(self.orphans.iter().map(|v| v.slot))
            .chain(reserved.iter().copied())
            .collect();
        (0..MAXVIFS as u16).find(|slot| !used.contains(slot))
    }

    pub fn insert_vif(&mut self, entry: VifEntry) {
        self.vifs.insert(entry.name.clone(), entry);
    }

    pub fn remove_vif(&mut self, name: &str) -> Option<VifEntry> {
        self.vifs.remove(name)
    }

    pub fn vif_mut(&mut self, name: &str) -> Option<&mut VifEntry> {
        self.vifs.get_mut(name)
    }

    pub fn insert_rule(&mut self, rule: RuleEntry) -> Option<RuleEntry> {
        self.rules.insert(rule.key(), rule)
    }

    pub fn remove_rule(&mut self, source: Ipv4Addr, group: Ipv4Addr) -> Option<RuleEntry> {
        self.rules.remove(&(source, group))
    }

    pub fn push_orphan(&mut self, entry: VifEntry) {
        self.orphans.push(entry);
    }

    pub fn take_orphans(&mut self) -> Vec<VifEntry> {
        std::mem::take(&mut self.orphans)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Reject snapshots that could not have been produced by a correct daemon:
/// out-of-range or duplicate slots, rules referencing unknown VIFs, or
/// stored reference counts that disagree with the rule set.
fn validate_snapshot(snapshot: &Snapshot) -> Result<()> {
    let mut slots = BTreeSet::new();
    for vif in snapshot.vifs.iter().chain(snapshot.orphans.iter()) {
        if vif.slot as usize >= MAXVIFS {
            return Err(StoreError::Inconsistent(format!(
                "VIF {} has slot {} outside [0, {MAXVIFS})",
                vif.name, vif.slot
            )));
        }
        if !slots.insert(vif.slot) {
            return Err(StoreError::Inconsistent(format!(
                "slot {} assigned twice",
                vif.slot
            )));
        }
    }

    let known: BTreeSet<&str> = snapshot.vifs.iter().map(|v| v.name.as_str()).collect();
    let mut expected: BTreeMap<String, u32> = BTreeMap::new();
    for rule in &snapshot.rules {
        if rule.outputs.is_empty() {
            return Err(StoreError::Inconsistent(format!(
                "rule ({}, {}) has no outputs",
                rule.source, rule.group
            )));
        }
        if rule.outputs.contains(&rule.input) {
            return Err(StoreError::Inconsistent(format!(
                "rule ({}, {}) uses {} as both input and output",
                rule.source, rule.group, rule.input
            )));
        }
        for name in rule.interfaces() {
            if !known.contains(name.as_str()) {
                return Err(StoreError::Inconsistent(format!(
                    "rule ({}, {}) references unknown interface {}",
                    rule.source, rule.group, name
                )));
            }
            *expected.entry(name).or_default() += 1;
        }
    }

    for vif in &snapshot.vifs {
        let want = expected.get(&vif.name).copied().unwrap_or(0);
        if vif.ref_count != want {
            return Err(StoreError::Inconsistent(format!(
                "VIF {} has ref_count {} but {} referencing rule(s)",
                vif.name, vif.ref_count, want
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vif(name: &str, slot: u16, ref_count: u32) -> VifEntry {
        VifEntry {
            name: name.to_string(),
            index: 100 + slot as u32,
            slot,
            ref_count,
        }
    }

    fn rule(source: [u8; 4], group: [u8; 4], input: &str, outputs: &[&str]) -> RuleEntry {
        RuleEntry {
            source: source.into(),
            group: group.into(),
            input: input.to_string(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_free_slot_is_lowest_unused() {
        let mut store = Store::new();
        assert_eq!(store.free_slot(&BTreeSet::new()), Some(0));

        store.insert_vif(vif("veth0", 0, 1));
        store.insert_vif(vif("veth2", 2, 1));
        assert_eq!(store.free_slot(&BTreeSet::new()), Some(1));

        let reserved: BTreeSet<u16> = [1].into();
        assert_eq!(store.free_slot(&reserved), Some(3));
    }

    #[test]
    fn test_free_slot_respects_orphans_and_exhaustion() {
        let mut store = Store::new();
        for slot in 0..(MAXVIFS as u16 - 1) {
            store.insert_vif(vif(&format!("if{slot}"), slot, 1));
        }
        store.push_orphan(vif("dead", MAXVIFS as u16 - 1, 0));
        assert_eq!(store.free_slot(&BTreeSet::new()), None);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut store = Store::new();
        store.insert_vif(vif("veth0", 0, 1));
        store.insert_vif(vif("veth1", 1, 1));
        store.insert_rule(rule([0, 0, 0, 0], [239, 1, 2, 3], "veth0", &["veth1"]));

        let snap = store.snapshot();
        let mut other = Store::new();
        other.restore(snap.clone());
        assert_eq!(other.snapshot(), snap);
    }

    #[test]
    fn test_restore_replaces_not_merges() {
        let mut store = Store::new();
        store.insert_vif(vif("veth0", 0, 1));
        let empty = Store::new().snapshot();
        store.restore(empty);
        assert!(store.vif("veth0").is_none());
        assert_eq!(store.snapshot(), Snapshot::default());
    }

    #[test]
    fn test_persist_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = Store::new();
        store.insert_vif(vif("veth0", 0, 1));
        store.insert_vif(vif("veth1", 1, 1));
        store.insert_rule(rule([0, 0, 0, 0], [239, 1, 2, 3], "veth0", &["veth1"]));
        store.persist(&path).unwrap();

        let loaded = Store::load(&path).unwrap();
        assert_eq!(loaded.snapshot(), store.snapshot());
        // No temp file left behind.
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(store.snapshot(), Snapshot::default());
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(Store::load(&path), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_load_duplicate_slot_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let snap = Snapshot {
            vifs: vec![vif("veth0", 3, 0), vif("veth1", 3, 0)],
            rules: vec![],
            orphans: vec![],
        };
        fs::write(&path, serde_json::to_vec(&snap).unwrap()).unwrap();
        assert!(matches!(
            Store::load(&path),
            Err(StoreError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_load_refcount_mismatch_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let snap = Snapshot {
            vifs: vec![vif("veth0", 0, 5), vif("veth1", 1, 1)],
            rules: vec![rule([0, 0, 0, 0], [239, 1, 2, 3], "veth0", &["veth1"])],
            orphans: vec![],
        };
        fs::write(&path, serde_json::to_vec(&snap).unwrap()).unwrap();
        assert!(matches!(
            Store::load(&path),
            Err(StoreError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_load_rule_with_unknown_interface_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let snap = Snapshot {
            vifs: vec![vif("veth0", 0, 1)],
            rules: vec![rule([0, 0, 0, 0], [239, 1, 2, 3], "veth0", &["ghost"])],
            orphans: vec![],
        };
        fs::write(&path, serde_json::to_vec(&snap).unwrap()).unwrap();
        assert!(matches!(
            Store::load(&path),
            Err(StoreError::Inconsistent(_))
        ));
    }
}

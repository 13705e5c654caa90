//! Transaction Coordinator: the only component that mutates the store and
//! the kernel together.
//!
//! Every mutating request runs as one transaction: plan the VIF changes,
//! execute them against the kernel, swap the forwarding entry, commit the
//! reference counts, persist. Any kernel failure mid-transaction triggers
//! compensating calls and a snapshot restore, so an observer sees either
//! the full change or none of it. A failed compensating call means kernel
//! and daemon state may have diverged; the coordinator then refuses all
//! further mutations until restart.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use mrt_api::{ErrorKind, RuleView, StateView, VifView};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::kernel::{KernelError, MrouteControl};
use crate::store::{RuleEntry, Snapshot, Store, StoreError, VifEntry};
use crate::validation::{RuleSpec, ValidationError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no rule for ({source_addr}, {group})")]
    RuleNotFound { source_addr: Ipv4Addr, group: Ipv4Addr },

    #[error("no free VIF slot: all 32 in use")]
    CapacityExceeded,

    #[error("kernel rejected: {0}")]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("kernel and daemon state diverged; mutations refused until restart")]
    Poisoned,
}

impl CoordinatorError {
    /// Wire taxonomy for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Validation(_) => ErrorKind::Validation,
            CoordinatorError::RuleNotFound { .. } => ErrorKind::NotFound,
            CoordinatorError::CapacityExceeded => ErrorKind::CapacityExceeded,
            CoordinatorError::Kernel(_) => ErrorKind::KernelRejected,
            CoordinatorError::Store(_) => ErrorKind::StateCorruption,
            CoordinatorError::Poisoned => ErrorKind::StateCorruption,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Transaction lifecycle, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnPhase {
    Validating,
    Planning,
    Executing,
    Committed,
    RolledBack,
}

pub struct Coordinator<K: MrouteControl> {
    kernel: K,
    store: Store,
    state_file: PathBuf,
    poisoned: bool,
}

impl<K: MrouteControl> Coordinator<K> {
    pub fn new(kernel: K, store: Store, state_file: PathBuf) -> Self {
        Coordinator {
            kernel,
            store,
            state_file,
            poisoned: false,
        }
    }

    /// Activate the kernel engine and reconcile it with the durable state
    /// by replaying every stored rule. Must complete before any request is
    /// served.
    pub fn start(&mut self) -> Result<()> {
        self.kernel.init()?;
        self.replay()
    }

    /// Persist and deactivate. The kernel discards all VIFs and rules when
    /// the engine shuts down, so only our bookkeeping needs saving.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.store.persist(&self.state_file) {
            error!(error = %e, "failed to persist state on shutdown");
        }
        if let Err(e) = self.kernel.done() {
            warn!(error = %e, "engine shutdown reported an error");
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Current state as reported to clients. Built from a snapshot, never
    /// from live references, so readers see a consistent view.
    pub fn state_view(&self) -> StateView {
        let snap = self.store.snapshot();
        StateView {
            vifs: snap
                .vifs
                .iter()
                .map(|v| VifView {
                    name: v.name.clone(),
                    slot: v.slot,
                    ifindex: v.index,
                    ref_count: v.ref_count,
                })
                .collect(),
            rules: snap
                .rules
                .iter()
                .map(|r| RuleView {
                    source: r.source.to_string(),
                    group: r.group.to_string(),
                    iif: r.input.clone(),
                    oifs: r.outputs.iter().cloned().collect(),
                })
                .collect(),
            orphans: snap
                .orphans
                .iter()
                .map(|v| VifView {
                    name: v.name.clone(),
                    slot: v.slot,
                    ifindex: v.index,
                    ref_count: v.ref_count,
                })
                .collect(),
        }
    }

    /// Immutable copy of the current store, for readers and tests.
    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Install or replace the rule for `(spec.source, spec.group)`.
    pub fn install(&mut self, spec: RuleSpec) -> Result<()> {
        self.ensure_usable()?;
        debug!(source = %spec.source, group = %spec.group, phase = ?TxnPhase::Validating, "install");
        self.retry_orphans();

        let s0 = self.store.snapshot();
        debug!(phase = ?TxnPhase::Planning, "install");

        // Plan: resolve every referenced interface and assign the lowest
        // free slot to each one not already backed by a VIF. No kernel
        // mutation happens until the whole plan is known to fit.
        let mut ifaces = vec![spec.input.clone()];
        ifaces.extend(spec.outputs.iter().cloned());

        let mut slot_of: BTreeMap<String, u16> = BTreeMap::new();
        let mut planned: Vec<VifEntry> = Vec::new();
        let mut reserved: BTreeSet<u16> = BTreeSet::new();
        for name in &ifaces {
            if let Some(vif) = self.store.vif(name) {
                slot_of.insert(name.clone(), vif.slot);
                continue;
            }
            let index = self
                .kernel
                .interface_index(name)
                .map_err(|_| ValidationError::UnknownInterface(name.clone()))?;
            let Some(slot) = self.store.free_slot(&reserved) else {
                debug!(phase = ?TxnPhase::RolledBack, "no free VIF slot");
                return Err(CoordinatorError::CapacityExceeded);
            };
            reserved.insert(slot);
            slot_of.insert(name.clone(), slot);
            planned.push(VifEntry {
                name: name.clone(),
                index,
                slot,
                ref_count: 0,
            });
        }

        debug!(new_vifs = planned.len(), phase = ?TxnPhase::Executing, "install");

        // Execute: create the planned VIFs, reversing on first failure.
        let mut created: Vec<VifEntry> = Vec::new();
        for vif in planned {
            if let Err(e) = self.kernel.add_vif(vif.slot, vif.index) {
                self.rollback(&created, s0);
                return Err(e.into());
            }
            self.store.insert_vif(vif.clone());
            created.push(vif);
        }

        // An install over an existing key is an update: the old entry goes
        // first, the kernel holds at most one per (source, group).
        let old = self.store.rule(spec.source, spec.group).cloned();
        if let Some(ref old_rule) = old {
            if let Err(e) = self.kernel.del_mfc(old_rule.source, old_rule.group) {
                self.rollback(&created, s0);
                return Err(e.into());
            }
        }

        let parent = slot_of[&spec.input];
        let out_slots: Vec<u16> = spec.outputs.iter().map(|n| slot_of[n]).collect();
        if let Err(e) = self.kernel.add_mfc(spec.source, spec.group, parent, &out_slots) {
            if let Some(ref old_rule) = old {
                self.readd_rule(old_rule, &s0);
            }
            self.rollback(&created, s0);
            return Err(e.into());
        }

        // Commit: move reference counts from the old rule to the new one
        // and tear down anything the new rule no longer touches.
        let new_ifaces: BTreeSet<String> = ifaces.iter().cloned().collect();
        if let Some(old_rule) = old {
            self.store.remove_rule(old_rule.source, old_rule.group);
            self.release(old_rule.interfaces(), &new_ifaces);
        }
        self.store.insert_rule(RuleEntry {
            source: spec.source,
            group: spec.group,
            input: spec.input.clone(),
            outputs: spec.outputs.clone(),
        });
        for name in &new_ifaces {
            if let Some(vif) = self.store.vif_mut(name) {
                vif.ref_count += 1;
            }
        }

        // The kernel change is committed at this point, so a persist
        // failure is not surfaced to the client; durable state catches up
        // on the next successful persist or at shutdown.
        if let Err(e) = self.store.persist(&self.state_file) {
            warn!(error = %e, "state persist failed after commit");
        }
        info!(
            source = %spec.source,
            group = %spec.group,
            iif = %spec.input,
            oifs = ?spec.outputs,
            phase = ?TxnPhase::Committed,
            "rule installed"
        );
        Ok(())
    }

    /// Remove the rule for `(source, group)` and any VIF it was the last
    /// reference to.
    pub fn remove(&mut self, source: Ipv4Addr, group: Ipv4Addr) -> Result<()> {
        self.ensure_usable()?;
        self.retry_orphans();

        let rule = self
            .store
            .rule(source, group)
            .cloned()
            .ok_or(CoordinatorError::RuleNotFound { source_addr: source, group })?;

        self.kernel.del_mfc(source, group)?;
        self.store.remove_rule(source, group);

        // A VIF teardown failure here does not undo the rule removal:
        // re-adding a successfully deleted rule would resurrect state the
        // client no longer expects. The VIF is parked for retry instead.
        self.release(rule.interfaces(), &BTreeSet::new());

        if let Err(e) = self.store.persist(&self.state_file) {
            warn!(error = %e, "state persist failed after commit");
        }
        info!(source = %source, group = %group, phase = ?TxnPhase::Committed, "rule removed");
        Ok(())
    }

    /// Re-apply every rule from the durable snapshot through the normal
    /// install path. Stored slot assignments are advisory; the replay
    /// rebuilds VIFs from scratch, so a snapshot left behind by a dead
    /// process (whose kernel state is long gone) converges cleanly.
    fn replay(&mut self) -> Result<()> {
        let rules = self.store.snapshot().rules;
        self.store.restore(Snapshot::default());

        let total = rules.len();
        let mut applied = 0;
        for rule in rules {
            let spec = RuleSpec {
                source: rule.source,
                group: rule.group,
                input: rule.input,
                outputs: rule.outputs,
            };
            match self.install(spec) {
                Ok(()) => applied += 1,
                // An interface can legitimately vanish between runs; the
                // rule is dropped rather than blocking startup.
                Err(e) => warn!(
                    source = %rule.source,
                    group = %rule.group,
                    error = %e,
                    "dropping rule that failed to replay"
                ),
            }
        }
        self.store.persist(&self.state_file)?;
        info!(applied, total, "startup replay complete");
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(CoordinatorError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Reverse VIF creations from this transaction and restore the
    /// pre-transaction snapshot.
    fn rollback(&mut self, created: &[VifEntry], s0: Snapshot) {
        for vif in created.iter().rev() {
            if let Err(e) = self.kernel.del_vif(vif.slot, vif.index) {
                self.poison(&format!(
                    "compensating MRT_DEL_VIF for slot {} failed: {e}",
                    vif.slot
                ));
            }
        }
        self.store.restore(s0);
        debug!(phase = ?TxnPhase::RolledBack, "transaction rolled back");
    }

    /// Compensating re-add of a rule removed earlier in a failed update.
    /// Slots come from the pre-transaction snapshot.
    fn readd_rule(&mut self, old_rule: &RuleEntry, s0: &Snapshot) {
        let slot_in_s0 = |name: &str| {
            s0.vifs
                .iter()
                .find(|v| v.name == name)
                .map(|v| v.slot)
        };
        let Some(parent) = slot_in_s0(&old_rule.input) else {
            self.poison("pre-transaction snapshot missing the replaced rule's input VIF");
            return;
        };
        let out_slots: Vec<u16> = old_rule
            .outputs
            .iter()
            .filter_map(|n| slot_in_s0(n))
            .collect();
        if out_slots.len() != old_rule.outputs.len() {
            self.poison("pre-transaction snapshot missing a replaced rule's output VIF");
            return;
        }
        if let Err(e) = self
            .kernel
            .add_mfc(old_rule.source, old_rule.group, parent, &out_slots)
        {
            self.poison(&format!("compensating MRT_ADD_MFC failed: {e}"));
        }
    }

    /// Drop one reference from each named VIF; tear down those that reach
    /// zero, unless `keep` still references them. Kernel removal failures
    /// park the VIF as an orphan for later retry.
    fn release(&mut self, names: BTreeSet<String>, keep: &BTreeSet<String>) {
        for name in names {
            let Some(vif) = self.store.vif_mut(&name) else {
                continue;
            };
            vif.ref_count = vif.ref_count.saturating_sub(1);
            if vif.ref_count > 0 || keep.contains(&name) {
                continue;
            }
            let vif = vif.clone();
            if let Err(e) = self.kernel.del_vif(vif.slot, vif.index) {
                error!(
                    name = %vif.name,
                    slot = vif.slot,
                    error = %e,
                    "VIF removal failed; parking as orphan for retry"
                );
                self.store.remove_vif(&name);
                self.store.push_orphan(vif);
            } else {
                self.store.remove_vif(&name);
                debug!(name = %name, "VIF torn down");
            }
        }
    }

    /// Opportunistic retry of orphaned VIF removals, run ahead of every
    /// transaction.
    fn retry_orphans(&mut self) {
        let orphans = self.store.take_orphans();
        if orphans.is_empty() {
            return;
        }
        for vif in orphans {
            match self.kernel.del_vif(vif.slot, vif.index) {
                Ok(()) => info!(name = %vif.name, slot = vif.slot, "orphaned VIF removed"),
                Err(e) => {
                    warn!(name = %vif.name, slot = vif.slot, error = %e, "orphaned VIF still stuck");
                    self.store.push_orphan(vif);
                }
            }
        }
    }

    fn poison(&mut self, context: &str) {
        error!(
            context,
            "kernel and daemon state may have diverged; refusing further mutations"
        );
        self.poisoned = true;
    }
}

//! Test support: an in-memory stand-in for the kernel multicast engine.
//!
//! `FakeKernel` mirrors the kernel's observable behavior for the `MRT_*`
//! primitives (slot collisions, range checks, unknown interfaces) and lets
//! tests script failures at specific points to exercise rollback paths.
//! It is a cloneable handle over shared state, so a test can keep one copy
//! while the coordinator owns another.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::MAXVIFS;
use crate::kernel::{KernelError, MrouteControl, Result};

/// The fake engine's state plus failure script.
#[derive(Debug, Default)]
pub struct FakeEngine {
    pub initialized: bool,
    /// slot -> ifindex, as the kernel would hold them.
    pub vifs: BTreeMap<u16, u32>,
    /// (source, group) -> (parent, output slots).
    pub mfc: BTreeMap<(Ipv4Addr, Ipv4Addr), (u16, Vec<u16>)>,
    /// name -> ifindex; the fake system's interface table.
    pub interfaces: BTreeMap<String, u32>,
    /// `add_vif` call numbers (1-based) that fail with `OutOfMemory`.
    pub fail_add_vif_on_calls: BTreeSet<u32>,
    /// `add_mfc` call numbers (1-based) that fail with `OutOfMemory`.
    pub fail_add_mfc_on_calls: BTreeSet<u32>,
    /// Slots whose `del_vif` always fails.
    pub fail_del_vif_slots: BTreeSet<u16>,
    /// Fail every `del_mfc`.
    pub fail_del_mfc: bool,
    add_vif_calls: u32,
    add_mfc_calls: u32,
    /// Flat log of every call, for asserting "no kernel calls happened".
    pub ops: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<FakeEngine>>,
}

impl FakeKernel {
    /// A fake with the given interfaces registered as indexes 10, 11, ...
    pub fn with_interfaces(names: &[&str]) -> Self {
        let fake = FakeKernel::default();
        {
            let mut engine = fake.engine();
            for (i, name) in names.iter().enumerate() {
                engine.interfaces.insert(name.to_string(), 10 + i as u32);
            }
        }
        fake
    }

    /// Direct access to the engine state, for scripting and assertions.
    pub fn engine(&self) -> MutexGuard<'_, FakeEngine> {
        self.state.lock().unwrap()
    }
}

impl MrouteControl for FakeKernel {
    fn init(&mut self) -> Result<()> {
        let mut st = self.engine();
        st.ops.push("init".to_string());
        if st.initialized {
            return Err(KernelError::AlreadyInitialized);
        }
        st.initialized = true;
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        let mut st = self.engine();
        st.ops.push("done".to_string());
        // Mirrors the kernel: all state dies with the socket.
        st.initialized = false;
        st.vifs.clear();
        st.mfc.clear();
        Ok(())
    }

    fn add_vif(&mut self, slot: u16, ifindex: u32) -> Result<()> {
        let mut st = self.engine();
        st.ops.push(format!("add_vif {slot} {ifindex}"));
        st.add_vif_calls += 1;
        if st.fail_add_vif_on_calls.contains(&st.add_vif_calls) {
            return Err(KernelError::OutOfMemory {
                call: "MRT_ADD_VIF",
            });
        }
        if slot as usize >= MAXVIFS {
            return Err(KernelError::SlotExhausted {
                call: "MRT_ADD_VIF",
                slot,
            });
        }
        if st.vifs.contains_key(&slot) {
            return Err(KernelError::SlotInUse {
                call: "MRT_ADD_VIF",
                slot,
            });
        }
        if !st.interfaces.values().any(|&idx| idx == ifindex) {
            return Err(KernelError::AddressNotAvailable {
                call: "MRT_ADD_VIF",
                name: format!("ifindex {ifindex}"),
            });
        }
        st.vifs.insert(slot, ifindex);
        Ok(())
    }

    fn del_vif(&mut self, slot: u16, _ifindex: u32) -> Result<()> {
        let mut st = self.engine();
        st.ops.push(format!("del_vif {slot}"));
        if st.fail_del_vif_slots.contains(&slot) {
            return Err(KernelError::Syscall {
                call: "MRT_DEL_VIF",
                source: std::io::Error::from_raw_os_error(nix::libc::EBUSY),
            });
        }
        if st.vifs.remove(&slot).is_none() {
            return Err(KernelError::AddressNotAvailable {
                call: "MRT_DEL_VIF",
                name: format!("slot {slot}"),
            });
        }
        Ok(())
    }

    fn add_mfc(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        parent: u16,
        output_slots: &[u16],
    ) -> Result<()> {
        let mut st = self.engine();
        st.ops.push(format!("add_mfc {source} {group} {parent}"));
        st.add_mfc_calls += 1;
        if st.fail_add_mfc_on_calls.contains(&st.add_mfc_calls) {
            return Err(KernelError::OutOfMemory {
                call: "MRT_ADD_MFC",
            });
        }
        if !group.is_multicast() {
            return Err(KernelError::InvalidGroup {
                call: "MRT_ADD_MFC",
                group,
            });
        }
        if parent as usize >= MAXVIFS || output_slots.iter().any(|&s| s as usize >= MAXVIFS) {
            return Err(KernelError::SlotExhausted {
                call: "MRT_ADD_MFC",
                slot: parent,
            });
        }
        st.mfc
            .insert((source, group), (parent, output_slots.to_vec()));
        Ok(())
    }

    fn del_mfc(&mut self, source: Ipv4Addr, group: Ipv4Addr) -> Result<()> {
        let mut st = self.engine();
        st.ops.push(format!("del_mfc {source} {group}"));
        if st.fail_del_mfc {
            return Err(KernelError::Syscall {
                call: "MRT_DEL_MFC",
                source: std::io::Error::from_raw_os_error(nix::libc::ENOENT),
            });
        }
        if st.mfc.remove(&(source, group)).is_none() {
            return Err(KernelError::InvalidGroup {
                call: "MRT_DEL_MFC",
                group,
            });
        }
        Ok(())
    }

    fn interface_index(&self, name: &str) -> Result<u32> {
        self.engine()
            .interfaces
            .get(name)
            .copied()
            .ok_or_else(|| KernelError::AddressNotAvailable {
                call: "if_nametoindex",
                name: name.to_string(),
            })
    }
}

//! Kernel Control Interface: the single owner of the privileged raw socket.
//!
//! All state the kernel's multicast engine holds is tied to one open raw
//! IGMP socket; it is discarded the moment that socket closes. This module
//! owns that socket and exposes the primitive `MRT_*` operations over it.
//! Nothing is cached and nothing is validated beyond what the kernel
//! reports; retry and rollback policy belongs to the coordinator.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::libc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{
    MAXVIFS, MFCCTL_SIZE, MRT_ADD_MFC, MRT_ADD_VIF, MRT_DEL_MFC, MRT_DEL_VIF, MRT_DONE, MRT_INIT,
    MfcCtl, VIFCTL_SIZE, VifCtl,
};

/// Errors surfaced by the kernel control calls, mapped from raw errno
/// values with the originating call identified.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{call}: operation not permitted (CAP_NET_ADMIN required)")]
    PermissionDenied { call: &'static str },

    #[error("multicast engine already initialized on this socket")]
    AlreadyInitialized,

    #[error("multicast engine not initialized")]
    NotInitialized { call: &'static str },

    #[error("{call}: interface unusable or missing: {name}")]
    AddressNotAvailable { call: &'static str, name: String },

    #[error("{call}: VIF slot {slot} out of range (MAXVIFS = {MAXVIFS})")]
    SlotExhausted { call: &'static str, slot: u16 },

    #[error("{call}: VIF slot {slot} already occupied")]
    SlotInUse { call: &'static str, slot: u16 },

    #[error("{call}: {group} is not a multicast group")]
    InvalidGroup { call: &'static str, group: Ipv4Addr },

    #[error("{call}: kernel could not allocate the cache entry")]
    OutOfMemory { call: &'static str },

    #[error("{call}: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Primitive operations against the kernel multicast engine.
///
/// `MrouteSocket` is the only production implementation; tests substitute
/// `test_util::FakeKernel`.
pub trait MrouteControl: Send {
    /// Open the raw socket and activate the engine (`MRT_INIT`).
    fn init(&mut self) -> Result<()>;

    /// Deactivate the engine and close the socket (`MRT_DONE`).
    /// Idempotent: a no-op when not initialized.
    fn done(&mut self) -> Result<()>;

    fn add_vif(&mut self, slot: u16, ifindex: u32) -> Result<()>;

    fn del_vif(&mut self, slot: u16, ifindex: u32) -> Result<()>;

    fn add_mfc(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        parent: u16,
        output_slots: &[u16],
    ) -> Result<()>;

    fn del_mfc(&mut self, source: Ipv4Addr, group: Ipv4Addr) -> Result<()>;

    /// Resolve an interface name to its kernel index.
    fn interface_index(&self, name: &str) -> Result<u32>;
}

/// The live raw IGMP socket. Exists at most once per daemon; dropping it
/// shuts the engine down, so kernel state can never outlive this object.
pub struct MrouteSocket {
    fd: Option<OwnedFd>,
}

impl MrouteSocket {
    pub fn new() -> Self {
        MrouteSocket { fd: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.fd.is_some()
    }

    fn fd(&self, call: &'static str) -> Result<&OwnedFd> {
        self.fd.as_ref().ok_or(KernelError::NotInitialized { call })
    }

    fn setsockopt(&self, call: &'static str, opt: libc::c_int, buf: &[u8]) -> Result<()> {
        let fd = self.fd(call)?;
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_IP,
                opt,
                buf.as_ptr() as *const libc::c_void,
                buf.len() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(KernelError::Syscall {
                call,
                source: io::Error::last_os_error(),
            })
        } else {
            Ok(())
        }
    }
}

impl Default for MrouteSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl MrouteControl for MrouteSocket {
    fn init(&mut self) -> Result<()> {
        if self.fd.is_some() {
            return Err(KernelError::AlreadyInitialized);
        }

        let raw = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::IPPROTO_IGMP,
            )
        };
        if raw < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::EACCES) => {
                    KernelError::PermissionDenied { call: "socket" }
                }
                _ => KernelError::Syscall {
                    call: "socket",
                    source: err,
                },
            });
        }
        self.fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });

        let one: libc::c_int = 1;
        if let Err(e) = self.setsockopt("MRT_INIT", MRT_INIT, &one.to_ne_bytes()) {
            self.fd = None;
            return Err(match e {
                KernelError::Syscall { source, .. } => match source.raw_os_error() {
                    Some(libc::EADDRINUSE) => KernelError::AlreadyInitialized,
                    Some(libc::EPERM) | Some(libc::EACCES) => {
                        KernelError::PermissionDenied { call: "MRT_INIT" }
                    }
                    _ => KernelError::Syscall {
                        call: "MRT_INIT",
                        source,
                    },
                },
                other => other,
            });
        }
        debug!("multicast engine initialized");
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        if self.fd.is_none() {
            return Ok(());
        }
        let one: libc::c_int = 1;
        let result = self.setsockopt("MRT_DONE", MRT_DONE, &one.to_ne_bytes());
        // The kernel tears everything down when the fd closes either way.
        self.fd = None;
        if let Err(e) = result {
            warn!(error = %e, "MRT_DONE failed; socket closed anyway");
        }
        debug!("multicast engine shut down");
        Ok(())
    }

    fn add_vif(&mut self, slot: u16, ifindex: u32) -> Result<()> {
        if slot as usize >= MAXVIFS {
            return Err(KernelError::SlotExhausted {
                call: "MRT_ADD_VIF",
                slot,
            });
        }
        let buf = VifCtl::new(slot, ifindex).encode();
        debug_assert_eq!(buf.len(), VIFCTL_SIZE);
        self.setsockopt("MRT_ADD_VIF", MRT_ADD_VIF, &buf)
            .map_err(|e| match e {
                KernelError::Syscall { source, .. } => match source.raw_os_error() {
                    Some(libc::EADDRINUSE) => KernelError::SlotInUse {
                        call: "MRT_ADD_VIF",
                        slot,
                    },
                    Some(libc::EADDRNOTAVAIL) | Some(libc::ENODEV) => {
                        KernelError::AddressNotAvailable {
                            call: "MRT_ADD_VIF",
                            name: format!("ifindex {ifindex}"),
                        }
                    }
                    Some(libc::ENFILE) => KernelError::SlotExhausted {
                        call: "MRT_ADD_VIF",
                        slot,
                    },
                    _ => KernelError::Syscall {
                        call: "MRT_ADD_VIF",
                        source,
                    },
                },
                other => other,
            })?;
        debug!(slot, ifindex, "VIF added");
        Ok(())
    }

    fn del_vif(&mut self, slot: u16, ifindex: u32) -> Result<()> {
        let buf = VifCtl::new(slot, ifindex).encode();
        self.setsockopt("MRT_DEL_VIF", MRT_DEL_VIF, &buf)?;
        debug!(slot, ifindex, "VIF removed");
        Ok(())
    }

    fn add_mfc(
        &mut self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        parent: u16,
        output_slots: &[u16],
    ) -> Result<()> {
        if parent as usize >= MAXVIFS {
            return Err(KernelError::SlotExhausted {
                call: "MRT_ADD_MFC",
                slot: parent,
            });
        }
        if let Some(&slot) = output_slots.iter().find(|&&s| s as usize >= MAXVIFS) {
            return Err(KernelError::SlotExhausted {
                call: "MRT_ADD_MFC",
                slot,
            });
        }
        let buf = MfcCtl::new(source, group, parent, output_slots).encode();
        debug_assert_eq!(buf.len(), MFCCTL_SIZE);
        self.setsockopt("MRT_ADD_MFC", MRT_ADD_MFC, &buf)
            .map_err(|e| match e {
                KernelError::Syscall { source: err, .. } => match err.raw_os_error() {
                    Some(libc::EINVAL) => KernelError::InvalidGroup {
                        call: "MRT_ADD_MFC",
                        group,
                    },
                    Some(libc::ENOMEM) | Some(libc::ENOBUFS) => KernelError::OutOfMemory {
                        call: "MRT_ADD_MFC",
                    },
                    _ => KernelError::Syscall {
                        call: "MRT_ADD_MFC",
                        source: err,
                    },
                },
                other => other,
            })?;
        debug!(source = %source, group = %group, parent, ?output_slots, "MFC entry added");
        Ok(())
    }

    fn del_mfc(&mut self, source: Ipv4Addr, group: Ipv4Addr) -> Result<()> {
        let buf = MfcCtl::key(source, group).encode();
        self.setsockopt("MRT_DEL_MFC", MRT_DEL_MFC, &buf)
            .map_err(|e| match e {
                KernelError::Syscall { source: err, .. } => match err.raw_os_error() {
                    Some(libc::EINVAL) => KernelError::InvalidGroup {
                        call: "MRT_DEL_MFC",
                        group,
                    },
                    _ => KernelError::Syscall {
                        call: "MRT_DEL_MFC",
                        source: err,
                    },
                },
                other => other,
            })?;
        debug!(source = %source, group = %group, "MFC entry removed");
        Ok(())
    }

    fn interface_index(&self, name: &str) -> Result<u32> {
        nix::net::if_::if_nametoindex(name)
            .map(|idx| idx as u32)
            .map_err(|_| KernelError::AddressNotAvailable {
                call: "if_nametoindex",
                name: name.to_string(),
            })
    }
}

impl Drop for MrouteSocket {
    fn drop(&mut self) {
        // Deterministic cleanup under both graceful and signal-driven exits.
        let _ = self.done();
    }
}

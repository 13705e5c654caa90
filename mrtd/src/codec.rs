//! Byte-exact marshaling of the kernel's multicast routing control records.
//!
//! The multicast engine is programmed through `setsockopt` with two C
//! structs from `<uapi/linux/mroute.h>`: `vifctl` (one virtual-interface
//! slot) and `mfcctl` (one forwarding-cache entry). The kernel validates
//! the option length against `sizeof`, so the encoded buffers here must
//! match the C layout bit for bit, including the two bytes of compiler
//! padding `mfcctl` carries between the TTL array and the counter fields.
//!
//! Scalar fields are native-endian (the kernel reads them in place);
//! `in_addr` contents are network byte order.

use std::mem::size_of;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Hard kernel-ABI ceiling on simultaneously active VIFs.
pub const MAXVIFS: usize = 32;

/// VIF is identified by interface index rather than local address.
pub const VIFF_USE_IFINDEX: u8 = 0x8;

// Socket options on IPPROTO_IP, from <uapi/linux/mroute.h>.
pub const MRT_INIT: libc::c_int = 200;
pub const MRT_DONE: libc::c_int = 201;
pub const MRT_ADD_VIF: libc::c_int = 202;
pub const MRT_DEL_VIF: libc::c_int = 203;
pub const MRT_ADD_MFC: libc::c_int = 204;
pub const MRT_DEL_MFC: libc::c_int = 205;

pub use nix::libc;

/// Size of `struct vifctl` on Linux.
pub const VIFCTL_SIZE: usize = 16;

/// Size of `struct mfcctl` on Linux.
pub const MFCCTL_SIZE: usize = 60;

/// Offset of the TTL array inside `struct mfcctl`.
pub const MFCCTL_TTLS_OFFSET: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed record: got {got} bytes, expected {want}")]
    MalformedRecord { got: usize, want: usize },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Mirror of `struct vifctl` with the local-address union collapsed to the
/// ifindex arm — the daemon always sets `VIFF_USE_IFINDEX`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VifCtl {
    pub vifc_vifi: u16,
    pub vifc_flags: u8,
    pub vifc_threshold: u8,
    pub vifc_rate_limit: u32,
    pub vifc_lcl_ifindex: i32,
    pub vifc_rmt_addr: [u8; 4],
}

const _: () = assert!(size_of::<VifCtl>() == VIFCTL_SIZE);

impl VifCtl {
    /// Descriptor for one VIF slot bound to a kernel interface index.
    /// Threshold and rate limit stay zero; the kernel ignores the latter.
    pub fn new(slot: u16, ifindex: u32) -> Self {
        VifCtl {
            vifc_vifi: slot,
            vifc_flags: VIFF_USE_IFINDEX,
            vifc_threshold: 0,
            vifc_rate_limit: 0,
            vifc_lcl_ifindex: ifindex as i32,
            vifc_rmt_addr: [0; 4],
        }
    }

    pub fn encode(&self) -> [u8; VIFCTL_SIZE] {
        let mut buf = [0u8; VIFCTL_SIZE];
        buf[0..2].copy_from_slice(&self.vifc_vifi.to_ne_bytes());
        buf[2] = self.vifc_flags;
        buf[3] = self.vifc_threshold;
        buf[4..8].copy_from_slice(&self.vifc_rate_limit.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.vifc_lcl_ifindex.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.vifc_rmt_addr);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != VIFCTL_SIZE {
            return Err(CodecError::MalformedRecord {
                got: buf.len(),
                want: VIFCTL_SIZE,
            });
        }
        Ok(VifCtl {
            vifc_vifi: u16::from_ne_bytes([buf[0], buf[1]]),
            vifc_flags: buf[2],
            vifc_threshold: buf[3],
            vifc_rate_limit: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
            vifc_lcl_ifindex: i32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
            vifc_rmt_addr: [buf[12], buf[13], buf[14], buf[15]],
        })
    }
}

/// Mirror of `struct mfcctl`. The `_pad` field replicates the alignment
/// hole the C compiler inserts before `mfcc_pkt_cnt`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfcCtl {
    pub mfcc_origin: [u8; 4],
    pub mfcc_mcastgrp: [u8; 4],
    pub mfcc_parent: u16,
    pub mfcc_ttls: [u8; MAXVIFS],
    _pad: [u8; 2],
    pub mfcc_pkt_cnt: u32,
    pub mfcc_byte_cnt: u32,
    pub mfcc_wrong_if: u32,
    pub mfcc_expire: i32,
}

const _: () = assert!(size_of::<MfcCtl>() == MFCCTL_SIZE);

impl MfcCtl {
    /// Descriptor for one `(source, group)` forwarding entry. A non-zero
    /// TTL at index `slot` makes that slot an output; TTL 1 forwards
    /// without decrementing.
    pub fn new(source: Ipv4Addr, group: Ipv4Addr, parent: u16, output_slots: &[u16]) -> Self {
        let mut ttls = [0u8; MAXVIFS];
        for &slot in output_slots {
            if (slot as usize) < MAXVIFS {
                ttls[slot as usize] = 1;
            }
        }
        MfcCtl {
            mfcc_origin: source.octets(),
            mfcc_mcastgrp: group.octets(),
            mfcc_parent: parent,
            mfcc_ttls: ttls,
            _pad: [0; 2],
            mfcc_pkt_cnt: 0,
            mfcc_byte_cnt: 0,
            mfcc_wrong_if: 0,
            mfcc_expire: 0,
        }
    }

    /// Key-only descriptor for `MRT_DEL_MFC`; the kernel matches on origin
    /// and group and ignores the rest.
    pub fn key(source: Ipv4Addr, group: Ipv4Addr) -> Self {
        MfcCtl::new(source, group, 0, &[])
    }

    pub fn origin(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mfcc_origin)
    }

    pub fn group(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mfcc_mcastgrp)
    }

    pub fn encode(&self) -> [u8; MFCCTL_SIZE] {
        let mut buf = [0u8; MFCCTL_SIZE];
        buf[0..4].copy_from_slice(&self.mfcc_origin);
        buf[4..8].copy_from_slice(&self.mfcc_mcastgrp);
        buf[8..10].copy_from_slice(&self.mfcc_parent.to_ne_bytes());
        buf[10..42].copy_from_slice(&self.mfcc_ttls);
        // 42..44 stays zero: compiler padding, required for the length check
        buf[44..48].copy_from_slice(&self.mfcc_pkt_cnt.to_ne_bytes());
        buf[48..52].copy_from_slice(&self.mfcc_byte_cnt.to_ne_bytes());
        buf[52..56].copy_from_slice(&self.mfcc_wrong_if.to_ne_bytes());
        buf[56..60].copy_from_slice(&self.mfcc_expire.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != MFCCTL_SIZE {
            return Err(CodecError::MalformedRecord {
                got: buf.len(),
                want: MFCCTL_SIZE,
            });
        }
        let mut origin = [0u8; 4];
        origin.copy_from_slice(&buf[0..4]);
        let mut mcastgrp = [0u8; 4];
        mcastgrp.copy_from_slice(&buf[4..8]);
        let mut ttls = [0u8; MAXVIFS];
        ttls.copy_from_slice(&buf[10..42]);
        Ok(MfcCtl {
            mfcc_origin: origin,
            mfcc_mcastgrp: mcastgrp,
            mfcc_parent: u16::from_ne_bytes([buf[8], buf[9]]),
            mfcc_ttls: ttls,
            _pad: [0; 2],
            mfcc_pkt_cnt: u32::from_ne_bytes([buf[44], buf[45], buf[46], buf[47]]),
            mfcc_byte_cnt: u32::from_ne_bytes([buf[48], buf[49], buf[50], buf[51]]),
            mfcc_wrong_if: u32::from_ne_bytes([buf[52], buf[53], buf[54], buf[55]]),
            mfcc_expire: i32::from_ne_bytes([buf[56], buf[57], buf[58], buf[59]]),
        })
    }
}

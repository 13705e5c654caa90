//! Input validation for client requests.
//!
//! Every check here runs before any kernel call; a rejected request leaves
//! both the store and the kernel untouched.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Linux IFNAMSIZ; interface names are at most 15 bytes plus NUL.
const MAX_IFNAME_LEN: usize = 15;

/// Validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid source address: {0}")]
    InvalidSource(String),

    #[error("source {0} must be unicast or 0.0.0.0 (any)")]
    SourceNotUnicast(Ipv4Addr),

    #[error("invalid group address: {0}")]
    InvalidGroup(String),

    #[error("group {0} is not in the multicast range")]
    GroupNotMulticast(Ipv4Addr),

    #[error("input interface is required")]
    InputRequired,

    #[error("at least one output interface is required")]
    NoOutputs,

    #[error("duplicate output interface: {0}")]
    DuplicateOutput(String),

    #[error("interface {0} cannot be both input and output")]
    InputIsOutput(String),

    #[error("invalid interface name: {0:?}")]
    InvalidInterfaceName(String),

    #[error("unknown interface: {0}")]
    UnknownInterface(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// A fully validated install request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub input: String,
    pub outputs: BTreeSet<String>,
}

/// Validate an install request: addresses parse, the group is multicast,
/// interface names are sane, outputs are non-empty and unique, and the
/// input is not also an output (no loopback forwarding).
pub fn validate_install(source: &str, group: &str, iif: &str, oifs: &[String]) -> Result<RuleSpec> {
    let (source, group) = validate_key(source, group)?;

    if iif.is_empty() {
        return Err(ValidationError::InputRequired);
    }
    validate_ifname(iif)?;

    if oifs.is_empty() {
        return Err(ValidationError::NoOutputs);
    }
    let mut outputs = BTreeSet::new();
    for oif in oifs {
        validate_ifname(oif)?;
        if oif == iif {
            return Err(ValidationError::InputIsOutput(oif.clone()));
        }
        if !outputs.insert(oif.clone()) {
            return Err(ValidationError::DuplicateOutput(oif.clone()));
        }
    }

    Ok(RuleSpec {
        source,
        group,
        input: iif.to_string(),
        outputs,
    })
}

/// Validate a `(source, group)` rule key.
pub fn validate_key(source: &str, group: &str) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let source: Ipv4Addr = source
        .parse()
        .map_err(|_| ValidationError::InvalidSource(source.to_string()))?;
    if !source.is_unspecified() && (source.is_multicast() || source.is_broadcast()) {
        return Err(ValidationError::SourceNotUnicast(source));
    }

    let group: Ipv4Addr = group
        .parse()
        .map_err(|_| ValidationError::InvalidGroup(group.to_string()))?;
    if !group.is_multicast() {
        return Err(ValidationError::GroupNotMulticast(group));
    }

    Ok((source, group))
}

fn validate_ifname(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name
            .bytes()
            .all(|b| !b.is_ascii_whitespace() && b != b'/' && !b.is_ascii_control());
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidInterfaceName(name.to_string()))
    }
}

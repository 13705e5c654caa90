//! Wire contract between the mrtd daemon and its clients.
//!
//! Requests and responses travel as single lines of JSON over the daemon's
//! Unix domain socket. This crate only defines the types; the transport
//! lives in `mrtd::ipc` and `mrtctl`.

use serde::{Deserialize, Serialize};

/// Default path of the daemon's IPC socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/mrtd.sock";

/// A client request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum Request {
    /// Install or replace the forwarding rule for `(source, group)`.
    InstallRule {
        /// Source IPv4 address; `0.0.0.0` means "any source".
        source: String,
        /// Multicast group IPv4 address.
        group: String,
        /// Input interface name.
        iif: String,
        /// Output interface names.
        oifs: Vec<String>,
    },
    /// Remove the forwarding rule for `(source, group)`.
    RemoveRule { source: String, group: String },
    /// Return the current VIF table and rule set.
    ListState,
}

/// A daemon response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<StateView>,
    },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok { state: None }
    }

    pub fn with_state(state: StateView) -> Self {
        Response::Ok { state: Some(state) }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Error taxonomy surfaced to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request rejected before any kernel call.
    Validation,
    /// No rule exists for the given `(source, group)` key.
    NotFound,
    /// All 32 VIF slots are in use.
    CapacityExceeded,
    /// The kernel refused a specific call.
    KernelRejected,
    /// Durable state unreadable or daemon/kernel state diverged.
    StateCorruption,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::KernelRejected => "kernel_rejected",
            ErrorKind::StateCorruption => "state_corruption",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Snapshot of daemon state as reported by `ListState`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateView {
    pub vifs: Vec<VifView>,
    pub rules: Vec<RuleView>,
    /// Zero-reference VIFs whose kernel removal failed and is pending
    /// retry; their slots stay reserved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphans: Vec<VifView>,
}

/// One virtual-interface slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VifView {
    pub name: String,
    pub slot: u16,
    pub ifindex: u32,
    pub ref_count: u32,
}

/// One forwarding rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleView {
    pub source: String,
    pub group: String,
    pub iif: String,
    pub oifs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = Request::InstallRule {
            source: "0.0.0.0".to_string(),
            group: "239.1.2.3".to_string(),
            iif: "veth0".to_string(),
            oifs: vec!["veth1".to_string()],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "install_rule");
        assert_eq!(json["payload"]["group"], "239.1.2.3");

        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_response_ok_omits_empty_state() {
        let json = serde_json::to_string(&Response::ok()).unwrap();
        assert_eq!(json, r#"{"status":"ok"}"#);
    }

    #[test]
    fn test_response_error_roundtrip() {
        let resp = Response::error(ErrorKind::CapacityExceeded, "no free VIF slot");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("capacity_exceeded"));
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn test_state_view_omits_empty_orphans() {
        let json = serde_json::to_value(StateView::default()).unwrap();
        assert!(json.get("orphans").is_none());

        let state = StateView {
            orphans: vec![VifView {
                name: "veth9".to_string(),
                slot: 3,
                ifindex: 42,
                ref_count: 0,
            }],
            ..StateView::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["orphans"][0]["slot"], 3);
    }

    #[test]
    fn test_list_state_is_bare_action() {
        let json = serde_json::to_string(&Request::ListState).unwrap();
        assert_eq!(json, r#"{"action":"list_state"}"#);
    }
}

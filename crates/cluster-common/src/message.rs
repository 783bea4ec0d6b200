// Wire envelope of cluster-internal messages and the listen-spec
// fingerprint that keys the shared-listener registry.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::INTERNAL_PREFIX;

/// Unique worker identifier, assigned by the supervisor starting at 1.
pub type WorkerId = u32;

// ---------------------------------------------------------------------------
// Listen spec
// ---------------------------------------------------------------------------

/// Materialized arguments of a worker's `listen` call.
///
/// Its deterministic JSON serialization doubles as the shared-listener
/// registry key: two workers asking for the same spec share one kernel
/// socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenSpec {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<u32>,
}

impl ListenSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, backlog: None }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Stable registry key. Field order is fixed by the struct, so equal
    /// specs always produce equal keys.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<u16> for ListenSpec {
    fn from(port: u16) -> Self {
        ListenSpec::new("0.0.0.0", port)
    }
}

impl From<(&str, u16)> for ListenSpec {
    fn from((host, port): (&str, u16)) -> Self {
        ListenSpec::new(host, port)
    }
}

impl From<SocketAddr> for ListenSpec {
    fn from(addr: SocketAddr) -> Self {
        ListenSpec::new(addr.ip().to_string(), addr.port())
    }
}

// ---------------------------------------------------------------------------
// Internal message envelope
// ---------------------------------------------------------------------------

/// The internal command set. Unknown commands fall through to the
/// catch-all arm and are acknowledged empty so requesters never hang.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalCmd {
    Online,
    QueryServer,
    Listening,
    Suicide,
    Disconnect,
    Unknown,
}

impl InternalCmd {
    pub fn from_bare(bare: &str) -> Self {
        match bare {
            "online" => InternalCmd::Online,
            "queryServer" => InternalCmd::QueryServer,
            "listening" => InternalCmd::Listening,
            "suicide" => InternalCmd::Suicide,
            "disconnect" => InternalCmd::Disconnect,
            _ => InternalCmd::Unknown,
        }
    }

    pub fn as_bare(&self) -> &'static str {
        match self {
            InternalCmd::Online => "online",
            InternalCmd::QueryServer => "queryServer",
            InternalCmd::Listening => "listening",
            InternalCmd::Suicide => "suicide",
            InternalCmd::Disconnect => "disconnect",
            InternalCmd::Unknown => "",
        }
    }
}

/// Wire shape of a cluster-internal message. The field names are part of
/// the protocol and are shared with every implementation of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalMessage {
    /// Full command including the reserved prefix.
    pub cmd: String,

    /// Request token set by a sender that expects a reply.
    #[serde(rename = "_requestEcho", default, skip_serializing_if = "Option::is_none")]
    pub request_echo: Option<String>,

    /// Token copied from a prior `_requestEcho`; resumes the matching
    /// continuation at the receiver.
    #[serde(rename = "_queryEcho", default, skip_serializing_if = "Option::is_none")]
    pub query_echo: Option<String>,

    /// Listen arguments (`queryServer`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ListenSpec>,

    /// Bound address (`listening`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,

    /// Arbitrary reply payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    /// Failure report on a reply, e.g. a shared bind that did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InternalMessage {
    /// Build a message for `cmd` with the reserved prefix applied.
    pub fn new(cmd: InternalCmd) -> Self {
        Self {
            cmd: format!("{}{}", INTERNAL_PREFIX, cmd.as_bare()),
            ..Default::default()
        }
    }

    /// Whether a raw channel value is a cluster-internal message.
    pub fn is_internal(value: &Value) -> bool {
        value
            .get("cmd")
            .and_then(Value::as_str)
            .is_some_and(|cmd| cmd.starts_with(INTERNAL_PREFIX))
    }

    /// Parse a raw channel value. `None` means the value is a user message
    /// and bypasses the cluster protocol.
    pub fn from_value(value: &Value) -> Option<InternalMessage> {
        if !Self::is_internal(value) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// The command with the reserved prefix stripped.
    pub fn bare_cmd(&self) -> &str {
        self.cmd.strip_prefix(INTERNAL_PREFIX).unwrap_or(&self.cmd)
    }

    pub fn command(&self) -> InternalCmd {
        InternalCmd::from_bare(self.bare_cmd())
    }

    pub fn with_request_echo(mut self, token: impl Into<String>) -> Self {
        self.request_echo = Some(token.into());
        self
    }

    pub fn with_query_echo(mut self, token: impl Into<String>) -> Self {
        self.query_echo = Some(token.into());
        self
    }

    pub fn with_args(mut self, args: ListenSpec) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl From<InternalCmd> for InternalMessage {
    fn from(cmd: InternalCmd) -> Self {
        InternalMessage::new(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = ListenSpec::new("127.0.0.1", 8080);
        let b = ListenSpec::new("127.0.0.1", 8080);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), ListenSpec::new("127.0.0.1", 8081).fingerprint());
        assert_ne!(a.fingerprint(), a.clone().with_backlog(128).fingerprint());
    }

    #[test]
    fn test_internal_detection_by_prefix() {
        let internal = InternalMessage::new(InternalCmd::Online).to_value();
        assert!(InternalMessage::is_internal(&internal));

        let user = serde_json::json!({"cmd": "myCommand", "payload": 1});
        assert!(!InternalMessage::is_internal(&user));
        assert!(InternalMessage::from_value(&user).is_none());

        let no_cmd = serde_json::json!({"hello": 1});
        assert!(!InternalMessage::is_internal(&no_cmd));
    }

    #[test]
    fn test_unknown_command_falls_through() {
        let value = serde_json::json!({"cmd": "NODE_CLUSTER_mystery"});
        let msg = InternalMessage::from_value(&value).unwrap();
        assert_eq!(msg.bare_cmd(), "mystery");
        assert_eq!(msg.command(), InternalCmd::Unknown);
    }

    #[test]
    fn test_reserved_field_names_on_the_wire() {
        let msg = InternalMessage::new(InternalCmd::QueryServer)
            .with_request_echo("1:0")
            .with_args(ListenSpec::new("0.0.0.0", 80));
        let value = msg.to_value();
        assert_eq!(value["cmd"], "NODE_CLUSTER_queryServer");
        assert_eq!(value["_requestEcho"], "1:0");
        assert_eq!(value["args"]["port"], 80);
        assert!(value.get("_queryEcho").is_none());
    }
}

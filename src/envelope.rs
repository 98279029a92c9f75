//! Message bodies exchanged between clients and servers.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The body of both requests and replies.
///
/// On requests `data` holds the handler input, on replies it holds the handler result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }
}

/// A request body as received, before it is checked for dispatchability.
#[derive(Debug, Deserialize)]
pub(crate) struct IncomingEnvelope {
    pub(crate) command: Option<String>,
    pub(crate) data: Option<Value>,
}

impl IncomingEnvelope {
    /// Returns `None` if the command is missing or empty, or if `data` is missing or null.
    pub(crate) fn into_dispatchable(self) -> Option<Envelope> {
        match (self.command, self.data) {
            (Some(command), Some(data)) if !command.is_empty() => Some(Envelope { command, data }),
            _ => None,
        }
    }
}

pub(crate) const TIMEOUT_MESSAGE: &str =
    "RMQ response timeout: Data has been sent, but the remote server did not respond.";

/// The structured payload describing an RPC call that timed out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutReply {
    pub success: bool,
    pub error_type: String,
    pub message: String,
}

impl Default for TimeoutReply {
    fn default() -> Self {
        Self {
            success: false,
            error_type: "timeout".into(),
            message: TIMEOUT_MESSAGE.into(),
        }
    }
}

use serde_json::Value;
use std::time::Duration;

use crate::envelope::Envelope;

/// A request to be sent with [`RpcClient::send`](super::RpcClient::send).
///
/// ```rust
/// use carrot_rpc::client::SendRequest;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let request = SendRequest::new("users.find", json!({"id": 42}))
///     .to("users")
///     .timeout(Duration::from_secs(2));
/// ```
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub(crate) to: Option<String>,
    pub(crate) message: Envelope,
    pub(crate) timeout: Option<Duration>,
}

impl SendRequest {
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            to: None,
            message: Envelope::new(command, data),
            timeout: None,
        }
    }

    /// The queue of the server. Defaults to [`DEFAULT_QUEUE`](super::DEFAULT_QUEUE) if
    /// unspecified or empty.
    #[must_use]
    pub fn to(mut self, queue: impl Into<String>) -> Self {
        self.to = Some(queue.into());
        self
    }

    /// How long to wait for the reply. Defaults to the client's default timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> &str {
        &self.message.command
    }
}

//! Facilities to call remote commands. Check out [`RpcClient`] as a starting point.
mod rpc_client;
mod send_request;

pub use rpc_client::{RpcClient, RpcClientBuilder, RpcClientError};
pub use send_request::SendRequest;

/// The queue requests are sent to when none is specified.
pub const DEFAULT_QUEUE: &str = "rpc_queue";

//! Facilities to serve commands from a queue. Check out [`RpcServer`] as a starting point.
mod handler;
mod rpc_server;

pub use handler::{ClosureHandler, Handler};
pub use rpc_server::{RpcServer, RpcServerBuilder, RpcServerError, ServerState};

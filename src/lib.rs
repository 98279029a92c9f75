//! `carrot-rpc` is a request/response RPC framework, built on top of [`lapin`],
//! to make it easy and ergonomic to call commands over RabbitMQ.
//!
//! [`RpcClient`](crate::client::RpcClient) and [`RpcServer`](crate::server::RpcServer)
//! are the best starting points to learn more about what `carrot-rpc` provides and how
//! to leverage it. Both borrow their broker connections from a
//! [`ResourcePool`](crate::pool::ResourcePool).
//!
//! ## Wire format
//!
//! Requests and replies are gzipped JSON documents shaped as `{"command": ..., "data": ...}`.
//! Requests carry the `reply_to` and `correlation_id` AMQP properties, replies carry the
//! `correlation_id` of the request they answer.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action against a local RabbitMQ.

pub mod amqp;
pub mod client;
pub mod codec;
pub mod envelope;
pub mod pool;
pub mod server;
pub mod transport;

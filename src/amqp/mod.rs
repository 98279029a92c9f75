//! Helpers for connecting to a rabbitmq broker, and the [`lapin`] implementation of the
//! [broker seam](crate::transport).

pub mod configuration;
mod convenience;
mod factory;
mod transport;

pub use factory::ConnectionFactory;
pub use transport::{AmqpChannel, AmqpConnection};

pub use lapin::{options, types, BasicProperties};

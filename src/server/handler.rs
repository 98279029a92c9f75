//! Command handlers, in the spirit of `tide`'s endpoints.
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Implementers of the `Handler` trait can be registered on an [`RpcServer`](super::RpcServer)
/// to process the `data` of a command.
///
/// # Scope
///
/// `handle` does not get access to the underlying broker channel.
/// The server takes care of decoding the request, publishing the reply and acking the message.
/// A handler error is not fatal: it is sent back to the caller as `{"error": <message>}`.
///
/// # Implementers
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be
/// registering closures with [`RpcServerBuilder::handle`](super::RpcServerBuilder::handle),
/// which wraps them in a [`ClosureHandler`].
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, data: Value) -> Result<Value, anyhow::Error>;
}

/// We also want to be able to use trait objects (and shared ones) as handlers.
/// E.g. Box<dyn Handler>.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, data: Value) -> Result<Value, anyhow::Error> {
        H::handle(self, data).await
    }
}

#[async_trait::async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, data: Value) -> Result<Value, anyhow::Error> {
        H::handle(self, data).await
    }
}

/// Wrapper type to turn an async closure into a [`Handler`].
///
/// We do not require closures to return an [`anyhow::Error`] directly: any error type that
/// can be converted into one will do.
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut, E> Handler for ClosureHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    async fn handle(&self, data: Value) -> Result<Value, anyhow::Error> {
        (self.0)(data).await.map_err(Into::into)
    }
}

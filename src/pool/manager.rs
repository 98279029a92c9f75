//! The factory contract of [`ResourcePool`](super::ResourcePool).

/// `Manager` creates and destroys the resources held by a [`ResourcePool`](super::ResourcePool).
///
/// # Implementers
///
/// [`ConnectionFactory`](crate::amqp::ConnectionFactory) manages AMQP connections and
/// [`InMemoryBroker`](crate::transport::memory::InMemoryBroker) manages in-process ones.
#[async_trait::async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Type of the resources handed out by the pool.
    type Type: Send + Sync + 'static;

    /// Creates a new resource.
    ///
    /// Fails if the backing service is unreachable.
    async fn create(&self) -> Result<Self::Type, anyhow::Error>;

    /// Tears a resource down.
    ///
    /// Best effort: the pool logs failures and carries on.
    async fn destroy(&self, obj: Self::Type) -> Result<(), anyhow::Error>;

    /// Whether a resource hit a terminal error and must not go back to the idle set.
    ///
    /// It is checked when a resource is released, never before handing it out.
    fn is_broken(&self, _obj: &Self::Type) -> bool {
        false
    }
}

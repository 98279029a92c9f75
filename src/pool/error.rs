/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("Failed to create a new pooled resource")]
    Backend(#[source] anyhow::Error),
    #[error("The pool has been shut down")]
    Closed,
    #[error("Invalid pool configuration: {0}")]
    Config(String),
}

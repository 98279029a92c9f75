use carrot_rpc::amqp::{configuration::BrokerSettings, ConnectionFactory};
use carrot_rpc::client::{RpcClient, RpcClientError, SendRequest};
use carrot_rpc::pool::ResourcePool;
use serde_json::json;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Start `cargo run --example rpc_server` first.
    let settings = BrokerSettings::default();
    let pool = ResourcePool::builder(ConnectionFactory::new_from_config(&settings)?)
        .max_size(4)
        .build()?;
    let client = RpcClient::builder(pool.clone())
        .default_timeout(Duration::from_secs(3))
        .build();

    let pong = client.send(SendRequest::new("ping", json!({}))).await?;
    println!("ping -> {}", pong);

    let total: f64 = client.call("rpc_queue", "sum", &[1.5, 2.5, 38.0]).await?;
    println!("sum -> {}", total);

    // Handler failures come back as `{"error": ...}` replies.
    let failure = client.send(SendRequest::new("sum", json!("nope"))).await?;
    println!("sum(\"nope\") -> {}", failure);

    // Nobody listens on this queue: the call times out.
    match client
        .send(
            SendRequest::new("ping", json!({}))
                .to("nobody_home")
                .timeout(Duration::from_millis(500)),
        )
        .await
    {
        Err(RpcClientError::Timeout(reply)) => println!("timeout -> {}", reply.message),
        other => println!("unexpected outcome: {:?}", other),
    }

    pool.shutdown().await;
    Ok(())
}

use carrot_rpc::amqp::{configuration::BrokerSettings, ConnectionFactory};
use carrot_rpc::client::DEFAULT_QUEUE;
use carrot_rpc::pool::ResourcePool;
use carrot_rpc::server::RpcServer;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = BrokerSettings::default();
    let connection_factory = ConnectionFactory::new_from_config(&settings)?;

    // The server holds a single connection while it listens, the pool hands out a fresh one
    // whenever it has to reconnect.
    let pool = ResourcePool::builder(connection_factory)
        .max_size(2)
        .build()?;

    let server = RpcServer::builder(pool.clone())
        .handle("ping", |_data: Value| async {
            Ok::<_, anyhow::Error>(json!({"pong": true}))
        })
        .handle("sum", |data: Value| async move {
            let numbers = data
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("`sum` expects an array of numbers"))?;
            let total: f64 = numbers.iter().filter_map(Value::as_f64).sum();
            Ok::<_, anyhow::Error>(json!(total))
        })
        .build();

    // Serve until Ctrl+C, then give every connection back to the broker.
    server
        .listen_until_shutdown(DEFAULT_QUEUE, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    pool.shutdown().await;

    Ok(())
}

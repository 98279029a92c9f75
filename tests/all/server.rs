use crate::helpers::{get_client, get_pool, random_queue, wait_for_state, RunningServer};
use carrot_rpc::client::SendRequest;
use carrot_rpc::codec::{unzip, zip};
use carrot_rpc::envelope::Envelope;
use carrot_rpc::pool::{PoolError, ResourcePool};
use carrot_rpc::server::{Handler, RpcServer, RpcServerError, ServerState};
use carrot_rpc::transport::memory::InMemoryBroker;
use carrot_rpc::transport::{BrokerChannel, BrokerConnection, MessageProperties, QueueOptions};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ping_server(broker: &InMemoryBroker) -> RpcServer<InMemoryBroker> {
    RpcServer::builder(get_pool(broker))
        .handle("ping", |_data: Value| async {
            Ok::<_, anyhow::Error>(json!({"pong": true}))
        })
        .handle("fail", |_data: Value| async {
            Err::<Value, _>(anyhow::anyhow!("database unavailable"))
        })
        .handle("panic", |_data: Value| async {
            if true {
                panic!("handler exploded");
            }
            Ok::<Value, anyhow::Error>(Value::Null)
        })
        .reconnect_delay(Duration::from_millis(50))
        .build()
}

/// Declare a shared queue to collect replies published by the server.
async fn reply_queue(broker: &InMemoryBroker) -> String {
    let queue = random_queue();
    let connection = broker.connect().await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    channel
        .declare_queue(&queue, QueueOptions::command_queue())
        .await
        .unwrap();
    channel.close().await.unwrap();
    connection.close().await.unwrap();
    queue
}

#[tokio::test]
async fn an_empty_queue_name_is_rejected() {
    let broker = InMemoryBroker::new();
    let server = ping_server(&broker);

    let outcome = server.listen("").await;

    assert!(matches!(outcome, Err(RpcServerError::Configuration(_))));
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test]
async fn an_unreachable_broker_at_startup_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let server = ping_server(&broker);

    let outcome = server.listen(&random_queue()).await;

    assert!(matches!(
        outcome,
        Err(RpcServerError::Pool(PoolError::Backend(_)))
    ));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn unknown_commands_get_an_error_reply() {
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let server = RunningServer::start(ping_server(&broker), &queue).await;
    let client = get_client(&broker);

    let reply = client
        .send(SendRequest::new("frobnicate", json!({})).to(queue.as_str()))
        .await
        .unwrap();

    assert_eq!(reply, json!({"error": "Unknown method: frobnicate"}));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn handler_failures_are_replied_and_do_not_stop_the_server() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let server = RunningServer::start(ping_server(&broker), &queue).await;
    let client = get_client(&broker);

    // Act
    let failed = client
        .send(SendRequest::new("fail", json!({})).to(queue.as_str()))
        .await
        .unwrap();
    let panicked = client
        .send(SendRequest::new("panic", json!({})).to(queue.as_str()))
        .await
        .unwrap();
    let next = client
        .send(SendRequest::new("ping", json!({})).to(queue.as_str()))
        .await
        .unwrap();

    // Assert
    assert_eq!(failed, json!({"error": "database unavailable"}));
    assert_eq!(panicked, json!({"error": "handler exploded"}));
    assert_eq!(next, json!({"pong": true}));
    assert_eq!(server.server.state(), ServerState::Listening);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn requests_are_acked_once_answered() {
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let server = RunningServer::start(ping_server(&broker), &queue).await;
    let client = get_client(&broker);

    client
        .send(SendRequest::new("ping", json!({})).to(queue.as_str()))
        .await
        .unwrap();

    assert_eq!(broker.message_count(&queue), 0);
    assert_eq!(broker.unacked_count(), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn replies_carry_the_command_and_the_correlation_id() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let replies = reply_queue(&broker).await;
    let server = RunningServer::start(ping_server(&broker), &queue).await;

    // Act
    broker.publish(
        &queue,
        zip(&Envelope::new("ping", json!({}))).unwrap(),
        MessageProperties::request(replies.as_str(), "call-42"),
    );

    // Assert
    let connection = broker.connect().await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    let mut deliveries = channel.consume(&replies, "").await.unwrap();
    let reply = futures_util::StreamExt::next(&mut deliveries)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.properties.correlation_id.as_deref(), Some("call-42"));
    let envelope: Envelope = unzip(&reply.data).unwrap();
    assert_eq!(envelope, Envelope::new("ping", json!({"pong": true})));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_requests_are_dropped_without_a_reply() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let replies = reply_queue(&broker).await;
    let server = RunningServer::start(ping_server(&broker), &queue).await;
    let properties = MessageProperties::request(replies.as_str(), "id");

    // Act
    broker.publish(&queue, b"garbage".to_vec(), properties.clone());
    broker.publish(&queue, zip(&json!({"data": {}})).unwrap(), properties.clone());
    broker.publish(
        &queue,
        zip(&json!({"command": "", "data": {}})).unwrap(),
        properties.clone(),
    );
    broker.publish(
        &queue,
        zip(&json!({"command": "ping", "data": null})).unwrap(),
        properties.clone(),
    );
    broker.publish(&queue, zip(&json!({"command": "ping"})).unwrap(), properties);
    // Still serving afterwards.
    let reply = get_client(&broker)
        .send(SendRequest::new("ping", json!({})).to(queue.as_str()))
        .await
        .unwrap();

    // Assert
    assert_eq!(reply, json!({"pong": true}));
    assert_eq!(broker.message_count(&replies), 0);
    assert_eq!(broker.message_count(&queue), 0);
    assert_eq!(broker.unacked_count(), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn requests_without_reply_to_are_dropped() {
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = RpcServer::builder(get_pool(&broker))
        .handle("count", {
            let calls = Arc::clone(&calls);
            move |_data: Value| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(Value::Null)
                }
            }
        })
        .build();
    let server = RunningServer::start(server, &queue).await;

    broker.publish(
        &queue,
        zip(&Envelope::new("count", json!({}))).unwrap(),
        MessageProperties::default(),
    );
    let reply = get_client(&broker)
        .send(SendRequest::new("count", json!({})).to(queue.as_str()))
        .await
        .unwrap();

    // Both requests reached the handler, only one could be answered.
    assert_eq!(reply, Value::Null);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.message_count(&queue), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn the_last_registration_of_a_command_wins() {
    struct Constant(&'static str);

    #[async_trait::async_trait]
    impl Handler for Constant {
        async fn handle(&self, _data: Value) -> Result<Value, anyhow::Error> {
            Ok(json!(self.0))
        }
    }

    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let server = RpcServer::builder(get_pool(&broker))
        .handle_with("version", Constant("v1"))
        .handle_with("version", Constant("v2"))
        .build();
    assert!(server.handles("version"));
    let server = RunningServer::start(server, &queue).await;

    let reply = get_client(&broker)
        .send(SendRequest::new("version", json!({})).to(queue.as_str()))
        .await
        .unwrap();

    assert_eq!(reply, json!("v2"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn the_server_reconnects_after_losing_the_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let pool = ResourcePool::builder(broker.clone())
        .max_size(1)
        .build()
        .unwrap();
    let server = RpcServer::builder(pool.clone())
        .handle("ping", |_data: Value| async {
            Ok::<_, anyhow::Error>(json!({"pong": true}))
        })
        .reconnect_delay(Duration::from_millis(200))
        .build();
    let server = RunningServer::start(server, &queue).await;
    let mut state = server.server.watch_state();

    // Act
    broker.fail_connections("connection reset by peer");
    wait_for_state(&mut state, ServerState::Reconnecting).await;
    // Hold the only pooled connection so that the new session waits in `Starting`.
    let held = pool.get().await.unwrap();
    wait_for_state(&mut state, ServerState::Starting).await;
    drop(held);
    wait_for_state(&mut state, ServerState::Listening).await;

    // Assert
    let reply = get_client(&broker)
        .send(SendRequest::new("ping", json!({})).to(queue.as_str()))
        .await
        .unwrap();
    assert_eq!(reply, json!({"pong": true}));
    assert_eq!(broker.consumer_count(&queue), 1);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn the_server_keeps_retrying_while_the_broker_is_down() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let server = RunningServer::start(ping_server(&broker), &queue).await;
    let mut state = server.server.watch_state();

    // Act
    broker.set_reachable(false);
    broker.fail_connections("broker restarting");
    wait_for_state(&mut state, ServerState::Reconnecting).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_ne!(server.server.state(), ServerState::Listening);
    broker.set_reachable(true);

    // Assert
    wait_for_state(&mut state, ServerState::Listening).await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutting_down_stops_consuming_and_gives_the_connection_back() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let pool = ResourcePool::builder(broker.clone())
        .max_size(1)
        .build()
        .unwrap();
    let server = RpcServer::builder(pool.clone()).build();
    let server = RunningServer::start(server, &queue).await;
    assert_eq!(pool.status().in_use, 1);

    // Act
    let outcome = server.stop().await;

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(broker.consumer_count(&queue), 0);
    assert_eq!(pool.status().in_use, 0);
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn the_state_goes_back_to_stopped_after_shutdown() {
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let server = RunningServer::start(ping_server(&broker), &queue).await;
    let handle = server.server.clone();

    server.stop().await.unwrap();

    assert_eq!(handle.state(), ServerState::Stopped);
}

#[tokio::test]
async fn shutdown_is_honoured_while_waiting_for_a_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ResourcePool::builder(broker.clone())
        .max_size(1)
        .build()
        .unwrap();
    let _held = pool.get().await.unwrap();
    let server = RpcServer::builder(pool.clone()).build();
    let mut state = server.watch_state();
    let (shutdown, on_shutdown) = tokio::sync::oneshot::channel::<()>();
    let listening = tokio::spawn({
        let server = server.clone();
        let queue = random_queue();
        async move {
            server
                .listen_until_shutdown(&queue, async {
                    let _ = on_shutdown.await;
                })
                .await
        }
    });
    wait_for_state(&mut state, ServerState::Starting).await;

    // Act
    shutdown.send(()).unwrap();

    // Assert
    let outcome = tokio::time::timeout(Duration::from_secs(1), listening)
        .await
        .expect("The server ignored the shutdown signal")
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn handlers_for_an_empty_command_are_ignored() {
    let broker = InMemoryBroker::new();

    let server = RpcServer::builder(get_pool(&broker))
        .handle("", |_data: Value| async { Ok::<_, anyhow::Error>(Value::Null) })
        .build();

    assert!(!server.handles(""));
}

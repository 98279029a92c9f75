use crate::helpers::{get_client, get_pool, random_queue, RunningServer};
use carrot_rpc::client::{RpcClient, RpcClientError, SendRequest, DEFAULT_QUEUE};
use carrot_rpc::codec::{unzip, zip};
use carrot_rpc::envelope::{Envelope, TimeoutReply};
use carrot_rpc::server::RpcServer;
use carrot_rpc::transport::memory::InMemoryBroker;
use carrot_rpc::transport::{BrokerChannel, BrokerConnection, MessageProperties, QueueOptions};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

/// Consume `queue` with a raw channel and answer the first request with `replies`, in order.
async fn fake_server(broker: &InMemoryBroker, queue: &str, replies: Vec<(Option<String>, Vec<u8>)>) {
    let connection = broker.connect().await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    channel
        .declare_queue(queue, QueueOptions::command_queue())
        .await
        .unwrap();
    let mut requests = channel.consume(queue, "fake-server").await.unwrap();

    tokio::spawn(async move {
        let request = requests.next().await.unwrap().unwrap();
        let reply_to = request.properties.reply_to.clone().unwrap();
        for (correlation_id, body) in replies {
            let correlation_id =
                correlation_id.or_else(|| request.properties.correlation_id.clone());
            channel
                .publish(&reply_to, &body, MessageProperties::reply(correlation_id))
                .await
                .unwrap();
        }
        request.ack().await.unwrap();
        // Keep the connection alive until the test is over.
        let _connection = connection;
        std::future::pending::<()>().await;
    });
}

#[tokio::test]
async fn requests_without_a_queue_go_to_the_default_queue() {
    // Arrange
    let broker = InMemoryBroker::new();
    let server = RpcServer::builder(get_pool(&broker))
        .handle("ping", |_data: Value| async {
            Ok::<_, anyhow::Error>(json!({"pong": true}))
        })
        .build();
    let server = RunningServer::start(server, DEFAULT_QUEUE).await;
    let client = get_client(&broker);

    // Act
    let reply = client
        .send(SendRequest::new("ping", json!({})).to(""))
        .await
        .unwrap();

    // Assert
    assert_eq!(reply, json!({"pong": true}));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn a_zero_timeout_is_rejected_before_touching_the_broker() {
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);

    let outcome = client
        .send(SendRequest::new("ping", json!({})).timeout(Duration::ZERO))
        .await;

    assert!(matches!(outcome, Err(RpcClientError::Configuration(_))));
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn a_call_without_reply_times_out_and_cleans_up() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = get_client(&broker);
    let queue = random_queue();

    // Act
    let outcome = client
        .send(
            SendRequest::new("ping", json!({}))
                .to(queue.as_str())
                .timeout(Duration::from_secs(1)),
        )
        .await;

    // Assert
    match outcome {
        Err(RpcClientError::Timeout(reply)) => {
            assert_eq!(reply, TimeoutReply::default());
            assert!(!reply.success);
            assert_eq!(reply.error_type, "timeout");
        }
        other => panic!("Expected a timeout, got {:?}", other),
    }
    let status = client.pool().status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.idle, 1);
    assert_eq!(broker.open_channels(), 0);
    assert!(broker.queue_names().is_empty(), "The reply queue was not deleted");
}

#[tokio::test(start_paused = true)]
async fn the_default_timeout_applies_when_none_is_given() {
    let broker = InMemoryBroker::new();
    let client = RpcClient::builder(get_pool(&broker))
        .default_timeout(Duration::from_millis(300))
        .build();

    let started = tokio::time::Instant::now();
    let outcome = client
        .send(SendRequest::new("ping", json!({})).to(random_queue()))
        .await;

    assert!(matches!(outcome, Err(RpcClientError::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn replies_for_other_calls_are_ignored() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    fake_server(
        &broker,
        &queue,
        vec![
            (
                Some("someone-else".into()),
                zip(&Envelope::new("ping", json!("wrong"))).unwrap(),
            ),
            (None, zip(&Envelope::new("ping", json!("right"))).unwrap()),
        ],
    )
    .await;
    let client = get_client(&broker);

    // Act
    let reply = client
        .send(SendRequest::new("ping", json!({})).to(queue.as_str()))
        .await
        .unwrap();

    // Assert
    assert_eq!(reply, json!("right"));
}

#[tokio::test]
async fn replies_that_are_not_envelopes_are_returned_as_they_are() {
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    fake_server(&broker, &queue, vec![(None, zip(&json!([1, 2, 3])).unwrap())]).await;
    let client = get_client(&broker);

    let reply = client
        .send(SendRequest::new("list", json!({})).to(queue.as_str()))
        .await
        .unwrap();

    assert_eq!(reply, json!([1, 2, 3]));
}

#[tokio::test]
async fn an_undecodable_reply_is_a_codec_error() {
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    fake_server(&broker, &queue, vec![(None, b"not gzip at all".to_vec())]).await;
    let client = get_client(&broker);

    let outcome = client
        .send(SendRequest::new("ping", json!({})).to(queue.as_str()))
        .await;

    assert!(matches!(outcome, Err(RpcClientError::Codec(_))));
    assert_eq!(client.pool().status().in_use, 0);
}

#[tokio::test]
async fn the_request_is_sent_as_a_gzipped_envelope() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let connection = broker.connect().await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    channel
        .declare_queue(&queue, QueueOptions::command_queue())
        .await
        .unwrap();
    let mut requests = channel.consume(&queue, "inspector").await.unwrap();
    let client = get_client(&broker);

    // Act
    let call = tokio::spawn({
        let queue = queue.clone();
        async move {
            client
                .send(
                    SendRequest::new("users.find", json!({"id": 7}))
                        .to(queue)
                        .timeout(Duration::from_millis(200)),
                )
                .await
        }
    });
    let request = requests.next().await.unwrap().unwrap();

    // Assert
    let envelope: Envelope = unzip(&request.data).unwrap();
    assert_eq!(envelope, Envelope::new("users.find", json!({"id": 7})));
    let reply_to = request.properties.reply_to.clone().unwrap();
    assert!(reply_to.starts_with("amq.gen-"));
    assert!(request.properties.correlation_id.is_some());
    request.ack().await.unwrap();
    assert!(matches!(call.await.unwrap(), Err(RpcClientError::Timeout(_))));
}

#[tokio::test]
async fn losing_the_connection_mid_call_fails_the_call_and_drops_the_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let client = get_client(&broker);
    let call = tokio::spawn({
        let client = client.clone();
        let queue = queue.clone();
        async move { client.send(SendRequest::new("ping", json!({})).to(queue)).await }
    });
    while broker.open_channels() == 0 {
        tokio::task::yield_now().await;
    }

    // Act
    broker.fail_connections("connection reset by peer");

    // Assert
    let outcome = call.await.unwrap();
    assert!(matches!(outcome, Err(RpcClientError::ReplyStreamClosed)));
    let status = client.pool().status();
    assert_eq!(status.size, 0);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn an_unreachable_broker_is_a_pool_error() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let client = get_client(&broker);

    let outcome = client
        .send(SendRequest::new("ping", json!({})).to(random_queue()))
        .await;

    assert!(matches!(outcome, Err(RpcClientError::Pool(_))));
}

#[tokio::test]
async fn typed_calls_serialize_and_deserialize_payloads() {
    #[derive(serde::Serialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    let broker = InMemoryBroker::new();
    let queue = random_queue();
    let server = RpcServer::builder(get_pool(&broker))
        .handle("add", |data: Value| async move {
            let a = data["a"].as_i64().unwrap_or_default();
            let b = data["b"].as_i64().unwrap_or_default();
            Ok::<_, anyhow::Error>(json!(a + b))
        })
        .build();
    let server = RunningServer::start(server, &queue).await;
    let client = get_client(&broker);

    let sum: i64 = client.call(&queue, "add", &Add { a: 2, b: 40 }).await.unwrap();

    assert_eq!(sum, 42);
    server.stop().await.unwrap();
}

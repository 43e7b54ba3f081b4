use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use broker_rpc::{
    client_registry::ClientRegistry,
    config::ClientConfig,
    context::CallingContext,
    memory::MemoryBroker,
    message::{CorrelationId, Message},
    rpc::{ClientState, RpcClient},
};
use bytes::Bytes;

mod implementations;

use implementations::{echo_worker::EchoWorker, init_logger, silent_worker::SilentWorker};

const ECHO_QUEUE: &str = "worker.echo";
const SLEEP_QUEUE: &str = "worker.sleep";

fn make_client(broker: &MemoryBroker, context: &CallingContext) -> RpcClient {
    RpcClient::new(Arc::new(broker.clone()), ClientConfig::default(), context).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_echo() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = EchoWorker::spawn(&broker, ECHO_QUEUE, Duration::from_millis(50), |_| {
        Bytes::from_static(b"pong")
    });

    let client = make_client(&broker, CallingContext::root());

    let start = Instant::now();
    let reply = client
        .call(ECHO_QUEUE, "ping", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(reply, Bytes::from_static(b"pong"));
    assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");

    // Resolved request is removed
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_timeout() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = SilentWorker::spawn(&broker, SLEEP_QUEUE);

    let client = make_client(&broker, CallingContext::root());

    let start = Instant::now();
    let result = client
        .call(SLEEP_QUEUE, "x", Some(Duration::from_secs(1)))
        .await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(broker_rpc::Error::Timeout(_))));
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1200), "{elapsed:?}");

    // Timed out request stays in the registry
    assert_eq!(client.pending_requests().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_expiration() {
    init_logger();

    let broker = MemoryBroker::new();
    let mut worker = SilentWorker::spawn(&broker, SLEEP_QUEUE);

    let client = make_client(&broker, CallingContext::root());

    let id = client
        .send_request(SLEEP_QUEUE, "x", Some(Duration::from_millis(750)))
        .await
        .unwrap();

    let request = worker.next_request().await.unwrap();
    assert_eq!(request.properties.correlation_id, Some(id));
    assert_eq!(request.expiration_ms(), Some(750));
    assert_eq!(request.properties.reply_to, client.reply_channel().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_reply_is_dropped() {
    init_logger();

    let broker = MemoryBroker::new();
    let mut worker = SilentWorker::spawn(&broker, SLEEP_QUEUE);

    let client = make_client(&broker, CallingContext::root());

    let id = client.send_request(SLEEP_QUEUE, "x", None).await.unwrap();
    let request = worker.next_request().await.unwrap();
    let reply_to = request.properties.reply_to.clone().unwrap();

    // Reply to a request no one has sent
    let mut stray = Message::new("stray");
    stray.properties.correlation_id = Some(CorrelationId::generate());
    assert!(broker.publish(&reply_to, stray));

    let result = client
        .wait_response(&id, Some(Duration::from_millis(300)))
        .await;
    assert!(matches!(result, Err(broker_rpc::Error::Timeout(_))));

    // Reply after the caller gave up is dropped by the loop
    assert!(broker.publish(&reply_to, Message::reply_to(&request, "late")));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(broker.queue_len(&reply_to), Some(0));
    assert_eq!(client.pending_requests().await, 1);
    assert_eq!(client.state().await, ClientState::Connected);
    assert!(matches!(
        client.wait_response(&id, Some(Duration::from_millis(10))).await,
        Err(broker_rpc::Error::UnknownRequest(_))
    ));

    assert_eq!(client.sweep_abandoned().await, 1);
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recover_after_transport_failure() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = EchoWorker::echo(&broker, ECHO_QUEUE, Duration::from_millis(10));

    let client = make_client(&broker, CallingContext::root());

    let reply = client
        .call(ECHO_QUEUE, "before", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"before"));
    let first_queue = client.reply_channel().await.unwrap();

    broker.sever_connections();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(client.state().await, ClientState::Connected);
    assert_ne!(client.reply_channel().await.unwrap(), first_queue);

    let reply = client
        .call(ECHO_QUEUE, "after", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"after"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_publish_after_connection_reset() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = EchoWorker::echo(&broker, ECHO_QUEUE, Duration::from_millis(10));

    let client = make_client(&broker, CallingContext::root());
    client
        .call(ECHO_QUEUE, "warmup", Some(Duration::from_secs(2)))
        .await
        .unwrap();

    broker.fail_next_publishes(1);

    let reply = client
        .call(ECHO_QUEUE, "retried", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"retried"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_is_idempotent() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = EchoWorker::echo(&broker, ECHO_QUEUE, Duration::from_millis(10));

    let client = make_client(&broker, CallingContext::root());
    client
        .call(ECHO_QUEUE, "x", Some(Duration::from_secs(2)))
        .await
        .unwrap();

    client.close().await;
    client.close().await;

    assert_eq!(client.state().await, ClientState::Closed);
    assert!(!client.is_consuming().await);
    assert_eq!(broker.live_connections(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.connects_total(), 1);

    // Next call reconnects
    let reply = client
        .call(ECHO_QUEUE, "again", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"again"));
    assert_eq!(broker.connects_total(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reply_to_previous_channel_is_lost() {
    init_logger();

    let broker = MemoryBroker::new();
    let mut silent = SilentWorker::spawn(&broker, SLEEP_QUEUE);
    let _echo = EchoWorker::echo(&broker, ECHO_QUEUE, Duration::from_millis(10));

    let client = make_client(&broker, CallingContext::root());

    let id = client.send_request(SLEEP_QUEUE, "x", None).await.unwrap();
    let request = silent.next_request().await.unwrap();
    let old_reply_to = request.properties.reply_to.clone().unwrap();

    broker.sever_connections();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(client.state().await, ClientState::Connected);
    assert_ne!(client.reply_channel().await.unwrap(), old_reply_to);

    // Old reply queue was deleted with its connection
    assert!(!broker.publish(&old_reply_to, Message::reply_to(&request, "reply")));

    let result = client
        .wait_response(&id, Some(Duration::from_millis(300)))
        .await;
    assert!(matches!(result, Err(broker_rpc::Error::Timeout(_))));

    let reply = client
        .call(ECHO_QUEUE, "after", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"after"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_owner_end_closes_until_next_call() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = EchoWorker::echo(&broker, ECHO_QUEUE, Duration::from_millis(10));

    let context = CallingContext::new();
    let client = make_client(&broker, &context);
    client
        .call(ECHO_QUEUE, "x", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(broker.live_connections(), 1);

    drop(context);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!client.is_consuming().await);
    assert_eq!(client.state().await, ClientState::Closed);
    assert_eq!(broker.live_connections(), 0);

    // A later request reconnects
    let reply = client
        .call(ECHO_QUEUE, "again", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"again"));
    assert_eq!(broker.connects_total(), 2);

    // The new loop outlives the ended context until the client is closed
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.is_consuming().await);
    assert_eq!(client.state().await, ClientState::Connected);

    let reply = client
        .call(ECHO_QUEUE, "still", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"still"));

    client.close().await;
    assert!(!client.is_consuming().await);
    assert_eq!(broker.live_connections(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_racing_call() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = EchoWorker::echo(&broker, ECHO_QUEUE, Duration::from_millis(1));

    let config = ClientConfig::default().with_poll_interval(Duration::from_millis(5));
    let client = Arc::new(
        RpcClient::new(Arc::new(broker.clone()), config, CallingContext::root()).unwrap(),
    );

    for i in 0..50 {
        let closing = tokio::spawn({
            let client = client.clone();
            async move { client.close().await }
        });

        let calling = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call(ECHO_QUEUE, format!("call {i}"), Some(Duration::from_millis(300)))
                    .await
            }
        });

        closing.await.unwrap();
        let result = calling.await.unwrap();

        assert!(broker.live_connections() <= 1);

        match result {
            Ok(reply) => assert_eq!(reply, Bytes::from(format!("call {i}"))),
            // Only a close after the publish may lose the reply, and then nothing runs
            Err(broker_rpc::Error::Timeout(_)) => {
                assert!(!client.is_consuming().await, "call {i}");
                assert_eq!(broker.live_connections(), 0, "call {i}");
            }
            Err(e) => panic!("Unexpected error for call {i}: {e}"),
        }
    }

    let reply = client
        .call(ECHO_QUEUE, "last", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"last"));
    assert_eq!(broker.live_connections(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_contexts() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = EchoWorker::echo(&broker, ECHO_QUEUE, Duration::from_millis(50));

    let registry =
        ClientRegistry::new(Arc::new(broker.clone()), ClientConfig::default()).unwrap();
    let first = CallingContext::new();
    let second = CallingContext::new();

    let (first_reply, second_reply) = tokio::join!(
        registry.call(&first, ECHO_QUEUE, "first", Some(Duration::from_secs(2))),
        registry.call(&second, ECHO_QUEUE, "second", Some(Duration::from_secs(2))),
    );

    assert_eq!(first_reply.unwrap(), Bytes::from_static(b"first"));
    assert_eq!(second_reply.unwrap(), Bytes::from_static(b"second"));

    // Contexts don't share connections
    assert_eq!(broker.live_connections(), 2);
    assert_ne!(
        registry.client(&first).unwrap().reply_channel().await,
        registry.client(&second).unwrap().reply_channel().await
    );

    // Closing one context's client leaves the other intact
    registry.close(&first).await;
    assert_eq!(broker.live_connections(), 1);
    assert_eq!(
        registry.client(&second).unwrap().state().await,
        ClientState::Connected
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_concurrent_calls_single_client() {
    init_logger();

    let broker = MemoryBroker::new();
    let _worker = EchoWorker::echo(&broker, ECHO_QUEUE, Duration::from_millis(20));

    let client = Arc::new(make_client(&broker, CallingContext::root()));

    let calls = (0..32).map(|i| {
        let client = client.clone();

        tokio::spawn(async move {
            let payload = format!("request {i}");
            let reply = client
                .call(ECHO_QUEUE, payload.clone(), Some(Duration::from_secs(2)))
                .await
                .unwrap();

            assert_eq!(reply, Bytes::from(payload));
        })
    });

    for call in futures::future::join_all(calls).await {
        call.unwrap();
    }

    assert_eq!(client.pending_requests().await, 0);
    assert_eq!(broker.live_connections(), 1);
}

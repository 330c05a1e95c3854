//! End-to-end broker/client tests over loopback TCP

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::SinkExt;
use ipc_bus::error::{Error, RequestError};
use ipc_bus::protocol::{BusCommand, JsonCodec, StateRow};
use ipc_bus::{BrokerConfig, BusAddress, ClientConfig, IpcBusBroker, IpcBusClient, IpcBusEvent};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_test::{assert_err, assert_ok};
use tokio_util::codec::FramedWrite;

async fn start_broker() -> IpcBusBroker {
    let broker = IpcBusBroker::new(
        BrokerConfig::with_address(BusAddress::port(0)).peer_name("Broker_test"),
    );
    assert_ok!(broker.start(None).await);
    broker
}

async fn connect(broker: &IpcBusBroker, peer_name: &str) -> IpcBusClient {
    let config = ClientConfig::new(broker.bus_address()).peer_name(peer_name);
    IpcBusClient::connect(config).await.unwrap()
}

/// Subscriptions travel asynchronously; wait until the broker has them
async fn wait_for_subscribers(broker: &IpcBusBroker, channel: &str, count: u32) {
    for _ in 0..200 {
        let total: u32 = broker
            .query_state()
            .iter()
            .filter(|row| row.channel == channel)
            .map(|row| row.count)
            .sum();
        if total == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("channel {} never reached {} subscriptions", channel, count);
}

async fn wait_for(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

type Seen = Arc<Mutex<Vec<Value>>>;

fn collector() -> (Seen, impl Fn(&IpcBusEvent, &[Value]) + Send + Sync) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |_: &IpcBusEvent, args: &[Value]| {
        sink.lock().unwrap().extend(args.iter().cloned());
    })
}

#[tokio::test]
async fn test_publish_reaches_subscribers() {
    let broker = start_broker().await;
    let subscriber = connect(&broker, "Node_sub").await;
    let publisher = connect(&broker, "Node_pub").await;

    let (seen, listener) = collector();
    subscriber.on("news", listener).unwrap();
    wait_for_subscribers(&broker, "news", 1).await;

    publisher.send("news", vec![json!("hi")]).unwrap();
    publisher.send("weather", vec![json!("rain")]).unwrap();

    wait_for(|| !seen.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!("hi")]);

    broker.stop().await;
}

#[tokio::test]
async fn test_refcounted_unsubscribe() {
    let broker = start_broker().await;
    let p1 = connect(&broker, "P1").await;
    let p2 = connect(&broker, "P2").await;

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deliveries);
    let first = p1
        .on("news", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let second = p1.on("news", |_, _| {}).unwrap();
    wait_for_subscribers(&broker, "news", 2).await;

    // count 2 -> 1: still delivered once per send
    assert!(p1.off("news", second));
    wait_for_subscribers(&broker, "news", 1).await;

    p2.send("news", vec![json!("hi")]).unwrap();
    wait_for(|| deliveries.load(Ordering::SeqCst) == 1).await;

    // count 1 -> 0: no longer delivered
    assert!(p1.off("news", first));
    wait_for_subscribers(&broker, "news", 0).await;

    p2.send("news", vec![json!("again")]).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);

    broker.stop().await;
}

#[tokio::test]
async fn test_request_resolved() {
    let broker = start_broker().await;
    let service = connect(&broker, "Node_math").await;
    let caller = connect(&broker, "Node_caller").await;

    service
        .on("math/add", |event, args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            event.request.as_ref().unwrap().resolve(sum);
        })
        .unwrap();
    wait_for_subscribers(&broker, "math/add", 1).await;

    let reply = caller
        .request("math/add", vec![json!(1), json!(2)], Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(reply.payload, json!(3));
    assert_eq!(reply.event.channel, "math/add");
    assert_eq!(reply.event.sender.peer_name, "Node_math");
    assert_eq!(broker.pending_requests(), 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_request_rejected() {
    let broker = start_broker().await;
    let service = connect(&broker, "Node_math").await;
    let caller = connect(&broker, "Node_caller").await;

    service
        .on("math/div", |event, _| {
            event.request.as_ref().unwrap().reject("division by zero");
        })
        .unwrap();
    wait_for_subscribers(&broker, "math/div", 1).await;

    let err = caller
        .request("math/div", vec![json!(1), json!(0)], Duration::from_secs(1))
        .await
        .unwrap_err();

    match err {
        Error::Request(RequestError::Rejected { event, reason }) => {
            assert_eq!(event.channel, "math/div");
            assert_eq!(reason, "division by zero");
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    broker.stop().await;
}

#[tokio::test]
async fn test_only_first_reply_wins() {
    let broker = start_broker().await;
    let fast = connect(&broker, "Node_fast").await;
    let slow = connect(&broker, "Node_slow").await;
    let caller = connect(&broker, "Node_caller").await;

    fast.on("who", |event, _| {
        event.request.as_ref().unwrap().resolve("fast");
    })
    .unwrap();
    slow.on("who", |event, _| {
        event.request.as_ref().unwrap().resolve("slow");
    })
    .unwrap();
    wait_for_subscribers(&broker, "who", 2).await;

    let reply = caller
        .request("who", vec![], Duration::from_secs(1))
        .await
        .unwrap();
    assert!(reply.payload == json!("fast") || reply.payload == json!("slow"));

    wait_for(|| broker.stats().replies_dropped == 1).await;
    assert_eq!(broker.stats().replies_routed, 1);

    broker.stop().await;
}

#[tokio::test]
async fn test_request_without_subscriber_times_out() {
    let broker = start_broker().await;
    let caller = connect(&broker, "Node_caller").await;

    let started = tokio::time::Instant::now();
    let err = caller
        .request("nobody", vec![json!(1)], Duration::from_millis(50))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(1000));

    // The cancel removes the broker-side entry
    wait_for(|| broker.pending_requests() == 0).await;

    broker.stop().await;
}

#[tokio::test]
async fn test_cancel_after_reply_is_noop() {
    let broker = start_broker().await;
    let service = connect(&broker, "Node_svc").await;
    let caller = connect(&broker, "Node_caller").await;

    let answered = Arc::new(Mutex::new(None));
    let record = Arc::clone(&answered);
    service
        .on("ok", move |event, _| {
            let request = event.request.as_ref().unwrap();
            *record.lock().unwrap() = Some(request.reply_channel().to_string());
            request.resolve(true);
        })
        .unwrap();
    wait_for_subscribers(&broker, "ok", 1).await;

    assert_ok!(caller.request("ok", vec![], Duration::from_secs(1)).await);
    let reply_channel = answered.lock().unwrap().clone().unwrap();

    // Keep an unrelated request in flight so there is something to disturb
    let waiting = caller.clone();
    let pending = tokio::spawn(async move {
        waiting
            .request("nobody", vec![], Duration::from_millis(300))
            .await
    });
    wait_for(|| broker.pending_requests() == 1).await;

    // A stale cancel for the consumed reply channel changes nothing
    let raw = TcpStream::connect(broker.local_addr().unwrap()).await.unwrap();
    let mut frames = FramedWrite::new(raw, JsonCodec::<BusCommand>::new());
    frames
        .send(BusCommand::RequestCancel { reply_channel })
        .await
        .unwrap();
    wait_for(|| broker.connection_count() == 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.pending_requests(), 1);

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    broker.stop().await;
}

#[tokio::test]
async fn test_query_state_rows() {
    let broker = start_broker().await;
    let client = connect(&broker, "peer1").await;

    client.on("A", |_, _| {}).unwrap();
    client.on("B", |_, _| {}).unwrap();
    client.on("B", |_, _| {}).unwrap();
    wait_for_subscribers(&broker, "B", 2).await;

    let mut rows = client.query_state(Duration::from_secs(1)).await.unwrap();
    rows.sort_by(|a, b| a.channel.cmp(&b.channel));

    assert_eq!(
        rows,
        vec![
            StateRow {
                channel: "A".into(),
                peer_name: "peer1".into(),
                count: 1
            },
            StateRow {
                channel: "B".into(),
                peer_name: "peer1".into(),
                count: 2
            },
        ]
    );

    broker.stop().await;
}

#[tokio::test]
async fn test_remove_all_listeners() {
    let broker = start_broker().await;
    let client = connect(&broker, "peer1").await;

    for _ in 0..3 {
        client.on("news", |_, _| {}).unwrap();
    }
    wait_for_subscribers(&broker, "news", 3).await;

    assert_eq!(client.remove_all_listeners("news"), 3);
    wait_for_subscribers(&broker, "news", 0).await;
    assert!(broker.query_state().is_empty());

    broker.stop().await;
}

#[tokio::test]
async fn test_disconnect_releases_subscriptions() {
    let broker = start_broker().await;
    let leaving = connect(&broker, "Node_leaving").await;
    let staying = connect(&broker, "Node_staying").await;

    leaving.on("news", |_, _| {}).unwrap();
    leaving.on("weather", |_, _| {}).unwrap();
    staying.on("news", |_, _| {}).unwrap();
    wait_for_subscribers(&broker, "news", 2).await;
    wait_for_subscribers(&broker, "weather", 1).await;

    leaving.close().await;
    wait_for(|| broker.connection_count() == 1).await;

    let rows = broker.query_state();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].peer_name, "Node_staying");

    // The remaining peer is unaffected
    assert_ok!(staying.send("news", vec![]));

    broker.stop().await;
}

#[tokio::test]
async fn test_stop_disconnects_clients() {
    let broker = start_broker().await;
    let client = connect(&broker, "Node_1").await;

    broker.stop().await;
    broker.stop().await;
    assert!(!broker.is_running());

    wait_for(|| !client.is_connected()).await;
    assert!(matches!(
        assert_err!(client.send("news", vec![])),
        Error::NotConnected
    ));
}

#[tokio::test]
async fn test_connect_timeout_to_unroutable() {
    // Nothing listens on a non-routable address, so the connect hangs
    let config = ClientConfig::new(BusAddress::tcp("10.255.255.1", 9))
        .connect_timeout(Duration::from_millis(50));

    match IpcBusClient::connect(config).await {
        Err(Error::ConnectTimeout(timeout)) => assert_eq!(timeout, Duration::from_millis(50)),
        // Some sandboxes reject the route outright
        Err(Error::Io(_)) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

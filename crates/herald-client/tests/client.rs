//! End-to-end client tests over the in-memory transport.

use async_trait::async_trait;
use herald_client::{
    AuthError, Authorizer, Client, ClientConfig, ClientError, ConnectionState, ReconnectPolicy,
    SubscriptionState, STATE_CHANGE,
};
use herald_protocol::{events, AuthToken, Frame};
use herald_transport::{
    standard, Behavior, Capabilities, Capability, CapabilityCache, MemoryListener, MemoryPeer,
    MemoryTransport, TransportCatalog, TransportDescriptor,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(30);

fn config() -> ClientConfig {
    let mut config = ClientConfig::new("test-key");
    config.encryption_required = false;
    config.transport_timeout_ms = 1_000;
    config
}

struct Stack {
    catalog: TransportCatalog,
    transports: Vec<(MemoryTransport, MemoryListener)>,
}

impl Stack {
    fn new(descriptors: &[TransportDescriptor]) -> Self {
        let mut catalog = TransportCatalog::new();
        let mut transports = Vec::new();
        for descriptor in descriptors {
            let (transport, listener) = MemoryTransport::new(descriptor.name());
            catalog.register(*descriptor, Some(Arc::new(transport.clone())));
            transports.push((transport, listener));
        }
        Self { catalog, transports }
    }
}

fn socket_only() -> (TransportCatalog, MemoryTransport, MemoryListener) {
    let mut stack = Stack::new(&[standard::WS]);
    let (transport, listener) = stack.transports.remove(0);
    (stack.catalog, transport, listener)
}

fn socket_client(config: ClientConfig, authorizer: Option<Arc<dyn Authorizer>>) -> (Client, MemoryTransport, MemoryListener) {
    let (catalog, transport, listener) = socket_only();
    let mut builder = Client::builder(config)
        .catalog(catalog)
        .capabilities(CapabilityCache::fixed(Capabilities::all()));
    if let Some(authorizer) = authorizer {
        builder = builder.authorizer(authorizer);
    }
    (builder.build().unwrap(), transport, listener)
}

async fn accept(listener: &mut MemoryListener) -> MemoryPeer {
    timeout(WAIT, listener.accept())
        .await
        .expect("no connection attempt")
        .expect("listener closed")
}

async fn handshake(listener: &mut MemoryListener, socket_id: &str) -> MemoryPeer {
    let peer = accept(listener).await;
    peer.send(&Frame::connection_established(socket_id, None)).unwrap();
    peer
}

async fn next_frame(peer: &mut MemoryPeer) -> Frame {
    timeout(WAIT, peer.recv())
        .await
        .expect("no frame from client")
        .expect("client closed the connection")
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("nothing received")
        .expect("sender dropped")
}

fn forward(channel: &herald_client::Channel, event: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.bind(event, move |data| {
        let _ = tx.send(data.clone());
    });
    rx
}

/// Wait until the driver task has exited.
async fn driver_stopped(client: &Client) {
    let mut states = client.watch_state();
    while timeout(WAIT, states.changed()).await.unwrap().is_ok() {}
}

fn record_states(client: &Client) -> Arc<Mutex<Vec<String>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    client.bind_connection(STATE_CHANGE, move |data| {
        sink.lock()
            .unwrap()
            .push(data["current"].as_str().unwrap_or_default().to_string());
    });
    states
}

/// Authorizer double signing `socket_id:channel`, or refusing everything.
struct StaticAuthorizer {
    secret: Option<&'static str>,
    calls: AtomicUsize,
}

impl StaticAuthorizer {
    fn granting(secret: &'static str) -> Arc<Self> {
        Arc::new(Self {
            secret: Some(secret),
            calls: AtomicUsize::new(0),
        })
    }

    fn refusing() -> Arc<Self> {
        Arc::new(Self {
            secret: None,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, socket_id: &str, channel: &str) -> Result<AuthToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.secret {
            Some(secret) => Ok(AuthToken {
                auth: format!("{secret}:{socket_id}:{channel}"),
                channel_data: None,
            }),
            None => Err(AuthError::Rejected { status: 403 }),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_from_streaming_timeout_to_polling() {
    let mut stack = Stack::new(&[standard::WS, standard::XHR_STREAMING, standard::XHR_POLLING]);
    let (polling, mut polling_listener) = stack.transports.pop().unwrap();
    let (streaming, _streaming_listener) = stack.transports.pop().unwrap();
    let (socket, _socket_listener) = stack.transports.pop().unwrap();
    streaming.set_behavior(Behavior::Hang);

    let client = Client::builder(config())
        .catalog(stack.catalog)
        .capabilities(CapabilityCache::fixed(Capabilities::from_slice(&[
            Capability::Http,
            Capability::HttpStreaming,
        ])))
        .build()
        .unwrap();
    let states = record_states(&client);

    client.connect().unwrap();
    let peer = accept(&mut polling_listener).await;

    assert_eq!(client.state(), ConnectionState::Connecting);
    assert_eq!(client.transport(), Some("xhr_polling"));
    assert_eq!(client.info().retry_count, 1);

    peer.send(&Frame::connection_established("1.1", Some(30))).unwrap();
    client.wait_for_state(ConnectionState::Connected).await.unwrap();

    assert_eq!(client.socket_id().as_deref(), Some("1.1"));
    assert_eq!(socket.open_count(), 0);
    assert_eq!(streaming.open_count(), 1);
    assert_eq!(polling.open_count(), 1);
    assert_eq!(*states.lock().unwrap(), vec!["connecting", "connected"]);
}

#[tokio::test(start_paused = true)]
async fn test_private_channel_subscribes_with_token() {
    let authorizer = StaticAuthorizer::granting("secret");
    let (client, _transport, mut listener) = socket_client(config(), Some(authorizer.clone()));

    let orders = client.subscribe("private-orders").unwrap();
    assert_eq!(orders.state(), SubscriptionState::Pending);
    let mut succeeded = forward(&orders, events::SUBSCRIPTION_SUCCEEDED);
    let mut created = forward(&orders, "order_created");

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "123.456").await;

    let subscribe = next_frame(&mut peer).await;
    assert_eq!(subscribe.event, events::SUBSCRIBE);
    assert_eq!(subscribe.data["channel"], "private-orders");
    assert_eq!(subscribe.data["auth"], "secret:123.456:private-orders");
    assert_eq!(orders.state(), SubscriptionState::Pending);

    peer.send(&Frame::subscription_succeeded("private-orders", json!({})))
        .unwrap();
    next(&mut succeeded).await;
    assert_eq!(orders.state(), SubscriptionState::Subscribed);

    let payload = json!({ "id": 42, "total": 19.99 });
    peer.send(&Frame::client_event("private-orders", "order_created", payload.clone()))
        .unwrap();
    assert_eq!(next(&mut created).await, payload);
    assert_eq!(authorizer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_authorization_failure_stays_off_the_wire() {
    let (client, _transport, mut listener) = socket_client(config(), Some(StaticAuthorizer::refusing()));

    let private = client.subscribe("private-a").unwrap();
    let mut errors = forward(&private, events::SUBSCRIPTION_ERROR);
    client.subscribe("public").unwrap();

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;

    let error = next(&mut errors).await;
    assert_eq!(error["status"], 403);
    assert_eq!(private.state(), SubscriptionState::Pending);

    let frame = next_frame(&mut peer).await;
    assert_eq!(frame.data["channel"], "public");
    assert!(peer.try_recv().is_none());
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_missing_authorizer_reports_subscription_error() {
    let (client, _transport, mut listener) = socket_client(config(), None);

    let private = client.subscribe("presence-room").unwrap();
    let mut errors = forward(&private, events::SUBSCRIPTION_ERROR);

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;

    let error = next(&mut errors).await;
    assert_eq!(error["type"], "AuthError");
    assert!(peer.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_after_connection_loss() {
    let (client, transport, mut listener) = socket_client(config(), None);

    let a = client.subscribe("a").unwrap();
    let b = client.subscribe("b").unwrap();
    let mut events_a = forward(&a, "tick");

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;
    for name in ["a", "b"] {
        assert_eq!(next_frame(&mut peer).await.data["channel"], name);
        peer.send(&Frame::subscription_succeeded(name, json!({}))).unwrap();
    }
    peer.send(&Frame::client_event("a", "tick", json!(1))).unwrap();
    assert_eq!(next(&mut events_a).await, json!(1));
    assert_eq!(b.state(), SubscriptionState::Subscribed);

    drop(peer);

    // The sole transport is retried and both channels are requested again,
    // in their original order.
    let mut peer = handshake(&mut listener, "1.2").await;
    assert_eq!(next_frame(&mut peer).await.data["channel"], "a");
    assert_eq!(next_frame(&mut peer).await.data["channel"], "b");
    assert_eq!(a.state(), SubscriptionState::Pending);
    assert_eq!(transport.open_count(), 2);

    peer.send(&Frame::subscription_succeeded("a", json!({}))).unwrap();
    peer.send(&Frame::client_event("a", "tick", json!(2))).unwrap();
    assert_eq!(next(&mut events_a).await, json!(2));
    assert_eq!(a.state(), SubscriptionState::Subscribed);
    assert_eq!(client.socket_id().as_deref(), Some("1.2"));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_skips_transport_that_failed() {
    let mut stack = Stack::new(&[standard::WS, standard::XHR_POLLING]);
    let (_polling, mut polling_listener) = stack.transports.pop().unwrap();
    let (_socket, mut socket_listener) = stack.transports.pop().unwrap();

    let mut config = config();
    config.reconnect_policy = ReconnectPolicy::SkipLastFailed;
    let client = Client::builder(config)
        .catalog(stack.catalog)
        .capabilities(CapabilityCache::fixed(Capabilities::all()))
        .build()
        .unwrap();

    client.connect().unwrap();
    let peer = handshake(&mut socket_listener, "1.1").await;
    client.wait_for_state(ConnectionState::Connected).await.unwrap();
    drop(peer);

    let _peer = handshake(&mut polling_listener, "1.2").await;
    client.wait_for_state(ConnectionState::Connected).await.unwrap();
    assert_eq!(client.transport(), Some("xhr_polling"));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_is_unavailable_until_connect() {
    let (client, transport, _listener) = socket_client(config(), None);
    transport.set_behavior(Behavior::Refuse);

    client.connect().unwrap();
    client.wait_for_state(ConnectionState::Unavailable).await.unwrap();
    assert_eq!(transport.open_count(), 1);
    assert_eq!(client.transport(), None);

    let mut states = client.watch_state();
    states.borrow_and_update();
    client.connect().unwrap();
    loop {
        timeout(WAIT, states.changed()).await.unwrap().unwrap();
        if *states.borrow_and_update() == ConnectionState::Unavailable {
            break;
        }
    }
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_reconnection() {
    let (client, transport, mut listener) = socket_client(config(), None);
    let states = record_states(&client);

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;
    client.wait_for_state(ConnectionState::Connected).await.unwrap();

    client.disconnect().unwrap();
    client.wait_for_state(ConnectionState::Disconnected).await.unwrap();
    assert!(timeout(WAIT, peer.recv()).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 1);
    assert_eq!(
        *states.lock().unwrap(),
        vec!["connecting", "connected", "disconnecting", "disconnected"]
    );

    // A later connect starts over.
    client.connect().unwrap();
    let _peer = handshake(&mut listener, "1.2").await;
    client.wait_for_state(ConnectionState::Connected).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_drops_channel_and_handlers() {
    let (client, _transport, mut listener) = socket_client(config(), None);

    let old = client.subscribe("news").unwrap();
    let mut old_events = forward(&old, "story");

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;
    next_frame(&mut peer).await;
    peer.send(&Frame::subscription_succeeded("news", json!({}))).unwrap();

    client.unsubscribe("news").unwrap();
    assert_eq!(old.state(), SubscriptionState::Unsubscribed);
    assert_eq!(old.handler_count(), 0);
    let frame = next_frame(&mut peer).await;
    assert_eq!(frame.event, events::UNSUBSCRIBE);
    assert_eq!(frame.target_channel(), Some("news"));

    let fresh = client.subscribe("news").unwrap();
    assert_eq!(fresh.handler_count(), 0);
    next_frame(&mut peer).await;

    peer.send(&Frame::client_event("news", "story", json!("x"))).unwrap();
    peer.send(&Frame::ping()).unwrap();
    assert_eq!(next_frame(&mut peer).await.event, events::PONG);
    assert!(old_events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_pings_and_reconnects_without_pong() {
    let mut config = config();
    config.activity_timeout_ms = 5_000;
    config.pong_timeout_ms = 1_000;
    let (client, transport, mut listener) = socket_client(config, None);

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;

    assert_eq!(next_frame(&mut peer).await.event, events::PING);
    peer.send(&Frame::pong()).unwrap();

    assert_eq!(next_frame(&mut peer).await.event, events::PING);
    // No pong this time: the connection is dropped and renegotiated.
    let _peer = handshake(&mut listener, "1.2").await;
    client.wait_for_state(ConnectionState::Connected).await.unwrap();
    assert_eq!(transport.open_count(), 2);
    assert!(timeout(WAIT, peer.recv()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_service_errors() {
    let (client, transport, mut listener) = socket_client(config(), None);
    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    client.bind_connection(events::ERROR, move |data| {
        let _ = errors_tx.send(data.clone());
    });

    client.connect().unwrap();
    let peer = handshake(&mut listener, "1.1").await;

    // Informational codes leave the connection alone.
    peer.send(&Frame::error(1001, "heads up")).unwrap();
    assert_eq!(next(&mut errors).await["code"], 1001);
    assert_eq!(client.state(), ConnectionState::Connected);

    peer.send(&Frame::error(4200, "reconnect now")).unwrap();
    next(&mut errors).await;
    let peer = handshake(&mut listener, "1.2").await;
    client.wait_for_state(ConnectionState::Connected).await.unwrap();
    assert_eq!(transport.open_count(), 2);

    peer.send(&Frame::error(4001, "application disabled")).unwrap();
    client.wait_for_state(ConnectionState::Disconnected).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_rules() {
    let (client, _transport, mut listener) = socket_client(config(), Some(StaticAuthorizer::granting("s")));

    assert!(matches!(
        client.trigger("private-chat", "typing", json!({})),
        Err(ClientError::InvalidEvent(_))
    ));
    assert!(matches!(
        client.trigger("chat", "client-typing", json!({})),
        Err(ClientError::UnprotectedChannel(_))
    ));
    assert!(matches!(
        client.trigger("private-chat", "client-typing", json!({})),
        Err(ClientError::NotSubscribed(_))
    ));

    let chat = client.subscribe("private-chat").unwrap();
    let mut succeeded = forward(&chat, events::SUBSCRIPTION_SUCCEEDED);
    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;
    next_frame(&mut peer).await;
    assert!(matches!(
        client.trigger("private-chat", "client-typing", json!({})),
        Err(ClientError::NotSubscribed(_))
    ));

    peer.send(&Frame::subscription_succeeded("private-chat", json!({})))
        .unwrap();
    next(&mut succeeded).await;

    client
        .trigger("private-chat", "client-typing", json!({ "user": "u1" }))
        .unwrap();
    let frame = next_frame(&mut peer).await;
    assert_eq!(frame.event, "client-typing");
    assert_eq!(frame.channel.as_deref(), Some("private-chat"));
    assert_eq!(frame.data, json!({ "user": "u1" }));
}

#[tokio::test(start_paused = true)]
async fn test_handlers_may_reenter_the_client() {
    let (client, _transport, mut listener) = socket_client(config(), None);
    let lobby = client.subscribe("lobby").unwrap();

    let handle = client.clone();
    lobby.bind("invite", move |data| {
        if let Some(room) = data["room"].as_str() {
            handle.subscribe(room).unwrap();
            handle.unsubscribe("lobby").unwrap();
        }
    });

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;
    next_frame(&mut peer).await;

    peer.send(&Frame::client_event("lobby", "invite", json!({ "room": "room-7" })))
        .unwrap();

    let subscribe = next_frame(&mut peer).await;
    assert_eq!(subscribe.event, events::SUBSCRIBE);
    assert_eq!(subscribe.data["channel"], "room-7");
    assert_eq!(next_frame(&mut peer).await.event, events::UNSUBSCRIBE);
    assert_eq!(client.channels(), vec!["room-7".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cluster_connection_delivers_private_events() {
    for (descriptor, encrypted) in [
        (standard::WS, false),
        (standard::WSS, true),
        (standard::XHR_STREAMING, false),
        (standard::XHRS_STREAMING, true),
        (standard::XHR_POLLING, false),
        (standard::XHRS_POLLING, true),
    ] {
        let mut stack = Stack::new(&[descriptor]);
        let (_transport, mut listener) = stack.transports.remove(0);

        let mut config = config();
        config.cluster = Some("eu".to_string());
        config.encryption_required = encrypted;
        let client = Client::builder(config)
            .catalog(stack.catalog)
            .capabilities(CapabilityCache::fixed(Capabilities::all()))
            .authorizer(StaticAuthorizer::granting("secret"))
            .build()
            .unwrap();

        client.connect().unwrap();
        let mut peer = accept(&mut listener).await;
        assert_eq!(peer.endpoint().host, "ws-eu.herald.io", "{}", descriptor.name());
        peer.send(&Frame::connection_established("7.7", None)).unwrap();
        client.wait_for_state(ConnectionState::Connected).await.unwrap();
        assert_eq!(client.transport(), Some(descriptor.name()));

        let channel = client.subscribe("private-integration").unwrap();
        let mut succeeded = forward(&channel, events::SUBSCRIPTION_SUCCEEDED);
        let mut received = forward(&channel, "integration_event");

        let subscribe = next_frame(&mut peer).await;
        assert_eq!(subscribe.data["channel"], "private-integration");
        assert_eq!(subscribe.data["auth"], "secret:7.7:private-integration");
        peer.send(&Frame::subscription_succeeded("private-integration", json!({})))
            .unwrap();
        next(&mut succeeded).await;

        let payload = json!({ "x": 1, "y": "z" });
        peer.send(&Frame::client_event("private-integration", "integration_event", payload.clone()))
            .unwrap();
        assert_eq!(next(&mut received).await, payload);

        client.unsubscribe("private-integration").unwrap();
        let unsubscribe = next_frame(&mut peer).await;
        assert_eq!(unsubscribe.event, events::UNSUBSCRIBE);
        assert_eq!(unsubscribe.target_channel(), Some("private-integration"));

        client.disconnect().unwrap();
        client.wait_for_state(ConnectionState::Disconnected).await.unwrap();
        assert!(timeout(WAIT, peer.recv()).await.unwrap().is_none());
        client.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejected_subscription_is_retried_on_next_connection() {
    let (client, transport, mut listener) = socket_client(config(), None);
    let news = client.subscribe("news").unwrap();
    let mut errors = forward(&news, events::SUBSCRIPTION_ERROR);

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;
    assert_eq!(next_frame(&mut peer).await.data["channel"], "news");

    peer.send(&Frame::subscription_error("news", Some(4301), "over quota"))
        .unwrap();
    let error = next(&mut errors).await;
    assert_eq!(error["code"], 4301);
    assert_eq!(news.state(), SubscriptionState::Pending);
    assert!(!news.is_subscribed());

    // Not requested again on the same connection.
    peer.send(&Frame::ping()).unwrap();
    assert_eq!(next_frame(&mut peer).await.event, events::PONG);
    assert_eq!(client.state(), ConnectionState::Connected);

    drop(peer);
    let mut peer = handshake(&mut listener, "1.2").await;
    let subscribe = next_frame(&mut peer).await;
    assert_eq!(subscribe.event, events::SUBSCRIBE);
    assert_eq!(subscribe.data["channel"], "news");
    assert_eq!(transport.open_count(), 2);

    peer.send(&Frame::subscription_succeeded("news", json!({}))).unwrap();
    peer.send(&Frame::ping()).unwrap();
    next_frame(&mut peer).await;
    assert!(news.is_subscribed());
}

#[tokio::test(start_paused = true)]
async fn test_attempt_limit_ends_cycle_unavailable() {
    let mut stack = Stack::new(&[standard::WS, standard::XHR_POLLING]);
    let (polling, _polling_listener) = stack.transports.pop().unwrap();
    let (socket, _socket_listener) = stack.transports.pop().unwrap();
    socket.set_behavior(Behavior::Refuse);
    polling.set_behavior(Behavior::Refuse);

    let mut config = config();
    config.max_attempts_per_cycle = 1;
    let client = Client::builder(config)
        .catalog(stack.catalog)
        .capabilities(CapabilityCache::fixed(Capabilities::all()))
        .build()
        .unwrap();

    client.connect().unwrap();
    client.wait_for_state(ConnectionState::Unavailable).await.unwrap();
    assert_eq!(socket.open_count(), 1);
    assert_eq!(polling.open_count(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.state(), ConnectionState::Unavailable);
    assert_eq!(socket.open_count() + polling.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unbind_event_silences_only_that_event() {
    let (client, _transport, mut listener) = socket_client(config(), None);
    let news = client.subscribe("news").unwrap();
    let mut stories = forward(&news, "story");
    let mut more_stories = forward(&news, "story");
    let mut alerts = forward(&news, "alert");
    assert_eq!(news.unbind_event("story"), 2);

    client.connect().unwrap();
    let mut peer = handshake(&mut listener, "1.1").await;
    next_frame(&mut peer).await;
    peer.send(&Frame::subscription_succeeded("news", json!({}))).unwrap();

    peer.send(&Frame::client_event("news", "story", json!(1))).unwrap();
    peer.send(&Frame::client_event("news", "alert", json!(2))).unwrap();
    assert_eq!(next(&mut alerts).await, json!(2));
    assert!(stories.try_recv().is_err());
    assert!(more_stories.try_recv().is_err());
    assert_eq!(news.handler_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_handlers_holding_the_client() {
    let (client, _transport, _listener) = socket_client(config(), None);
    let marker = Arc::new(());

    let handle = client.clone();
    let held = Arc::clone(&marker);
    client.bind_connection(events::ERROR, move |_| {
        let _ = (&handle, &held);
    });
    let lobby = client.subscribe("lobby").unwrap();
    let handle = client.clone();
    let held = Arc::clone(&marker);
    lobby.bind("invite", move |_| {
        let _ = (&handle, &held);
    });
    assert_eq!(Arc::strong_count(&marker), 3);

    client.shutdown();
    driver_stopped(&client).await;

    assert_eq!(Arc::strong_count(&marker), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(client.connect(), Err(ClientError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_after_shutdown_keeps_no_channel() {
    let (client, _transport, _listener) = socket_client(config(), None);
    client.shutdown();
    driver_stopped(&client).await;

    assert!(matches!(client.subscribe("news"), Err(ClientError::Closed)));
    assert!(client.channel("news").is_none());
    assert!(client.channels().is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    assert!(matches!(
        Client::new(ClientConfig::default()),
        Err(ClientError::Config(_))
    ));

    let mut config = config();
    config.activity_timeout_ms = u64::MAX;
    assert!(matches!(Client::new(config), Err(ClientError::Config(_))));
}

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use gangway::layout::HeadlessWorkspace;
use gangway::messenger::RetryPolicy;
use gangway::observer::{Observed, RecordingObserver};
use gangway::session::{ConnectionSession, HostEntry, SessionConfig, SessionDeps, SessionState};
use gangway::signaling::{
    HttpSignaling, SignalingBackend, SignalingError, SignalTarget, decode_description,
    encode_description,
};
use gangway::transport::mock::MockConnector;
use gangway::transport::{LinkState, SessionDescription};

#[derive(Clone, Default)]
struct HostState {
    offers: Arc<Mutex<Vec<SessionDescription>>>,
}

async fn connect(State(state): State<HostState>, body: String) -> Result<String, StatusCode> {
    let offer = decode_description(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    if offer.kind != "offer" {
        return Err(StatusCode::BAD_REQUEST);
    }
    state.offers.lock().push(offer);
    encode_description(&SessionDescription::answer("v=0\r\no=host 1 1 IN IP4 127.0.0.1\r\n"))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn refuse() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn garbage() -> &'static str {
    "%%% not base64 %%%"
}

/// Serves a fake host signaling endpoint and returns its `host:port`.
async fn spawn_host(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr.to_string()
}

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn post_offer_round_trips_through_connect() {
    init_tracing();
    let state = HostState::default();
    let addr = spawn_host(
        Router::new()
            .route("/connect", post(connect))
            .with_state(state.clone()),
    )
    .await;

    let signaling = HttpSignaling::new().expect("client");
    let answer = signaling
        .post_offer(&addr, &SessionDescription::offer("v=0 client"))
        .await
        .expect("answer");
    assert_eq!(answer.kind, "answer");
    assert!(answer.sdp.starts_with("v=0"));
    assert_eq!(state.offers.lock()[0].sdp, "v=0 client");
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn post_offer_surfaces_status_and_decode_errors() {
    init_tracing();
    let refusing = spawn_host(Router::new().route("/connect", post(refuse))).await;
    let babbling = spawn_host(Router::new().route("/connect", post(garbage))).await;
    let signaling = HttpSignaling::new().expect("client");
    let offer = SessionDescription::offer("v=0");

    let refused = signaling.post_offer(&refusing, &offer).await;
    assert!(matches!(
        refused,
        Err(SignalingError::Status(status)) if status.as_u16() == 503
    ));

    let garbled = signaling.post_offer(&babbling, &offer).await;
    assert!(matches!(garbled, Err(SignalingError::Base64(_))));

    let routed = signaling
        .exchange(&SignalTarget::default(), &offer)
        .await;
    assert!(matches!(routed, Err(SignalingError::NoRoute)));
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn session_signals_over_http_and_boards() {
    init_tracing();
    let state = HostState::default();
    let addr = spawn_host(
        Router::new()
            .route("/connect", post(connect))
            .with_state(state.clone()),
    )
    .await;

    let connector = MockConnector::new();
    let observer = RecordingObserver::new();
    let workspace = HeadlessWorkspace::new(3);
    let deps = SessionDeps {
        connector: Arc::new(connector.clone()),
        signaling: Arc::new(HttpSignaling::new().expect("client")),
        observer: Arc::new(observer.clone()),
    };
    let config = SessionConfig {
        token: "secret".into(),
        ice_server: String::new(),
        retry: RetryPolicy::default(),
    };
    let host = HostEntry::new(Some(addr.clone()), Some("dev".into()));
    let (handle, _task) = ConnectionSession::spawn(host, config, deps, Box::new(workspace.clone()));

    handle.connect().expect("connect");
    let link = loop {
        if let Some(link) = connector.latest() {
            break link;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    link.gather_candidate();
    let status = handle.wait_for(|s| s.verified).await.expect("verified");
    assert_eq!(status.state, SessionState::Connecting);
    while link.remote_description().is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(state.offers.lock().len(), 1);

    link.set_state(LinkState::Connected);
    link.open_control();
    let auth = loop {
        if let Some(frame) = link.control_frames().into_iter().find(|f| f.kind == "auth") {
            break frame;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(auth.args["token"], Value::from("secret"));
    link.ack(auth.message_id.expect("id"), Value::Null);

    let status = handle
        .wait_for(|s| s.state == SessionState::Boarding)
        .await
        .expect("boarding");
    assert!(status.authenticated);
    assert_eq!(workspace.pane_count(), 1);
    assert_eq!(observer.count(|e| matches!(e, Observed::Verified(_))), 1);
    assert!(
        observer
            .messages()
            .contains(&"Sending connection request".to_string())
    );
    handle.shutdown().expect("shutdown");
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn unreachable_host_is_no_signal() {
    init_tracing();
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").to_string()
    };
    let connector = MockConnector::new();
    let observer = RecordingObserver::new();
    let deps = SessionDeps {
        connector: Arc::new(connector.clone()),
        signaling: Arc::new(HttpSignaling::new().expect("client")),
        observer: Arc::new(observer.clone()),
    };
    let config = SessionConfig {
        token: String::new(),
        ice_server: String::new(),
        retry: RetryPolicy::default(),
    };
    let host = HostEntry::new(Some(addr.clone()), None);
    let (handle, _task) =
        ConnectionSession::spawn(host, config, deps, Box::new(HeadlessWorkspace::new(3)));

    handle.connect().expect("connect");
    let link = loop {
        if let Some(link) = connector.latest() {
            break link;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    link.gather_candidate();
    let status = handle
        .wait_for(|s| s.state == SessionState::Failed)
        .await
        .expect("failed");
    assert!(status.failed);
    assert!(!status.verified);
    assert_eq!(observer.count(|e| matches!(e, Observed::NoSignal { .. })), 1);
    assert!(
        observer
            .messages()
            .contains(&format!("HTTP POST to {addr} failed"))
    );
}

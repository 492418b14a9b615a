use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shipanion::api;
use shipanion::auth::{AuthConfig, JwtVerifier};
use shipanion::backend::{
    BackendResult, InternalBackend, LabelRequest, LabelResponse, RateRequest, RateResponse,
    ShippingBackend,
};
use shipanion::proxy::OutboundCallProxy;
use shipanion::state::{AppState, SessionConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEV_TOKEN: &str = "e2e-dev-token";

/// Answers like the internal backend, but only after a delay
struct SlowBackend {
    inner: InternalBackend,
    delay: Duration,
}

#[async_trait]
impl ShippingBackend for SlowBackend {
    async fn get_rates(&self, request: &RateRequest) -> BackendResult<RateResponse> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_rates(request).await
    }

    async fn create_label(&self, request: &LabelRequest) -> BackendResult<LabelResponse> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_label(request).await
    }

    fn name(&self) -> &str {
        "slow"
    }
}

async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
    spawn_server_with(Arc::new(InternalBackend::new())).await
}

async fn spawn_server_with(backend: Arc<dyn ShippingBackend>) -> (SocketAddr, Arc<AppState>) {
    let verifier = JwtVerifier::new(&AuthConfig {
        jwt_secret: Some("e2e-secret".to_string()),
        dev_token: Some(DEV_TOKEN.to_string()),
        dev_user: "e2e".to_string(),
    });
    let state = Arc::new(AppState::new(
        Arc::new(verifier),
        OutboundCallProxy::new(backend, Duration::from_secs(10)),
        SessionConfig::default(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (client, _response) = connect_async(format!("ws://{}/ws?{}", addr, query))
        .await
        .expect("handshake should succeed");
    client
}

/// Wait until the server has registered `count` connections
async fn wait_for_connections(state: &AppState, count: usize) {
    for _ in 0..100 {
        if state.connections.len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} connections, have {}",
        count,
        state.connections.len()
    );
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame should arrive")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn expect_policy_close(client: &mut Client) {
    let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("close should arrive")
        .expect("stream open")
        .expect("valid frame");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1008);
            assert!(!frame.reason.is_empty());
        }
        other => panic!("Expected policy close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_token_is_closed_with_policy_violation() {
    let (addr, state) = spawn_server().await;
    let mut client = connect(addr, "session_id=s1").await;

    expect_policy_close(&mut client).await;
    assert!(state.connections.is_empty());
    assert!(state.sessions.is_empty());
}

#[tokio::test]
async fn test_bad_token_is_closed_with_policy_violation() {
    let (addr, state) = spawn_server().await;
    let mut client = connect(addr, "token=not.a.jwt&session_id=s1").await;

    expect_policy_close(&mut client).await;
    assert!(state.connections.is_empty());
}

#[tokio::test]
async fn test_session_members_share_contextual_updates() {
    let (addr, state) = spawn_server().await;
    let mut agent = connect(addr, &format!("token={}&session_id=shared", DEV_TOKEN)).await;
    let mut observer = connect(addr, &format!("token={}&session_id=shared", DEV_TOKEN)).await;
    let mut outsider = connect(addr, &format!("token={}&session_id=other", DEV_TOKEN)).await;
    wait_for_connections(&state, 3).await;

    let call = json!({
        "type": "client_tool_call",
        "client_tool_call": {
            "tool_name": "get_shipping_quotes",
            "tool_call_id": "abc123",
            "parameters": {"from_zip": "89101", "to_zip": "10001", "weight": 2}
        }
    });
    agent
        .send(Message::text(call.to_string()))
        .await
        .unwrap();

    let result = next_json(&mut agent).await;
    assert_eq!(result["type"], "client_tool_result");
    assert_eq!(result["tool_call_id"], "abc123");
    assert_eq!(result["is_error"], false);

    let update = next_json(&mut agent).await;
    assert_eq!(update["type"], "contextual_update");
    assert_eq!(update["session_id"], "shared");

    let update = next_json(&mut observer).await;
    assert_eq!(update["type"], "contextual_update");
    assert_eq!(update["text"], "quote_ready");

    let nothing = tokio::time::timeout(Duration::from_millis(300), outsider.next()).await;
    assert!(nothing.is_err(), "outsider should not hear the session");
}

#[tokio::test]
async fn test_frames_answered_in_order() {
    let (addr, state) = spawn_server().await;
    let mut client = connect(addr, &format!("token={}", DEV_TOKEN)).await;
    wait_for_connections(&state, 1).await;

    for id in ["first", "second", "third"] {
        let frame = json!({"type": "dance", "requestId": id});
        client.send(Message::text(frame.to_string())).await.unwrap();
    }

    for id in ["first", "second", "third"] {
        let reply = next_json(&mut client).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["requestId"], id);
    }
}

#[tokio::test]
async fn test_disconnect_removes_connection_only() {
    let (addr, state) = spawn_server().await;
    let mut client = connect(addr, &format!("token={}&session_id=keep", DEV_TOKEN)).await;
    wait_for_connections(&state, 1).await;

    client.close(None).await.unwrap();
    wait_for_connections(&state, 0).await;
    assert!(state.sessions.contains("keep"));
}

#[tokio::test]
async fn test_call_in_flight_survives_sender_disconnect() {
    let (addr, state) = spawn_server_with(Arc::new(SlowBackend {
        inner: InternalBackend::new(),
        delay: Duration::from_millis(300),
    }))
    .await;
    let mut agent = connect(addr, &format!("token={}&session_id=handoff", DEV_TOKEN)).await;
    let mut observer = connect(addr, &format!("token={}&session_id=handoff", DEV_TOKEN)).await;
    wait_for_connections(&state, 2).await;

    let call = json!({
        "type": "client_tool_call",
        "client_tool_call": {
            "tool_name": "get_shipping_quotes",
            "tool_call_id": "late-1",
            "parameters": {"from_zip": "89101", "to_zip": "10001", "weight": 2}
        }
    });
    agent.send(Message::text(call.to_string())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    agent.close(None).await.unwrap();
    wait_for_connections(&state, 1).await;

    let update = next_json(&mut observer).await;
    assert_eq!(update["type"], "contextual_update");
    assert_eq!(update["text"], "quote_ready");
    assert_eq!(update["session_id"], "handoff");
    assert!(state
        .sessions
        .get_state("handoff", "last_quote")
        .is_some());
}

#[tokio::test]
async fn test_binary_frames_are_decoded_or_rejected() {
    let (addr, state) = spawn_server().await;
    let mut client = connect(addr, &format!("token={}", DEV_TOKEN)).await;
    wait_for_connections(&state, 1).await;

    client
        .send(Message::binary(vec![b'{', 0xff, 0xfe, b'}']))
        .await
        .unwrap();
    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(
        reply["payload"]["message"],
        "Invalid message format: frame is not valid UTF-8"
    );

    let frame = json!({"type": "dance", "requestId": "bin-1"});
    client
        .send(Message::binary(frame.to_string().into_bytes()))
        .await
        .unwrap();
    let reply = next_json(&mut client).await;
    assert_eq!(reply["requestId"], "bin-1");
    assert_eq!(reply["payload"]["message"], "Unsupported message type: dance");
}

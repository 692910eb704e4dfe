use std::time::Duration;

use axum::{body::Body, http::Request, http::StatusCode};
use burrow_server::{build_router, AppConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};
use tower::ServiceExt;

#[derive(Debug, serde::Deserialize)]
struct AuthResponse {
    access_token: String,
}

async fn parse_json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&body).expect("response body should be valid json")
}

async fn register_and_login(app: &axum::Router, username: &str, ip: &str) -> AuthResponse {
    let register = Request::builder()
        .method("POST")
        .uri("/auth/register")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({"username":username,"password":"super-secure-password"}).to_string(),
        ))
        .expect("register request should build");
    let register_response = app
        .clone()
        .oneshot(register)
        .await
        .expect("register request should execute");
    assert_eq!(register_response.status(), StatusCode::OK);

    let login = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({"username":username,"password":"super-secure-password"}).to_string(),
        ))
        .expect("login request should build");
    let login_response = app
        .clone()
        .oneshot(login)
        .await
        .expect("login request should execute");
    assert_eq!(login_response.status(), StatusCode::OK);
    let body = parse_json_body(login_response).await;
    serde_json::from_value(body).expect("login body should deserialize")
}

async fn authed_post(
    app: &axum::Router,
    uri: String,
    access_token: &str,
    ip: &str,
    body: Value,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {access_token}"))
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .expect("request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should execute");
    let status = response.status();
    (status, parse_json_body(response).await)
}

async fn my_user_id(app: &axum::Router, access_token: &str, ip: &str) -> String {
    let request = Request::builder()
        .uri("/auth/me")
        .header("authorization", format!("Bearer {access_token}"))
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .expect("request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request should execute");
    assert_eq!(response.status(), StatusCode::OK);
    parse_json_body(response).await["user_id"]
        .as_str()
        .expect("user id should exist")
        .to_owned()
}

fn test_app() -> axum::Router {
    build_router(&AppConfig {
        max_body_bytes: 1024 * 32,
        request_timeout: Duration::from_secs(2),
        rate_limit_requests_per_minute: 200,
        auth_route_requests_per_minute: 200,
        ..AppConfig::default()
    })
    .expect("router should build")
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_gateway(addr: std::net::SocketAddr, access_token: &str, ip: &str) -> WsStream {
    let ws_url = format!("ws://{addr}/gateway/ws?access_token={access_token}");
    let mut ws_request = ws_url
        .into_client_request()
        .expect("websocket request should build");
    ws_request.headers_mut().insert(
        "x-forwarded-for",
        http::HeaderValue::from_str(ip).expect("header value should build"),
    );
    let (socket, _response) = connect_async(ws_request)
        .await
        .expect("websocket handshake should succeed");
    socket
}

async fn next_text_event(socket: &mut WsStream) -> Value {
    loop {
        let event = socket
            .next()
            .await
            .expect("event should be emitted")
            .expect("event should decode");
        if let Message::Text(text) = event {
            return serde_json::from_str(&text).expect("event should be valid json");
        }
    }
}

async fn next_event_of_type(socket: &mut WsStream, event_type: &str) -> Value {
    for _ in 0..8 {
        let event = next_text_event(socket).await;
        if event["t"] == event_type {
            return event;
        }
    }
    panic!("expected event type {event_type}");
}

#[tokio::test]
async fn gateway_join_send_and_receive_flow_works_over_network() {
    let app = test_app();

    let alice = register_and_login(&app, "alice_1", "203.0.113.80").await;
    let bob = register_and_login(&app, "bob_1", "203.0.113.81").await;
    let bob_id = my_user_id(&app, &bob.access_token, "203.0.113.81").await;

    let (status, room) = authed_post(
        &app,
        String::from("/rooms/direct"),
        &alice.access_token,
        "203.0.113.80",
        json!({"user_id": bob_id}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let room_id = room["room_id"]
        .as_str()
        .expect("room id should exist")
        .to_owned();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener addr should be readable");
    let server_app = app.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, server_app)
            .await
            .expect("server should run without errors");
    });

    let mut alice_socket = connect_gateway(addr, &alice.access_token, "203.0.113.80").await;
    let ready = next_text_event(&mut alice_socket).await;
    assert_eq!(ready["t"], "ready");
    assert_eq!(ready["v"], 1);

    let mut bob_socket = connect_gateway(addr, &bob.access_token, "203.0.113.81").await;
    let bob_ready = next_text_event(&mut bob_socket).await;
    assert_eq!(bob_ready["t"], "ready");

    for socket in [&mut alice_socket, &mut bob_socket] {
        let join = json!({"v": 1, "t": "join_room", "d": {"room_id": room_id}});
        socket
            .send(Message::Text(join.to_string().into()))
            .await
            .expect("join command should send");
        let joined = next_event_of_type(socket, "joinedRoom").await;
        assert_eq!(joined["d"]["room_id"], room_id.as_str());
    }

    let send = json!({
        "v": 1,
        "t": "send_message",
        "d": {"room_id": room_id, "content": "hello over the gateway"}
    });
    alice_socket
        .send(Message::Text(send.to_string().into()))
        .await
        .expect("send command should send");

    let broadcast = next_event_of_type(&mut bob_socket, "newMessage").await;
    assert_eq!(broadcast["d"]["room_id"], room_id.as_str());
    assert_eq!(broadcast["d"]["content"], "hello over the gateway");

    let notification = next_event_of_type(&mut bob_socket, "newNotification").await;
    assert_eq!(notification["d"]["kind"], "message_received");
    assert_eq!(notification["d"]["room_id"], room_id.as_str());

    alice_socket
        .close(None)
        .await
        .expect("socket close should succeed");
    bob_socket
        .close(None)
        .await
        .expect("socket close should succeed");
    server.abort();
}

#[tokio::test]
async fn gateway_rejects_commands_for_rooms_the_user_never_joined() {
    let app = test_app();

    let alice = register_and_login(&app, "alice_1", "203.0.113.82").await;
    let bob = register_and_login(&app, "bob_1", "203.0.113.83").await;
    let carol = register_and_login(&app, "carol_1", "203.0.113.84").await;
    let bob_id = my_user_id(&app, &bob.access_token, "203.0.113.83").await;

    let (status, room) = authed_post(
        &app,
        String::from("/rooms/direct"),
        &alice.access_token,
        "203.0.113.82",
        json!({"user_id": bob_id}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let room_id = room["room_id"]
        .as_str()
        .expect("room id should exist")
        .to_owned();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener addr should be readable");
    let server_app = app.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, server_app)
            .await
            .expect("server should run without errors");
    });

    let mut carol_socket = connect_gateway(addr, &carol.access_token, "203.0.113.84").await;
    let ready = next_text_event(&mut carol_socket).await;
    assert_eq!(ready["t"], "ready");

    // A rejected command surfaces as an error event; the socket stays open.
    let join = json!({"v": 1, "t": "join_room", "d": {"room_id": room_id}});
    carol_socket
        .send(Message::Text(join.to_string().into()))
        .await
        .expect("join command should send");
    let error = next_event_of_type(&mut carol_socket, "error").await;
    assert_eq!(error["d"]["code"], "forbidden");

    let send = json!({
        "v": 1,
        "t": "send_message",
        "d": {"room_id": room_id, "content": "sneaky"}
    });
    carol_socket
        .send(Message::Text(send.to_string().into()))
        .await
        .expect("send command should send");
    let error = next_event_of_type(&mut carol_socket, "error").await;
    assert_eq!(error["d"]["code"], "forbidden");

    carol_socket
        .close(None)
        .await
        .expect("socket close should succeed");
    server.abort();
}

#[tokio::test]
async fn gateway_upgrade_without_valid_token_is_rejected() {
    let app = test_app();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener addr should be readable");
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("server should run without errors");
    });

    let ws_url = format!("ws://{addr}/gateway/ws?access_token=not-a-token");
    let ws_request = ws_url
        .into_client_request()
        .expect("websocket request should build");
    match connect_async(ws_request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        Err(other) => panic!("expected http rejection, got {other}"),
        Ok(_) => panic!("handshake should not succeed without a valid token"),
    }
    server.abort();
}

#[tokio::test]
async fn gateway_disconnects_on_unknown_event_type() {
    let app = test_app();
    let alice = register_and_login(&app, "alice_1", "203.0.113.85").await;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener addr should be readable");
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("server should run without errors");
    });

    let mut socket = connect_gateway(addr, &alice.access_token, "203.0.113.85").await;
    let ready = next_text_event(&mut socket).await;
    assert_eq!(ready["t"], "ready");

    let bogus = json!({"v": 1, "t": "shenanigans", "d": {}});
    socket
        .send(Message::Text(bogus.to_string().into()))
        .await
        .expect("bogus command should send");

    // Protocol violations close the connection instead of emitting an error.
    loop {
        match socket.next().await {
            None => break,
            Some(Err(_)) => break,
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => {}
        }
    }
    server.abort();
}

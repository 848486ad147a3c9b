use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use opti_link::{Backoff, RetryPolicy, StreamTransport, TransportError};
use opti_transport::{WsTransport, SUBPROTOCOL};
use opti_types::{Document, GraphqlResponse, Operation, Variables};

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    let callback = |_request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        response
            .headers_mut()
            .insert("sec-websocket-protocol", HeaderValue::from_static(SUBPROTOCOL));
        Ok(response)
    };
    accept_hdr_async(stream, callback).await.unwrap()
}

async fn recv_json(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

async fn send_json(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Accept a connection and run the handshake up to the subscribe frame.
async fn handshake(listener: &TcpListener) -> (ServerSocket, Value, Value) {
    let mut ws = accept(listener).await;
    let init = recv_json(&mut ws).await;
    send_json(&mut ws, json!({"type": "connection_ack"})).await;
    let subscribe = recv_json(&mut ws).await;
    (ws, init, subscribe)
}

fn todo_added() -> Operation {
    Operation::new(
        Arc::new(Document::parse("subscription TodoAdded { todoAdded { id name } }").unwrap()),
        Variables::new(),
    )
}

fn fast_reconnect(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: Some(max_attempts),
        backoff: Backoff::Fixed,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(10),
        jitter: false,
    }
}

fn next(id: i64) -> Value {
    next_for("1", id)
}

fn next_for(subscription: &str, id: i64) -> Value {
    json!({"type": "next", "id": subscription, "payload": {"data": {"todoAdded": {"id": id, "name": "x"}}}})
}

fn todo_id(event: &Result<GraphqlResponse, TransportError>) -> Value {
    event.as_ref().unwrap().data.as_ref().unwrap()["todoAdded"]["id"].clone()
}

#[tokio::test]
async fn streams_events_until_complete() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let (mut ws, init, subscribe) = handshake(&listener).await;
        assert_eq!(init, json!({"type": "connection_init", "payload": {"authToken": "auth123"}}));
        assert_eq!(subscribe["type"], "subscribe");
        assert_eq!(subscribe["payload"]["operationName"], "TodoAdded");
        send_json(&mut ws, json!({"type": "ping"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "pong");
        for id in 1..=2 {
            send_json(&mut ws, next(id)).await;
        }
        send_json(&mut ws, json!({"type": "complete", "id": "1"})).await;
    });

    let transport = WsTransport::builder(url)
        .with_connection_params(json!({"authToken": "auth123"}))
        .build()
        .unwrap();
    let events: Vec<_> = transport.subscribe(&todo_added()).await.unwrap().collect().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].as_ref().unwrap().data.as_ref().unwrap()["todoAdded"]["id"], json!(2));
    server.await.unwrap();
}

#[tokio::test]
async fn dropping_the_stream_sends_complete() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let (mut ws, _, _) = handshake(&listener).await;
        send_json(&mut ws, next(1)).await;
        recv_json(&mut ws).await
    });

    let transport = WsTransport::builder(url).build().unwrap();
    let mut events = transport.subscribe(&todo_added()).await.unwrap();
    assert!(events.next().await.unwrap().is_ok());
    drop(events);

    let last = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(last, json!({"type": "complete", "id": "1"}));
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_drop() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let (mut ws, _, _) = handshake(&listener).await;
        send_json(&mut ws, next(1)).await;
        drop(ws);

        let (mut ws, _, subscribe) = handshake(&listener).await;
        assert_eq!(subscribe["payload"]["operationName"], "TodoAdded");
        send_json(&mut ws, next(2)).await;
        send_json(&mut ws, json!({"type": "complete", "id": "1"})).await;
    });

    let transport = WsTransport::builder(url)
        .with_reconnect(fast_reconnect(3))
        .build()
        .unwrap();
    let events: Vec<_> = transport.subscribe(&todo_added()).await.unwrap().collect().await;
    let ids: Vec<Value> = events
        .iter()
        .map(|e| e.as_ref().unwrap().data.as_ref().unwrap()["todoAdded"]["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
    server.await.unwrap();
}

#[tokio::test]
async fn exhausted_reconnect_is_terminal() {
    // Bind then drop so the port refuses connections.
    let (listener, url) = listen().await;
    drop(listener);

    let transport = WsTransport::builder(url)
        .with_reconnect(fast_reconnect(3))
        .build()
        .unwrap();
    let events: Vec<_> = transport.subscribe(&todo_added()).await.unwrap().collect().await;
    assert_eq!(events, vec![Err(TransportError::ReconnectExhausted { attempts: 3 })]);
}

#[tokio::test]
async fn subscription_error_frame_ends_stream() {
    let (listener, url) = listen().await;

    tokio::spawn(async move {
        let (mut ws, _, _) = handshake(&listener).await;
        send_json(
            &mut ws,
            json!({"type": "error", "id": "1", "payload": [{"message": "not allowed"}]}),
        )
        .await;
        let _ = ws.next().await;
    });

    let transport = WsTransport::builder(url).build().unwrap();
    let events: Vec<_> = transport.subscribe(&todo_added()).await.unwrap().collect().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].as_ref().unwrap().errors[0].message, "not allowed");
}

#[tokio::test]
async fn subscriptions_share_one_connection() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        assert_eq!(recv_json(&mut ws).await["type"], "connection_init");
        send_json(&mut ws, json!({"type": "connection_ack"})).await;
        let mut ids = Vec::new();
        for _ in 0..2 {
            let subscribe = recv_json(&mut ws).await;
            assert_eq!(subscribe["type"], "subscribe");
            ids.push(subscribe["id"].as_str().unwrap().to_string());
        }
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);

        send_json(&mut ws, next_for("2", 20)).await;
        send_json(&mut ws, next_for("1", 10)).await;
        // The first stream is dropped: only its id is completed.
        assert_eq!(recv_json(&mut ws).await, json!({"type": "complete", "id": "1"}));
        send_json(&mut ws, next_for("2", 21)).await;
        send_json(&mut ws, json!({"type": "complete", "id": "2"})).await;

        let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "a second connection was opened");
    });

    let transport = WsTransport::builder(url).build().unwrap();
    let mut first = transport.subscribe(&todo_added()).await.unwrap();
    let second = transport.subscribe(&todo_added()).await.unwrap();

    assert_eq!(todo_id(&first.next().await.unwrap()), json!(10));
    drop(first);
    let rest: Vec<_> = second.collect().await;
    let ids: Vec<Value> = rest.iter().map(todo_id).collect();
    assert_eq!(ids, vec![json!(20), json!(21)]);
    server.await.unwrap();
}

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use opti_link::{RequestTransport, TransportError};
use opti_transport::HttpTransport;
use opti_types::{Document, Operation, Variables};

fn list_todos() -> Operation {
    Operation::new(
        Arc::new(Document::parse("query ListTodos { listTodos { id name } }").unwrap()),
        Variables::new(),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn transport(server: &MockServer) -> HttpTransport {
    init_tracing();
    HttpTransport::builder(format!("{}/graphql", server.uri()))
        .with_timeout(Duration::from_millis(500))
        .build()
        .unwrap()
}

#[tokio::test]
async fn posts_operation_with_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer auth987"))
        .and(body_partial_json(json!({
            "operationName": "ListTodos",
            "variables": {}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"listTodos": [{"__typename": "Todo", "id": 1, "name": "a"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let op = list_todos().with_header("Authorization", "Bearer auth987");
    let response = transport(&server).await.execute(&op).await.unwrap();
    assert_eq!(response.data.unwrap()["listTodos"][0]["id"], json!(1));
}

#[tokio::test]
async fn request_text_includes_typename() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;

    transport(&server).await.execute(&list_todos()).await.unwrap();
    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body["query"].as_str().unwrap().contains("__typename"));
}

#[tokio::test]
async fn graphql_errors_on_4xx_are_a_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{"message": "Unknown argument", "locations": [{"line": 1, "column": 20}]}]
        })))
        .mount(&server)
        .await;

    let response = transport(&server).await.execute(&list_todos()).await.unwrap();
    assert_eq!(response.errors[0].message, "Unknown argument");
    assert_eq!(response.errors[0].locations[0].column, 20);
}

#[tokio::test]
async fn server_errors_are_retryable_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let err = transport(&server).await.execute(&list_todos()).await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Status {
            status: 503,
            body: "unavailable".into()
        }
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {}}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = transport(&server).await.execute(&list_todos()).await.unwrap_err();
    assert_eq!(err, TransportError::Timeout);
}

#[tokio::test]
async fn refused_connection_is_retryable() {
    init_tracing();
    let transport = HttpTransport::builder("http://127.0.0.1:9/graphql").build().unwrap();
    let err = transport.execute(&list_todos()).await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

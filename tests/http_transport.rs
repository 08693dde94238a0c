use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde_json::{json, Value};
use ticketgen::{
    ClientConfig, EncodedAttachment, GenerationError, Generator, NoticeSink, SessionOutcome,
    SessionReport, SessionStatus, TicketClient,
};
use tokio::net::TcpListener;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Captured = Arc<Mutex<Vec<Value>>>;

async fn spawn_mock_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let address: SocketAddr = listener.local_addr().expect("mock listener local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("run mock server");
    });
    format!("http://{address}")
}

fn generator_for(base_url: &str) -> Generator {
    let config = ClientConfig::new(base_url).expect("mock server url is valid");
    Generator::new(Arc::new(TicketClient::new(config)), NoticeSink::disabled())
}

fn chunked(chunks: &[&'static str]) -> Body {
    let items: Vec<Result<String, std::io::Error>> =
        chunks.iter().map(|chunk| Ok(chunk.to_string())).collect();
    Body::from_stream(stream::iter(items))
}

async fn finish(handle: ticketgen::SessionHandle) -> SessionReport {
    timeout(TEST_TIMEOUT, handle.wait())
        .await
        .expect("session finishes in time")
        .expect("session task does not panic")
}

#[tokio::test]
async fn streamed_body_completes_with_full_text() {
    let captured: Captured = Arc::default();
    let app = Router::new()
        .route(
            "/generate-ticket",
            post(|State(captured): State<Captured>, Json(body): Json<Value>| async move {
                captured.lock().expect("captured lock").push(body);
                chunked(&["h1. Summary\n", "Fix the ", "login button"])
            }),
        )
        .with_state(captured.clone());
    let generator = generator_for(&spawn_mock_server(app).await);

    let handle = generator
        .start(
            "Login button does nothing",
            vec![EncodedAttachment::encode("image/png", b"abc")],
        )
        .await
        .expect("start generation");
    let report = finish(handle).await;

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(report.text, "h1. Summary\nFix the login button");
    assert_eq!(generator.text(), report.text);
    assert_eq!(generator.status(), SessionStatus::Completed);

    let bodies = captured.lock().expect("captured lock").clone();
    assert_eq!(
        bodies,
        vec![json!({
            "description": "Login button does nothing",
            "images": ["data:image/png;base64,YWJj"]
        })]
    );
}

#[tokio::test]
async fn error_marker_in_success_body_fails() {
    let app = Router::new().route(
        "/generate-ticket",
        post(|| async { chunked(&["Error generating ticket: model overloaded  "]) }),
    );
    let generator = generator_for(&spawn_mock_server(app).await);

    let handle = generator.start("Broken page", vec![]).await.expect("start");
    let report = finish(handle).await;

    assert_eq!(
        report.outcome,
        SessionOutcome::Failed(GenerationError::InBand("model overloaded".to_string()))
    );
    assert_eq!(report.text, "");
    assert_eq!(generator.status(), SessionStatus::Failed);
}

#[tokio::test]
async fn error_detail_becomes_failure_message() {
    let app = Router::new().route(
        "/generate-ticket",
        post(|| async { (StatusCode::BAD_REQUEST, Json(json!({ "detail": "bad input" }))) }),
    );
    let generator = generator_for(&spawn_mock_server(app).await);

    let handle = generator.start("Broken page", vec![]).await.expect("start");
    let report = finish(handle).await;

    assert_eq!(
        report.outcome,
        SessionOutcome::Failed(GenerationError::Server {
            status: 400,
            message: "bad input".to_string()
        })
    );
    assert_eq!(report.message().as_deref(), Some("bad input"));
}

#[tokio::test]
async fn unparsable_error_body_falls_back_to_status() {
    let app = Router::new().route(
        "/generate-ticket",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "<html>upstream died</html>") }),
    );
    let generator = generator_for(&spawn_mock_server(app).await);

    let handle = generator.start("Broken page", vec![]).await.expect("start");
    let report = finish(handle).await;

    assert_eq!(report.status(), SessionStatus::Failed);
    assert_eq!(report.message().as_deref(), Some("Server error: 500"));
}

#[tokio::test]
async fn unreachable_service_is_a_transport_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    drop(listener);
    let generator = generator_for(&format!("http://{address}"));

    let handle = generator.start("Broken page", vec![]).await.expect("start");
    let report = finish(handle).await;

    match report.outcome {
        SessionOutcome::Failed(GenerationError::Transport(message)) => {
            assert!(message.starts_with("Failed to send request"), "{message}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn cancelling_an_open_stream_is_not_a_failure() {
    let app = Router::new().route(
        "/generate-ticket",
        post(|| async {
            let first = stream::iter(vec![Ok::<_, std::io::Error>("first chunk".to_string())]);
            Body::from_stream(futures_util::StreamExt::chain(first, stream::pending()))
        }),
    );
    let generator = generator_for(&spawn_mock_server(app).await);

    let handle = generator.start("Broken page", vec![]).await.expect("start");
    let mut text = generator.subscribe_text();
    timeout(TEST_TIMEOUT, text.wait_for(|t| t == "first chunk"))
        .await
        .expect("first chunk arrives")
        .expect("text channel open");

    assert!(generator.cancel().await);
    let report = finish(handle).await;

    assert_eq!(report.outcome, SessionOutcome::Cancelled);
    assert_eq!(report.text, "first chunk");
    assert_eq!(generator.status(), SessionStatus::Cancelled);
}

#[tokio::test]
async fn health_check_reports_service_state() {
    let app = Router::new().route("/health", get(|| async { Json(json!({ "status": "healthy" })) }));
    let client = TicketClient::new(
        ClientConfig::new(&spawn_mock_server(app).await).expect("mock server url is valid"),
    );
    assert!(client.health().await.expect("health check"));

    let app = Router::new().route(
        "/health",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
    );
    let client = TicketClient::new(
        ClientConfig::new(&spawn_mock_server(app).await).expect("mock server url is valid"),
    );
    assert!(!client.health().await.expect("health check"));
}

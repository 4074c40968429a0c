//! HTTP inference client against a local mock endpoint.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use tokio_util::sync::CancellationToken;

use moments_pipeline::{
    config::InferenceTimeouts,
    core::error::PipelineError,
    inference::{HttpInferenceClient, Inference},
    protocols::{chat::ChatMessage, run::SamplingParams},
    tunnel::TunnelHandle,
};

#[derive(Clone)]
struct MockState {
    calls: Arc<AtomicUsize>,
    /// How many leading requests answer 500 before succeeding.
    fail_first: usize,
}

async fn chat_endpoint(State(state): State<MockState>) -> impl IntoResponse {
    let call = state.calls.fetch_add(1, Ordering::SeqCst);
    if call < state.fail_first {
        return (StatusCode::INTERNAL_SERVER_ERROR, "busy").into_response();
    }
    Json(serde_json::json!({
        "choices": [{"message": {"content": "[{\"start_time\": 1, \"end_time\": 2, \"title\": \"A\"}]"},
                     "finish_reason": "stop"}],
        "model": "mock"
    }))
    .into_response()
}

async fn bad_request_endpoint(State(state): State<MockState>) -> impl IntoResponse {
    state.calls.fetch_add(1, Ordering::SeqCst);
    (StatusCode::BAD_REQUEST, "malformed prompt").into_response()
}

async fn transcribe_endpoint() -> impl IntoResponse {
    Json(serde_json::json!({
        "transcription": "hello world",
        "word_timestamps": [{"word": "hello", "start": 0.0, "end": 0.5}],
        "segment_timestamps": [{"text": "hello world", "start": 0.0, "end": 1.0}],
        "processing_time": 0.3
    }))
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn fast_client() -> HttpInferenceClient {
    let mut timeouts = InferenceTimeouts::default();
    timeouts.retry_backoff = Duration::from_millis(10);
    HttpInferenceClient::new(timeouts).unwrap()
}

fn messages() -> Vec<ChatMessage> {
    vec![ChatMessage::user("find the moments")]
}

#[tokio::test]
async fn chat_completion_returns_assistant_content() {
    let state = MockState {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: 0,
    };
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(chat_endpoint))
            .with_state(state.clone()),
    )
    .await;

    let handle = TunnelHandle::direct("vl", base, "/v1/chat/completions");
    let client = fast_client();
    let result = client
        .chat_complete(
            &handle,
            Some("mock-model"),
            messages(),
            &SamplingParams::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.content.contains("start_time"));
    assert_eq!(result.model.as_deref(), Some("mock"));
    assert_eq!(state.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_error_is_retried_exactly_once() {
    let state = MockState {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: 1,
    };
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(chat_endpoint))
            .with_state(state.clone()),
    )
    .await;

    let handle = TunnelHandle::direct("vl", base, "/v1/chat/completions");
    let result = fast_client()
        .chat_complete(
            &handle,
            None,
            messages(),
            &SamplingParams::default(),
            &CancellationToken::new(),
        )
        .await;
    assert!(result.is_ok());
    assert_eq!(state.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistent_server_error_exhausts_the_single_retry() {
    let state = MockState {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: usize::MAX,
    };
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(chat_endpoint))
            .with_state(state.clone()),
    )
    .await;

    let handle = TunnelHandle::direct("vl", base, "/v1/chat/completions");
    let err = fast_client()
        .chat_complete(
            &handle,
            None,
            messages(),
            &SamplingParams::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Network { .. }));
    assert_eq!(state.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let state = MockState {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: 0,
    };
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(bad_request_endpoint))
            .with_state(state.clone()),
    )
    .await;

    let handle = TunnelHandle::direct("vl", base, "/v1/chat/completions");
    let err = fast_client()
        .chat_complete(
            &handle,
            None,
            messages(),
            &SamplingParams::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match err {
        PipelineError::Network { message, .. } => {
            assert!(message.contains("400"));
            assert!(message.contains("malformed prompt"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(state.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_call_aborts_without_retry() {
    let state = MockState {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_first: 0,
    };
    let base = serve(
        Router::new()
            .route("/v1/chat/completions", post(chat_endpoint))
            .with_state(state),
    )
    .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let handle = TunnelHandle::direct("vl", base, "/v1/chat/completions");
    let err = fast_client()
        .chat_complete(
            &handle,
            None,
            messages(),
            &SamplingParams::default(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
}

#[tokio::test]
async fn transcription_uploads_and_parses_timestamps() {
    let base = serve(Router::new().route("/transcribe", post(transcribe_endpoint))).await;

    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("audio.wav");
    tokio::fs::write(&audio, b"RIFFfake").await.unwrap();

    let handle = TunnelHandle::direct("parakeet", base, "/transcribe");
    let result = fast_client()
        .transcribe(&handle, &audio, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.transcription, "hello world");
    assert_eq!(result.word_timestamps.len(), 1);
    assert_eq!(result.segment_timestamps[0].end, 1.0);
}

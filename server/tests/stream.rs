//! End-to-end tests for the WebSocket frame stream
//! Tests: WebSocket connection -> binary PCM chunks -> raw RGB24 frames

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use common::*;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_BYTES: usize = 256 * 256 * 3;

async fn connect(app: &TestApp, query: &str) -> Client {
    let addr = spawn_server(app).await;
    let (ws, _) = connect_async(format!("ws://{addr}/stream{query}")).await.unwrap();
    ws
}

/// Next data or close message, skipping keepalives
async fn next_message(ws: &mut Client) -> Option<Message> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("stream stalled");
        match msg {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(msg)) => return Some(msg),
            Some(Err(_)) | None => return None,
        }
    }
}

async fn expect_frame(ws: &mut Client) {
    match next_message(ws).await {
        Some(Message::Binary(raw)) => assert_eq!(raw.len(), FRAME_BYTES),
        other => panic!("expected a binary frame, got {other:?}"),
    }
}

async fn expect_error(ws: &mut Client) -> Value {
    match next_message(ws).await {
        Some(Message::Text(text)) => {
            let error: Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(error["type"], "error");
            error
        }
        other => panic!("expected an error message, got {other:?}"),
    }
}

async fn expect_closed(ws: &mut Client) {
    match next_message(ws).await {
        None | Some(Message::Close(_)) => {}
        other => panic!("expected the stream to close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_returns_raw_frames() {
    let app = create_test_app();
    let mut ws = connect(&app, "?sample_rate=16000").await;

    for _ in 0..2 {
        ws.send(Message::binary(silence_pcm(40))).await.unwrap();
        expect_frame(&mut ws).await;
    }
    ws.close(None).await.unwrap();

    assert_eq!(app.state.synthesizer.frames_generated(), 2);
}

#[tokio::test]
async fn test_stream_defaults_sample_rate() {
    let app = create_test_app();
    let mut ws = connect(&app, "").await;

    ws.send(Message::binary(silence_pcm(20))).await.unwrap();
    expect_frame(&mut ws).await;
}

#[tokio::test]
async fn test_stream_rejects_text_messages() {
    let app = create_test_app();
    let mut ws = connect(&app, "?sample_rate=16000").await;

    ws.send(Message::text("hello")).await.unwrap();
    let error = expect_error(&mut ws).await;
    assert_eq!(error["code"], 400);

    // Session stays open for binary chunks
    ws.send(Message::binary(silence_pcm(20))).await.unwrap();
    expect_frame(&mut ws).await;
}

#[tokio::test]
async fn test_stream_bad_chunk_keeps_session() {
    let app = create_test_app();
    let mut ws = connect(&app, "?sample_rate=16000").await;

    ws.send(Message::binary(vec![0u8; 5])).await.unwrap();
    let error = expect_error(&mut ws).await;
    assert_eq!(error["code"], 400);

    ws.send(Message::binary(silence_pcm(20))).await.unwrap();
    expect_frame(&mut ws).await;
    assert_eq!(app.state.metrics.synthesis_stats().invalid_chunks, 1);
}

#[tokio::test]
async fn test_stream_rejects_bad_query_rate() {
    let app = create_test_app();
    let mut ws = connect(&app, "?sample_rate=4000").await;

    let error = expect_error(&mut ws).await;
    assert_eq!(error["code"], 400);
    expect_closed(&mut ws).await;
    assert_eq!(app.state.synthesizer.frames_generated(), 0);
}

#[tokio::test]
async fn test_stream_rejects_unparseable_query() {
    let app = create_test_app();
    let addr = spawn_server(&app).await;
    let result = connect_async(format!("ws://{addr}/stream?sample_rate=fast")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_stream_closes_when_pipeline_unavailable() {
    let app = create_uninitialized_app();
    let mut ws = connect(&app, "?sample_rate=16000").await;

    ws.send(Message::binary(silence_pcm(20))).await.unwrap();
    let error = expect_error(&mut ws).await;
    assert_eq!(error["code"], 503);
    expect_closed(&mut ws).await;
}

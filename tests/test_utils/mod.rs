//! Test utilities for integration tests
#![allow(dead_code)]
use std::time::Duration;

use tempfile::TempDir;
use tokio_rusqlite::Connection;

use gptchat::core::ChatConfig;
use gptchat::core::db::async_db;
use gptchat::openai::ModelTier;

/// Opens a fresh on-disk database inside a temporary directory. Keep
/// the returned `TempDir` alive for as long as the connection is used.
pub async fn test_db() -> (TempDir, Connection) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("gptchat.db");
    let db = async_db(db_path.to_str().unwrap())
        .await
        .expect("Failed to open db");
    (dir, db)
}

/// Chat config pointed at a mock server with a short idle timeout.
pub fn test_config(api_base: &str) -> ChatConfig {
    ChatConfig::new("test-key", "org-test", ModelTier::Fast)
        .unwrap()
        .with_api_base(api_base)
        .with_idle_timeout(Duration::from_secs(2))
}

/// Formats each payload as a server-sent event.
pub fn sse_body(payloads: &[&str]) -> String {
    payloads
        .iter()
        .map(|p| format!("data: {}\n\n", p))
        .collect()
}

/// A completion chunk carrying `content`.
pub fn content_chunk(content: &str) -> String {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "created": 1694268190,
        "model": "gpt-3.5-turbo",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
    .to_string()
}

/// A completion chunk closing the response with `reason`.
pub fn finish_chunk(reason: &str) -> String {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "created": 1694268190,
        "model": "gpt-3.5-turbo",
        "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
    })
    .to_string()
}

//! Drives one conversation against a completion service.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::accumulator::{Applied, TranscriptAccumulator};
use super::db::insert_exchange;
use super::fragment::Fragment;
use super::models::{Message, MessageStatus};
use crate::core::ChatConfig;
use crate::core::error::ChatError;
use crate::openai::{ChatRequest, CompletionClient, FragmentStream};

/// Published to subscribers as the transcript changes. `index` is the
/// position of the affected message in the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    PromptSubmitted { index: usize },
    Delta { index: usize, text: String },
    Finished { index: usize, finish_reason: Option<String> },
    Failed { index: usize, reason: String },
    Cancelled { index: usize },
}

type Subscribers = Mutex<HashMap<u64, mpsc::UnboundedSender<TranscriptEvent>>>;

/// Receives transcript events until dropped. Dropping it removes the
/// subscriber from the session.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<TranscriptEvent>,
    registry: Weak<Subscribers>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<TranscriptEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TranscriptEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade()
            && let Ok(mut subscribers) = registry.lock()
        {
            subscribers.remove(&self.id);
        }
    }
}

enum Opened {
    Response(anyhow::Result<FragmentStream>),
    Cancelled,
    TimedOut,
}

enum Next {
    Fragment(Option<Fragment>),
    Cancelled,
    TimedOut,
}

fn timeout_reason(idle_timeout: Duration) -> String {
    format!(
        "timed out after {}s waiting for the response",
        idle_timeout.as_secs_f32()
    )
}

/// A conversation with an LLM using an OpenAI compatible API.
///
/// Holds the transcript, streams each response into it, notifies
/// subscribers as text arrives and saves finished exchanges to the
/// database when one is configured.
///
/// Use `ChatSession::builder()` to construct a `ChatSession`.
pub struct ChatSession<C: CompletionClient> {
    client: C,
    config: ChatConfig,
    accumulator: TranscriptAccumulator,
    subscribers: Arc<Subscribers>,
    next_subscriber: AtomicU64,
    db: Option<Connection>,
    pub session_id: Option<String>,
}

impl<C: CompletionClient> ChatSession<C> {
    pub fn builder(client: C, config: ChatConfig) -> ChatSessionBuilder<C> {
        ChatSessionBuilder::new(client, config)
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn messages(&self) -> &[Message] {
        self.accumulator.messages()
    }

    pub fn is_streaming(&self) -> bool {
        self.accumulator.is_streaming()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, tx);
        }
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn publish(&self, event: TranscriptEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Sends `prompt` and streams the response into the transcript.
    ///
    /// Returns the bot message once it is closed. A failed, timed out
    /// or cancelled stream is not an error here, it shows up in the
    /// returned message's status.
    pub async fn send(
        &mut self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<Message, ChatError> {
        self.accumulator.submit_prompt(prompt)?;
        let index = self.accumulator.messages().len() - 1;
        self.publish(TranscriptEvent::PromptSubmitted { index });

        let request = ChatRequest::new(self.config.tier, self.accumulator.messages());
        tracing::info!(
            model = %request.model,
            history = request.messages.len(),
            "Requesting completion"
        );

        // A server that accepts the connection but never answers is
        // held to the same limit as one that stops mid-response
        let idle_timeout = self.config.idle_timeout;
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Opened::Cancelled,
            result = tokio::time::timeout(idle_timeout, self.client.stream_chat(&request)) => {
                match result {
                    Ok(result) => Opened::Response(result),
                    Err(_) => Opened::TimedOut,
                }
            }
        };

        match opened {
            Opened::Cancelled => self.close_cancelled(index),
            Opened::TimedOut => self.close_failed(index, &timeout_reason(idle_timeout)),
            Opened::Response(Err(e)) => {
                self.close_failed(index, &format!("request failed: {}", e))
            }
            Opened::Response(Ok(stream)) => self.drain(stream, index, &cancel).await,
        }

        let response = self
            .accumulator
            .last()
            .cloned()
            .ok_or(ChatError::ProtocolViolation("transcript is empty"))?;

        if let MessageStatus::Finished { .. } = response.status {
            self.persist(index).await;
        }

        Ok(response)
    }

    // The stream is dropped when this returns, closing the connection
    // no matter how the message ended.
    async fn drain(&mut self, mut stream: FragmentStream, index: usize, cancel: &CancellationToken) {
        let idle_timeout = self.config.idle_timeout;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Cancelled,
                next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
                    Ok(fragment) => Next::Fragment(fragment),
                    Err(_) => Next::TimedOut,
                },
            };

            let fragment = match next {
                Next::Cancelled => {
                    self.close_cancelled(index);
                    return;
                }
                Next::TimedOut => {
                    self.close_failed(index, &timeout_reason(idle_timeout));
                    return;
                }
                Next::Fragment(None) => {
                    self.close_failed(index, "stream closed before the response finished");
                    return;
                }
                Next::Fragment(Some(fragment)) => fragment,
            };

            tracing::debug!("Fragment received: {:?}", fragment);
            match self.accumulator.apply_fragment(fragment) {
                Ok(Applied::Appended(text)) => {
                    if !text.is_empty() {
                        self.publish(TranscriptEvent::Delta { index, text });
                    }
                }
                Ok(Applied::Closed) => {
                    let finish_reason = match self.accumulator.last().map(|m| &m.status) {
                        Some(MessageStatus::Finished { finish_reason }) => finish_reason.clone(),
                        _ => None,
                    };
                    tracing::info!("Response finished ({:?})", finish_reason);
                    self.publish(TranscriptEvent::Finished {
                        index,
                        finish_reason,
                    });
                    return;
                }
                Ok(Applied::Failed) => {
                    let reason = match self.accumulator.last().map(|m| &m.status) {
                        Some(MessageStatus::Failed { reason }) => reason.clone(),
                        _ => String::new(),
                    };
                    tracing::warn!("Response failed: {}", reason);
                    self.publish(TranscriptEvent::Failed { index, reason });
                    return;
                }
                Ok(Applied::AlreadyClosed) | Err(_) => return,
            }
        }
    }

    fn close_failed(&mut self, index: usize, reason: &str) {
        if self.accumulator.fail(reason) {
            self.publish(TranscriptEvent::Failed {
                index,
                reason: reason.to_string(),
            });
        }
    }

    fn close_cancelled(&mut self, index: usize) {
        if self.accumulator.cancel() {
            tracing::info!("Response cancelled");
            self.publish(TranscriptEvent::Cancelled { index });
        }
    }

    async fn persist(&self, index: usize) {
        let (Some(db), Some(session_id)) = (&self.db, &self.session_id) else {
            return;
        };
        let messages = self.accumulator.messages();
        let prompt = index.checked_sub(1).and_then(|i| messages.get(i));
        let (Some(prompt), Some(response)) = (prompt, messages.get(index)) else {
            return;
        };

        // Saving is best effort, the exchange is still in memory
        if let Err(e) = insert_exchange(db, session_id, prompt, response).await {
            tracing::error!("Failed to save chat exchange for session {}: {}", session_id, e);
        }
    }
}

pub struct ChatSessionBuilder<C: CompletionClient> {
    client: C,
    config: ChatConfig,
    db: Option<Connection>,
    session_id: Option<String>,
    messages: Vec<Message>,
}

impl<C: CompletionClient> ChatSessionBuilder<C> {
    pub fn new(client: C, config: ChatConfig) -> Self {
        Self {
            client,
            config,
            db: None,
            session_id: None,
            messages: Vec::new(),
        }
    }

    pub fn build(self) -> ChatSession<C> {
        ChatSession {
            client: self.client,
            config: self.config,
            accumulator: TranscriptAccumulator::with_messages(self.messages),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
            db: self.db,
            session_id: self.session_id,
        }
    }

    /// Saves finished exchanges to `db`. A new session id is generated
    /// unless one is given.
    pub fn database(mut self, db: &Connection, session_id: Option<&str>) -> Self {
        if let Some(id) = session_id {
            self.session_id = Some(id.to_string());
        } else {
            self.session_id = Some(Uuid::new_v4().to_string());
        }
        self.db = Some(db.clone());
        self
    }

    /// Seeds the transcript, e.g. when resuming a stored session.
    /// Bot messages left open by an earlier run are marked failed so
    /// the session doesn't start out streaming.
    pub fn transcript(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages
            .into_iter()
            .map(|mut m| {
                if m.is_open_bot() {
                    m.status = MessageStatus::Failed {
                        reason: "interrupted".to_string(),
                    };
                }
                m
            })
            .collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::models::Role;
    use crate::core::db::memory_db;
    use crate::openai::ModelTier;
    use anyhow::{Error, anyhow};
    use async_trait::async_trait;

    /// Replays fragments, then either ends or hangs forever.
    struct ScriptedClient {
        fragments: Vec<Fragment>,
        stall: bool,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedClient {
        fn new(fragments: Vec<Fragment>) -> Self {
            Self {
                fragments,
                stall: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn stalling(fragments: Vec<Fragment>) -> Self {
            Self {
                stall: true,
                ..Self::new(fragments)
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream, Error> {
            self.requests.lock().unwrap().push(request.clone());
            let replay = futures::stream::iter(self.fragments.clone());
            if self.stall {
                Ok(Box::pin(replay.chain(futures::stream::pending())))
            } else {
                Ok(Box::pin(replay))
            }
        }
    }

    struct FailingClient;

    #[async_trait]
    impl CompletionClient for FailingClient {
        async fn stream_chat(&self, _request: &ChatRequest) -> Result<FragmentStream, Error> {
            Err(anyhow!("connection refused"))
        }
    }

    /// Never answers the request.
    struct SilentClient;

    #[async_trait]
    impl CompletionClient for SilentClient {
        async fn stream_chat(&self, _request: &ChatRequest) -> Result<FragmentStream, Error> {
            futures::future::pending().await
        }
    }

    fn test_config() -> ChatConfig {
        ChatConfig::new("test-key", "org-test", ModelTier::Fast)
            .unwrap()
            .with_idle_timeout(Duration::from_millis(100))
    }

    fn drain_events(sub: &mut Subscription) -> Vec<TranscriptEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_send_streams_response() {
        let client = ScriptedClient::new(vec![
            Fragment::text("Hel"),
            Fragment::text("lo"),
            Fragment::end("stop"),
        ]);
        let mut session = ChatSession::builder(client, test_config()).build();
        let mut sub = session.subscribe();

        let response = session.send("Hi", CancellationToken::new()).await.unwrap();

        assert_eq!(response.role, Role::Bot);
        assert_eq!(response.content, "Hello");
        assert_eq!(
            response.status,
            MessageStatus::Finished {
                finish_reason: Some("stop".to_string())
            }
        );
        assert_eq!(session.messages().len(), 2);
        assert!(!session.is_streaming());

        assert_eq!(
            drain_events(&mut sub),
            vec![
                TranscriptEvent::PromptSubmitted { index: 1 },
                TranscriptEvent::Delta {
                    index: 1,
                    text: "Hel".to_string()
                },
                TranscriptEvent::Delta {
                    index: 1,
                    text: "lo".to_string()
                },
                TranscriptEvent::Finished {
                    index: 1,
                    finish_reason: Some("stop".to_string())
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_send_includes_history() {
        let client = ScriptedClient::new(vec![Fragment::text("Sure"), Fragment::end("stop")]);
        let mut session = ChatSession::builder(client, test_config()).build();

        session.send("First", CancellationToken::new()).await.unwrap();
        session.send("Second", CancellationToken::new()).await.unwrap();

        let requests = session.client.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[1].model, "gpt-3.5-turbo");
        assert_eq!(session.messages().len(), 4);
    }

    #[tokio::test]
    async fn test_send_empty_prompt() {
        let client = ScriptedClient::new(vec![]);
        let mut session = ChatSession::builder(client, test_config()).build();
        assert_eq!(
            session.send(" ", CancellationToken::new()).await,
            Err(ChatError::EmptyPrompt)
        );
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_stream_stalls_until_timeout() {
        let client = ScriptedClient::stalling(vec![Fragment::text("Hel")]);
        let mut session = ChatSession::builder(client, test_config()).build();
        let mut sub = session.subscribe();

        let response = session.send("Hi", CancellationToken::new()).await.unwrap();

        assert_eq!(response.content, "Hel");
        assert!(response.status.is_stream_failed());
        assert!(matches!(
            drain_events(&mut sub).last(),
            Some(TranscriptEvent::Failed { index: 1, .. })
        ));
        // Not streaming anymore so the next prompt is accepted
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_stream_ends_without_end_marker() {
        let client = ScriptedClient::new(vec![Fragment::text("Hel")]);
        let mut session = ChatSession::builder(client, test_config()).build();

        let response = session.send("Hi", CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, "Hel");
        assert!(matches!(response.status, MessageStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_stream_error_fragment() {
        let client = ScriptedClient::new(vec![
            Fragment::text("Hel"),
            Fragment::Error("server went away".to_string()),
        ]);
        let mut session = ChatSession::builder(client, test_config()).build();

        let response = session.send("Hi", CancellationToken::new()).await.unwrap();
        assert_eq!(
            response.status,
            MessageStatus::Failed {
                reason: "server went away".to_string()
            }
        );
        assert_eq!(response.content, "Hel");
    }

    #[tokio::test]
    async fn test_request_failure_fails_message() {
        let mut session = ChatSession::builder(FailingClient, test_config()).build();
        let response = session.send("Hi", CancellationToken::new()).await.unwrap();

        match response.status {
            MessageStatus::Failed { reason } => assert!(reason.contains("connection refused")),
            other => panic!("Expected failed status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let mut session = ChatSession::builder(SilentClient, test_config()).build();
        let mut sub = session.subscribe();

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            session.send("Hi", CancellationToken::new()),
        )
        .await
        .expect("send should give up after the idle timeout")
        .unwrap();

        match &response.status {
            MessageStatus::Failed { reason } => assert!(reason.contains("timed out")),
            other => panic!("Expected failed status, got {:?}", other),
        }
        assert!(!session.is_streaming());
        assert!(matches!(
            drain_events(&mut sub).last(),
            Some(TranscriptEvent::Failed { index: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_response() {
        let config = test_config().with_idle_timeout(Duration::from_secs(10));
        let mut session = ChatSession::builder(SilentClient, config).build();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let response = session.send("Hi", cancel).await.unwrap();
        assert_eq!(response.status, MessageStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let client = ScriptedClient::stalling(vec![Fragment::text("Hel")]);
        let config = test_config().with_idle_timeout(Duration::from_secs(10));
        let mut session = ChatSession::builder(client, config).build();
        let mut sub = session.subscribe();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let response = session.send("Hi", cancel).await.unwrap();
        assert_eq!(response.status, MessageStatus::Cancelled);
        assert_eq!(response.content, "Hel");
        assert_eq!(
            drain_events(&mut sub).last(),
            Some(&TranscriptEvent::Cancelled { index: 1 })
        );
    }

    #[tokio::test]
    async fn test_cancel_before_send() {
        let client = ScriptedClient::new(vec![Fragment::text("Hel"), Fragment::end("stop")]);
        let mut session = ChatSession::builder(client, test_config()).build();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = session.send("Hi", cancel).await.unwrap();
        assert_eq!(response.status, MessageStatus::Cancelled);
        assert_eq!(response.content, "");
    }

    #[tokio::test]
    async fn test_subscription_dropped_unsubscribes() {
        let client = ScriptedClient::new(vec![Fragment::end("stop")]);
        let session = ChatSession::builder(client, test_config()).build();

        let first = session.subscribe();
        let second = session.subscribe();
        assert_eq!(session.subscriber_count(), 2);

        drop(first);
        assert_eq!(session.subscriber_count(), 1);
        drop(second);
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_exchange_is_persisted() {
        let db = memory_db().await.unwrap();
        let client = ScriptedClient::new(vec![Fragment::text("Hello"), Fragment::end("stop")]);
        let mut session = ChatSession::builder(client, test_config())
            .database(&db, Some("session-1"))
            .build();

        session.send("Hi", CancellationToken::new()).await.unwrap();

        let stored = crate::chat::db::find_chat_session_by_id(&db, "session-1")
            .await
            .unwrap();
        assert_eq!(stored, session.messages().to_vec());
    }

    #[tokio::test]
    async fn test_failed_exchange_is_not_persisted() {
        let db = memory_db().await.unwrap();
        let client = ScriptedClient::new(vec![Fragment::text("Hel")]);
        let mut session = ChatSession::builder(client, test_config())
            .database(&db, None)
            .build();
        assert!(session.session_id.is_some());

        session.send("Hi", CancellationToken::new()).await.unwrap();

        let session_id = session.session_id.clone().unwrap();
        let stored = crate::chat::db::find_chat_session_by_id(&db, &session_id)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[test]
    fn test_builder_transcript_closes_open_messages() {
        let client = ScriptedClient::new(vec![]);
        let session = ChatSession::builder(client, test_config())
            .transcript(vec![Message::user("Hi"), Message::bot_placeholder()])
            .build();

        assert!(!session.is_streaming());
        assert!(session.messages()[1].status.is_stream_failed());
    }
}

//! Accumulates a streamed completion into the transcript.
//!
//! A prompt appends a user message followed by an empty bot message.
//! Fragments are concatenated onto that bot message until an end
//! marker, an error, a failure reported by the caller, or a
//! cancellation closes it. Only one bot message can be open at a time.
use crate::core::error::ChatError;

use super::fragment::{Fragment, Utf8Buffer};
use super::models::{Message, MessageStatus, Role, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Streaming,
}

/// What `apply_fragment` did with a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Text was appended. Holds the newly decoded text, which can be
    /// empty when the fragment ended mid-character.
    Appended(String),
    Closed,
    /// An end marker arrived for a message that was already closed.
    AlreadyClosed,
    Failed,
}

#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    transcript: Transcript,
    pending: Utf8Buffer,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            transcript: Transcript::new_with_messages(messages),
            pending: Utf8Buffer::new(),
        }
    }

    pub fn state(&self) -> State {
        if self.is_streaming() {
            State::Streaming
        } else {
            State::Idle
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.transcript.last().is_some_and(Message::is_open_bot)
    }

    pub fn messages(&self) -> &[Message] {
        self.transcript.messages()
    }

    pub fn last(&self) -> Option<&Message> {
        self.transcript.last()
    }

    /// Appends the user message and an empty bot placeholder and
    /// returns the updated messages.
    pub fn submit_prompt(&mut self, text: &str) -> Result<&[Message], ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        if self.is_streaming() {
            tracing::warn!("Rejected prompt while a response is still streaming");
            return Err(ChatError::AwaitingResponse);
        }

        self.transcript.push(Message::user(text));
        self.transcript.push(Message::bot_placeholder());
        self.pending = Utf8Buffer::new();

        Ok(self.transcript.messages())
    }

    pub fn apply_fragment(&mut self, fragment: Fragment) -> Result<Applied, ChatError> {
        let Some(last) = self.transcript.last() else {
            tracing::warn!("Dropping fragment received before any prompt: {:?}", fragment);
            return Err(ChatError::ProtocolViolation("no messages in transcript"));
        };

        if !last.is_open_bot() {
            // A repeated end marker after the bot message closed is fine
            if last.role == Role::Bot && matches!(fragment, Fragment::End { .. }) {
                return Ok(Applied::AlreadyClosed);
            }
            tracing::warn!(
                "Dropping fragment with no open bot message (last role {:?}): {:?}",
                last.role,
                fragment
            );
            return Err(ChatError::ProtocolViolation("no open bot message"));
        }

        match fragment {
            Fragment::Delta(bytes) => {
                let text = self.pending.push(&bytes);
                if let Some(msg) = self.transcript.last_mut() {
                    msg.content.push_str(&text);
                }
                Ok(Applied::Appended(text))
            }
            Fragment::End { finish_reason } => {
                self.close(MessageStatus::Finished { finish_reason });
                Ok(Applied::Closed)
            }
            Fragment::Error(reason) => {
                self.close(MessageStatus::Failed { reason });
                Ok(Applied::Failed)
            }
        }
    }

    /// Closes the open bot message as failed, keeping whatever content
    /// arrived. Returns false when nothing was open.
    pub fn fail(&mut self, reason: &str) -> bool {
        if !self.is_streaming() {
            return false;
        }
        tracing::warn!("Response stream failed: {}", reason);
        self.close(MessageStatus::Failed {
            reason: reason.to_string(),
        });
        true
    }

    /// Closes the open bot message as cancelled. Returns false when
    /// nothing was open.
    pub fn cancel(&mut self) -> bool {
        if !self.is_streaming() {
            return false;
        }
        self.close(MessageStatus::Cancelled);
        true
    }

    fn close(&mut self, status: MessageStatus) {
        let rest = self.pending.flush();
        if let Some(msg) = self.transcript.last_mut() {
            if !rest.is_empty() {
                tracing::warn!("Stream closed in the middle of a character");
                msg.content.push_str(&rest);
            }
            msg.status = status;
        }
    }
}

pub mod accumulator;
pub mod db;
pub mod fragment;
pub mod models;
pub mod session;

pub use accumulator::{Applied, State, TranscriptAccumulator};
pub use fragment::{Fragment, Utf8Buffer};
pub use models::{Message, MessageStatus, Role, Transcript};
pub use session::{ChatSession, ChatSessionBuilder, Subscription, TranscriptEvent};

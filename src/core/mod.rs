pub mod config;
pub mod db;
pub mod error;
pub mod prefs;

pub use config::{AppConfig, ChatConfig};
pub use prefs::{PreferenceStore, Settings};

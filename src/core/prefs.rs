//! Persisted string preferences, the credentials and model selection
//! the chat reads at startup.
use anyhow::{Error, Result};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

pub const API_KEY: &str = "apiKey";
pub const ORGANIZATION: &str = "org";
pub const GPT_VERSION: &str = "gptVersion";
pub const SESSION: &str = "session";

/// Snapshot of the stored preferences.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub gpt_version: Option<String>,
    pub session: Option<String>,
}

impl Settings {
    /// `OPENAI_API_KEY`, `OPENAI_ORGANIZATION` and `GPTCHAT_MODEL` take
    /// precedence over stored values when `lookup` finds them.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(org) = lookup("OPENAI_ORGANIZATION") {
            self.organization = Some(org);
        }
        if let Some(model) = lookup("GPTCHAT_MODEL") {
            self.gpt_version = Some(model);
        }
        self
    }
}

#[derive(Clone)]
pub struct PreferenceStore {
    db: Connection,
}

impl PreferenceStore {
    pub fn new(db: &Connection) -> Self {
        Self { db: db.clone() }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let key = key.to_owned();
        let value = self
            .db
            .call(move |conn| {
                let value: Option<String> = conn
                    .query_row(
                        "SELECT value FROM preference WHERE key = ?",
                        [key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let key = key.to_owned();
        let value = value.to_owned();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO preference (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    [key, value],
                )?;
                Ok(())
            })
            .await?;
        tracing::debug!("Preference updated");
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), Error> {
        let key = key.to_owned();
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM preference WHERE key = ?", [key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn settings(&self) -> Result<Settings, Error> {
        Ok(Settings {
            api_key: self.get(API_KEY).await?,
            organization: self.get(ORGANIZATION).await?,
            gpt_version: self.get(GPT_VERSION).await?,
            session: self.get(SESSION).await?,
        })
    }
}

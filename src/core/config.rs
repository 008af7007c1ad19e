use std::env;
use std::time::Duration;

use super::error::ConfigError;
use super::prefs::Settings;
use crate::openai::{DEFAULT_API_BASE, ModelTier};

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Paths and service locations for the CLI.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub storage_path: String,
    pub db_path: String,
    pub auth_api_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let storage_path = env::var("GPTCHAT_STORAGE_PATH").unwrap_or("./".to_string());
        let db_path = format!("{}/gptchat.db", storage_path.trim_end_matches('/'));
        let auth_api_url = env::var("GPTCHAT_AUTH_URL").ok().filter(|url| !url.is_empty());

        Self {
            storage_path,
            db_path,
            auth_api_url,
        }
    }
}

/// Everything a chat session needs to talk to the completion API.
/// Construction fails when either credential is missing, so holding a
/// `ChatConfig` means chat is usable.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatConfig {
    pub api_key: String,
    pub organization: String,
    pub tier: ModelTier,
    pub api_base: String,
    pub idle_timeout: Duration,
}

impl ChatConfig {
    pub fn new(api_key: &str, organization: &str, tier: ModelTier) -> Result<Self, ConfigError> {
        if api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if organization.trim().is_empty() {
            return Err(ConfigError::MissingOrganization);
        }

        Ok(Self {
            api_key: api_key.trim().to_string(),
            organization: organization.trim().to_string(),
            tier,
            api_base: DEFAULT_API_BASE.to_string(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let tier = match settings.gpt_version.as_deref() {
            Some(version) if !version.trim().is_empty() => version.parse()?,
            _ => ModelTier::default(),
        };
        Self::new(
            settings.api_key.as_deref().unwrap_or_default(),
            settings.organization.as_deref().unwrap_or_default(),
            tier,
        )
    }

    /// Stored settings with environment overrides applied on top. An
    /// explicit `model` wins over both.
    pub fn load(settings: Settings, model: Option<&str>) -> Result<Self, ConfigError> {
        Self::resolve(settings, model, |key| env::var(key).ok())
    }

    fn resolve(
        settings: Settings,
        model: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut settings = settings.with_overrides(&lookup);
        if let Some(model) = model {
            settings.gpt_version = Some(model.to_string());
        }
        let config = Self::from_settings(&settings)?;

        let api_base = lookup("GPTCHAT_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let idle_timeout = match lookup("GPTCHAT_IDLE_TIMEOUT_SECS") {
            Some(secs) => parse_timeout(&secs)?,
            None => Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        };

        Ok(config
            .with_api_base(&api_base)
            .with_idle_timeout(idle_timeout))
    }
}

fn parse_timeout(secs: &str) -> Result<Duration, ConfigError> {
    match secs.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(ConfigError::Invalid {
            key: "GPTCHAT_IDLE_TIMEOUT_SECS".to_string(),
            reason: format!("expected a positive number of seconds, got `{}`", secs),
        }),
        Ok(n) => Ok(Duration::from_secs(n)),
    }
}

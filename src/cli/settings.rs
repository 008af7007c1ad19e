use anyhow::Result;

use crate::core::db::async_db;
use crate::core::error::ConfigError;
use crate::core::prefs::{API_KEY, GPT_VERSION, ORGANIZATION};
use crate::core::{AppConfig, PreferenceStore};
use crate::openai::ModelTier;

fn mask(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 4 {
        return "****".to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{}", tail)
}

pub async fn run(
    config: &AppConfig,
    api_key: Option<String>,
    org: Option<String>,
    model: Option<String>,
    show: bool,
) -> Result<()> {
    let db = async_db(&config.db_path).await?;
    let prefs = PreferenceStore::new(&db);

    if let Some(key) = api_key.as_deref().map(str::trim) {
        if key.is_empty() {
            return Err(ConfigError::MissingApiKey.into());
        }
        prefs.set(API_KEY, key).await?;
    }
    if let Some(org) = org.as_deref().map(str::trim) {
        if org.is_empty() {
            return Err(ConfigError::MissingOrganization.into());
        }
        prefs.set(ORGANIZATION, org).await?;
    }
    if let Some(model) = model {
        let tier: ModelTier = model.parse()?;
        prefs.set(GPT_VERSION, tier.as_setting()).await?;
    }

    let settings = prefs.settings().await?;
    if show {
        println!(
            "api key:      {}",
            settings.api_key.as_deref().map(mask).unwrap_or("(not set)".to_string())
        );
        println!(
            "organization: {}",
            settings.organization.as_deref().unwrap_or("(not set)")
        );
        let tier = settings
            .gpt_version
            .as_deref()
            .and_then(|v| v.parse::<ModelTier>().ok())
            .unwrap_or_default();
        println!("model:        {}", tier.model_id());
        println!(
            "signed in:    {}",
            if settings.session.is_some() { "yes" } else { "no" }
        );
    } else if settings.api_key.is_none() || settings.organization.is_none() {
        println!("Chat needs both --api-key and --org to be set");
    } else {
        println!("Settings saved");
    }

    Ok(())
}

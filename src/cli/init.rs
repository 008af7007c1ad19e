use anyhow::Result;
use std::fs;

use crate::core::AppConfig;
use crate::core::db::async_db;

pub async fn run(config: &AppConfig) -> Result<()> {
    fs::create_dir_all(&config.storage_path)?;
    async_db(&config.db_path).await?;
    tracing::info!("Initialized database at {}", config.db_path);
    println!("Created {}", config.db_path);
    println!("Next: gptchat settings --api-key <KEY> --org <ORG>");
    Ok(())
}

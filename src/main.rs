use anyhow::Result;
use gptchat::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}

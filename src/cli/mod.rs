use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::core::AppConfig;

pub mod chat;
pub mod history;
pub mod init;
pub mod login;
pub mod settings;

use login::AuthMode;

#[derive(Subcommand)]
enum Command {
    /// Create the local database
    Init {},
    /// Store the OpenAI credentials and model selection
    Settings {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        org: Option<String>,
        /// Model tier, `3.5` (fast) or `4` (advanced)
        #[arg(long)]
        model: Option<String>,
        /// Print the current settings with the API key masked
        #[arg(long, action, default_value = "false")]
        show: bool,
    },
    /// Sign in with an existing account
    Login {
        #[arg(long)]
        email: String,
    },
    /// Create an account
    Signup {
        #[arg(long)]
        email: String,
    },
    /// Forget the active session
    Logout {},
    /// Start a chat session
    Chat {
        /// Use this model tier for the session instead of the stored one
        #[arg(long)]
        model: Option<String>,
        /// Resume a stored session
        #[arg(long)]
        session: Option<String>,
    },
    /// List stored chat sessions or print one
    History {
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

/// Logs go to stderr so they don't mix with streamed responses.
fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    init_tracing();

    let config = AppConfig::default();

    // Handle each sub command
    match args.command {
        Some(Command::Init {}) => {
            init::run(&config).await?;
        }
        Some(Command::Settings {
            api_key,
            org,
            model,
            show,
        }) => {
            settings::run(&config, api_key, org, model, show).await?;
        }
        Some(Command::Login { email }) => {
            login::run(&config, AuthMode::SignIn, &email).await?;
        }
        Some(Command::Signup { email }) => {
            login::run(&config, AuthMode::SignUp, &email).await?;
        }
        Some(Command::Logout {}) => {
            login::logout(&config).await?;
        }
        Some(Command::Chat { model, session }) => {
            chat::run(&config, model, session).await?;
        }
        Some(Command::History { session }) => {
            history::run(&config, session).await?;
        }
        None => {}
    }

    Ok(())
}

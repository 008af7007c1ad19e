use anyhow::{Result, anyhow};
use rustyline::DefaultEditor;
use std::env;

use crate::auth::{HttpIdentityProvider, IdentityProvider};
use crate::core::db::async_db;
use crate::core::error::AuthError;
use crate::core::prefs::SESSION;
use crate::core::{AppConfig, PreferenceStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    SignIn,
    SignUp,
}

fn read_password() -> Result<String> {
    if let Ok(password) = env::var("GPTCHAT_PASSWORD") {
        return Ok(password);
    }
    let mut rl = DefaultEditor::new()?;
    let password = rl.readline("Password: ")?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}

pub async fn run(config: &AppConfig, mode: AuthMode, email: &str) -> Result<()> {
    let auth_url = config
        .auth_api_url
        .as_deref()
        .ok_or(anyhow!("Set GPTCHAT_AUTH_URL to the identity provider's frontend API"))?;
    let provider = HttpIdentityProvider::new(auth_url);
    let password = read_password()?;

    let result = match mode {
        AuthMode::SignIn => provider.authenticate(email, &password).await,
        AuthMode::SignUp => provider.create_account(email, &password).await,
    };

    let token = match result {
        Ok(token) => token,
        // The provider's message is meant for the user, show it and let
        // them try again
        Err(AuthError::Rejected(message)) => {
            eprintln!("{}", message);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    provider.set_active_session(&token).await?;

    let db = async_db(&config.db_path).await?;
    PreferenceStore::new(&db).set(SESSION, token.as_str()).await?;

    match mode {
        AuthMode::SignIn => println!("Welcome back"),
        AuthMode::SignUp => println!("Account created"),
    }
    Ok(())
}

pub async fn logout(config: &AppConfig) -> Result<()> {
    let db = async_db(&config.db_path).await?;
    PreferenceStore::new(&db).remove(SESSION).await?;
    println!("Signed out");
    Ok(())
}

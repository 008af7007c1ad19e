//! Sign in and sign up against a hosted identity provider.
//!
//! Only the provider's frontend API is used: an account or sign in
//! attempt produces a session id which then has to be made the active
//! session. Passwords never leave this module except in the request.
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::AuthError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken(pub String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_account(&self, identifier: &str, secret: &str)
    -> Result<SessionToken, AuthError>;

    async fn authenticate(&self, identifier: &str, secret: &str)
    -> Result<SessionToken, AuthError>;

    async fn set_active_session(&self, token: &SessionToken) -> Result<(), AuthError>;
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SignAttempt {
    status: Option<String>,
    created_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    response: Option<SignAttempt>,
    #[serde(default)]
    errors: Vec<ProviderError>,
}

/// Identity provider reached over HTTP using Clerk style endpoints.
#[derive(Clone, Debug)]
pub struct HttpIdentityProvider {
    http: reqwest::Client,
    base_url: String,
}

impl HttpIdentityProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str, form: &[(&str, &str)]) -> Result<ProviderResponse, AuthError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(url)
            .timeout(Duration::from_secs(30))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let parsed = serde_json::from_str::<ProviderResponse>(&body).map_err(|e| {
            AuthError::InvalidResponse(format!("{} ({}): {}", status, e, body))
        })?;

        // Surface the provider's first message as is, same as it would
        // be shown in its own UI
        if let Some(err) = parsed.errors.first() {
            tracing::warn!("Identity provider rejected {}: {}", path, err.message);
            return Err(AuthError::Rejected(err.message.clone()));
        }
        if !status.is_success() {
            return Err(AuthError::InvalidResponse(format!("{}: {}", status, body)));
        }
        Ok(parsed)
    }

    fn session_from(parsed: ProviderResponse) -> Result<SessionToken, AuthError> {
        let attempt = parsed
            .response
            .ok_or_else(|| AuthError::InvalidResponse("missing response".to_string()))?;

        match attempt.created_session_id {
            Some(id) if !id.is_empty() => Ok(SessionToken(id)),
            _ => Err(AuthError::InvalidResponse(format!(
                "no session was created (status {})",
                attempt.status.as_deref().unwrap_or("unknown")
            ))),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn create_account(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<SessionToken, AuthError> {
        let parsed = self
            .post(
                "/v1/client/sign_ups",
                &[("email_address", identifier), ("password", secret)],
            )
            .await?;
        let token = Self::session_from(parsed)?;
        tracing::info!("Account created");
        Ok(token)
    }

    async fn authenticate(&self, identifier: &str, secret: &str) -> Result<SessionToken, AuthError> {
        let parsed = self
            .post(
                "/v1/client/sign_ins",
                &[
                    ("identifier", identifier),
                    ("password", secret),
                    ("strategy", "password"),
                ],
            )
            .await?;
        let token = Self::session_from(parsed)?;
        tracing::info!("Signed in");
        Ok(token)
    }

    async fn set_active_session(&self, token: &SessionToken) -> Result<(), AuthError> {
        let path = format!("/v1/client/sessions/{}/touch", token.as_str());
        self.post(&path, &[("active_organization_id", "")]).await?;
        Ok(())
    }
}

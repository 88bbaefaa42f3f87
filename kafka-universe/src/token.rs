//! OAuth2 access tokens for SASL/OAUTHBEARER broker authentication.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::TokenError;

// Refresh this long before the token actually expires
const EXPIRY_MARGIN_SECS: i64 = 30;
// Lifetime assumed when the endpoint omits `expires_in`
const DEFAULT_LIFETIME_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) > now
    }
}

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<AccessToken, TokenError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

/// Client-credentials grant against an OAuth2 token endpoint, with the token
/// cached until shortly before it expires.
pub struct ClientCredentialsTokenProvider {
    client_id: String,
    client_secret: String,
    token_url: String,
    timeout: Duration,
    cached: Mutex<Option<AccessToken>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(client_id: String, client_secret: String, token_url: String) -> Self {
        Self {
            client_id,
            client_secret,
            token_url,
            timeout: Duration::from_secs(10),
            cached: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn request_token(&self) -> Result<AccessToken, TokenError> {
        // librdkafka asks for tokens from whatever thread polls the client, which
        // may be a runtime worker: the blocking client must run on its own thread.
        std::thread::scope(|scope| {
            scope
                .spawn(|| self.request_token_blocking())
                .join()
                .map_err(|_| TokenError::Worker)?
        })
    }

    fn request_token_blocking(&self) -> Result<AccessToken, TokenError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let response = client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            warn!(status = status.as_u16(), url = %self.token_url, "Token request rejected");
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json()?;
        let lifetime = token.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS);
        debug!(lifetime_secs = lifetime, "Obtained OAuth2 access token");

        Ok(AccessToken {
            value: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        })
    }
}

impl TokenProvider for ClientCredentialsTokenProvider {
    fn token(&self) -> Result<AccessToken, TokenError> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }

        let token = self.request_token()?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

//! Access token caching.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::sync::Mutex;

use crate::clock::Clock;

/// A bearer token together with the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Obtains fresh tokens from the provider.
#[async_trait::async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<IssuedToken>;
}

/// Capability handed to request code: "give me a token that is valid now".
#[async_trait::async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<SecretString>;

    /// Forget the current token, e.g. after the provider rejected it.
    async fn invalidate(&self);
}

/// Caches one token and refreshes it lazily once it is within `margin` of
/// expiring. Concurrent callers share a single refresh.
pub struct TokenCache<I> {
    issuer: I,
    clock: Arc<dyn Clock>,
    margin: chrono::Duration,
    current: Mutex<Option<IssuedToken>>,
}

impl<I: TokenIssuer> TokenCache<I> {
    pub fn new(issuer: I, clock: Arc<dyn Clock>, margin: Duration) -> Self {
        Self {
            issuer,
            clock,
            margin: chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero()),
            current: Mutex::new(None),
        }
    }

    fn is_fresh(&self, token: &IssuedToken) -> bool {
        self.clock.now() + self.margin < token.expires_at
    }
}

#[async_trait::async_trait]
impl<I: TokenIssuer> AccessTokenSource for TokenCache<I> {
    async fn access_token(&self) -> Result<SecretString> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if self.is_fresh(token) {
                return Ok(token.access.clone());
            }
        }

        tracing::debug!("Refreshing provider access token");
        let token = self.issuer.issue().await?;
        let access = token.access.clone();
        *current = Some(token);
        Ok(access)
    }

    async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

//! GoCardless Bank Account Data API client.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::config::{ProviderConfig, ProviderCredentials};

use super::token::{AccessTokenSource, IssuedToken, TokenCache, TokenIssuer};
use super::{ProviderClient, TransactionFeed};

const API_PREFIX: &str = "/api/v2";

/// Used when the token response carries no lifetime.
const FALLBACK_TOKEN_LIFETIME_SECS: i64 = 23 * 60;

fn api_url(base_url: &str, path: &str) -> String {
    format!("{}{API_PREFIX}{path}", base_url.trim_end_matches('/'))
}

/// Exchanges the secret pair for an access token.
struct TokenEndpoint {
    client: Client,
    base_url: String,
    credentials: ProviderCredentials,
    clock: Arc<dyn Clock>,
}

#[async_trait::async_trait]
impl TokenIssuer for TokenEndpoint {
    async fn issue(&self) -> Result<IssuedToken> {
        #[derive(Serialize)]
        struct Request<'a> {
            secret_id: &'a str,
            secret_key: &'a str,
        }

        #[derive(Deserialize)]
        struct Response {
            access: String,
            #[serde(default)]
            access_expires: Option<i64>,
        }

        let url = api_url(&self.base_url, "/token/new/");
        let response = self
            .client
            .post(&url)
            .json(&Request {
                secret_id: self.credentials.secret_id.expose_secret(),
                secret_key: self.credentials.secret_key.expose_secret(),
            })
            .send()
            .await
            .context("Provider token request failed")?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .context("Failed to read provider token response body")?;

        if !status.is_success() {
            anyhow::bail!("Provider token request failed ({status}): {body_text}");
        }

        let parsed: Response =
            serde_json::from_str(&body_text).context("Failed to parse provider token response")?;
        let lifetime = parsed
            .access_expires
            .filter(|secs| *secs > 0)
            .unwrap_or(FALLBACK_TOKEN_LIFETIME_SECS);

        Ok(IssuedToken {
            access: SecretString::new(parsed.access.into()),
            expires_at: self.clock.now() + chrono::Duration::seconds(lifetime),
        })
    }
}

/// HTTP adapter for the account-data API.
pub struct GoCardlessClient {
    client: Client,
    base_url: String,
    balance_types: Vec<String>,
    tokens: TokenCache<TokenEndpoint>,
}

impl GoCardlessClient {
    pub fn new(
        config: &ProviderConfig,
        credentials: ProviderCredentials,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build provider HTTP client")?;

        let issuer = TokenEndpoint {
            client: client.clone(),
            base_url: config.base_url.clone(),
            credentials,
            clock: clock.clone(),
        };

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            balance_types: config.balance_types.clone(),
            tokens: TokenCache::new(issuer, clock, config.token_refresh_margin),
        })
    }

    /// Authenticated GET. A 401 drops the cached token and retries once.
    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = api_url(&self.base_url, path);
        let mut retried = false;

        loop {
            let token = self.tokens.access_token().await?;
            let response = self
                .client
                .get(&url)
                .bearer_auth(token.expose_secret())
                .header("Accept", "application/json")
                .send()
                .await
                .with_context(|| format!("Provider HTTP request failed: {path}"))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !retried {
                tracing::debug!(path, "Provider rejected access token, refreshing");
                self.tokens.invalidate().await;
                retried = true;
                continue;
            }

            let body_text = response
                .text()
                .await
                .context("Failed to read provider response body")?;

            if !status.is_success() {
                anyhow::bail!("Provider request {path} failed ({status}): {body_text}");
            }

            return serde_json::from_str(&body_text)
                .with_context(|| format!("Failed to parse provider response for {path}"));
        }
    }

    fn pick_balance<'a>(&self, balances: &'a [ProviderBalance]) -> Option<&'a ProviderBalance> {
        self.balance_types
            .iter()
            .find_map(|wanted| {
                balances
                    .iter()
                    .find(|b| b.balance_type.as_deref() == Some(wanted.as_str()))
            })
            .or_else(|| balances.first())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderBalance {
    balance_amount: ProviderAmount,
    #[serde(default)]
    balance_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderAmount {
    amount: Value,
}

#[async_trait::async_trait]
impl ProviderClient for GoCardlessClient {
    async fn list_accounts(&self, requisition_id: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Requisition {
            #[serde(default)]
            accounts: Vec<String>,
        }

        let requisition: Requisition = self
            .get(&format!("/requisitions/{requisition_id}/"))
            .await?;
        Ok(requisition.accounts)
    }

    async fn list_transactions(&self, account_id: &str) -> Result<TransactionFeed> {
        #[derive(Deserialize)]
        struct Groups {
            #[serde(default)]
            booked: Vec<Value>,
            #[serde(default)]
            pending: Vec<Value>,
        }

        #[derive(Deserialize)]
        struct Response {
            transactions: Option<Groups>,
        }

        let response: Response = self
            .get(&format!("/accounts/{account_id}/transactions/"))
            .await?;
        let groups = response.transactions.with_context(|| {
            format!("Malformed transactions response for account {account_id}: missing transactions object")
        })?;

        Ok(TransactionFeed::new(groups.booked, groups.pending))
    }

    async fn current_balance(&self, account_id: &str) -> Result<Decimal> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            balances: Vec<ProviderBalance>,
        }

        let response: Response = self
            .get(&format!("/accounts/{account_id}/balances/"))
            .await?;
        let balance = self
            .pick_balance(&response.balances)
            .with_context(|| format!("Provider returned no balances for account {account_id}"))?;

        let raw = match &balance.balance_amount.amount {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            other => anyhow::bail!("Unexpected balance amount for account {account_id}: {other}"),
        };
        Decimal::from_str(&raw)
            .with_context(|| format!("Invalid balance amount for account {account_id}: {raw}"))
    }
}

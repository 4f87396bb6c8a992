//! Credentials for the firehose subscription handshake.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

/// OAuth client the UAA issues platform-user tokens to.
const UAA_CLIENT_ID: &str = "cf";

/// Supplies the `Authorization` header value for the firehose handshake.
pub trait TokenFetcher: Send + Sync {
    fn fetch_token(&self) -> impl Future<Output = Result<String>> + Send;
}

/// Token fetcher used when access control is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTokenFetcher;

impl TokenFetcher for NoopTokenFetcher {
    async fn fetch_token(&self) -> Result<String> {
        Ok(String::new())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Fetches a token from a UAA server with the password grant.
pub struct UaaTokenFetcher {
    client: reqwest::Client,
    uaa_url: String,
    username: String,
    password: String,
}

impl UaaTokenFetcher {
    pub fn new(
        uaa_url: &str,
        username: &str,
        password: &str,
        insecure_skip_verify: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .context("building UAA client")?;

        Ok(Self {
            client,
            uaa_url: uaa_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl TokenFetcher for UaaTokenFetcher {
    async fn fetch_token(&self) -> Result<String> {
        let url = format!("{}/oauth/token", self.uaa_url);

        let resp = self
            .client
            .post(&url)
            .basic_auth(UAA_CLIENT_ID, Some(""))
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "password"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("requesting token from {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("UAA token request failed: {status}");
        }

        let token: TokenResponse = resp.json().await.context("decoding UAA token response")?;
        info!(uaa = %self.uaa_url, "fetched firehose auth token");

        Ok(format_token(&token))
    }
}

fn format_token(token: &TokenResponse) -> String {
    format!("{} {}", token.token_type, token.access_token)
}

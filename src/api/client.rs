//! Authenticated HTTP client for the chat REST API
//!
//! Wraps reqwest::Client with bearer-token injection and status mapping.

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::auth::TokenStore;
use crate::config::Config;
use crate::error::{ChatError, ChatResult};

/// Standard response envelope used by the backend: `{ success, data, message }`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

/// Bearer-authenticated client for the chat endpoints.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct ChatApi {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl ChatApi {
    pub fn new(base_url: &str, token: impl Into<String>) -> ChatResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ChatError::Request(format!("invalid API URL {}: {}", base_url, e)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.into(),
        })
    }

    /// Build a client from the stored configuration. Fails if no usable token is stored.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let token = config
            .get_token()
            .context("No token stored. Run 'hallchat login --token <TOKEN>' first.")?;
        if token.is_expired() {
            bail!("Stored token expired. Run 'hallchat login' again.");
        }
        Ok(Self::new(&config.api_url, token.token)?)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Join path segments onto the base URL, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> ChatResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Request(format!("API URL {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn get(&self, url: Url) -> ChatResult<reqwest::Response> {
        tracing::debug!("GET {}", url);
        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await?;
        check_response(resp, &url).await
    }

    pub async fn post(
        &self,
        url: Url,
        body: &serde_json::Value,
    ) -> ChatResult<reqwest::Response> {
        tracing::debug!("POST {}", url);
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        check_response(resp, &url).await
    }

    pub async fn put(&self, url: Url, body: &serde_json::Value) -> ChatResult<reqwest::Response> {
        tracing::debug!("PUT {}", url);
        let resp = self
            .http
            .put(url.clone())
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        check_response(resp, &url).await
    }

    pub async fn delete(&self, url: Url) -> ChatResult<reqwest::Response> {
        tracing::debug!("DELETE {}", url);
        let resp = self
            .http
            .delete(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await?;
        check_response(resp, &url).await
    }

    pub async fn post_multipart(
        &self,
        url: Url,
        form: reqwest::multipart::Form,
    ) -> ChatResult<reqwest::Response> {
        tracing::debug!("POST (multipart) {}", url);
        let resp = self
            .http
            .post(url.clone())
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        check_response(resp, &url).await
    }
}

/// Unwrap the `data` field of a response envelope.
pub async fn read_data<T: DeserializeOwned>(resp: reqwest::Response) -> ChatResult<T> {
    let text = resp.text().await?;
    let envelope: Envelope<T> = serde_json::from_str(&text)?;
    if envelope.success == Some(false) {
        return Err(ChatError::Rejected(
            envelope
                .message
                .unwrap_or_else(|| "request was not successful".to_string()),
        ));
    }
    envelope
        .data
        .ok_or_else(|| ChatError::Decode("response has no data field".to_string()))
}

/// Check HTTP response status code and return a typed error on failure.
async fn check_response(resp: reqwest::Response, url: &Url) -> ChatResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or(body);

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        tracing::warn!("{} for {}; stored token is no longer accepted", status, url);
        return Err(ChatError::Unauthorized {
            status: status.as_u16(),
            message,
        });
    }

    Err(ChatError::Http {
        status: status.as_u16(),
        message,
    })
}

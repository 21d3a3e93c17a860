//! POSTs match lists to an operator-configured URL.

use std::time::Duration;

use reqwest::Client;
use url::Url;

use super::ClientError;
use crate::objects::FallbackPayload;

/// Typed client for the HTTP fallback receiver.
///
/// The receiving endpoint is operated elsewhere; this only knows how to
/// deliver `{matches, timestamp, source, metadata}` to it.
#[derive(Debug, Clone)]
pub struct FallbackClient {
    http: Client,
    url: Url,
}

impl FallbackClient {
    pub fn new(url: Url) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            url,
        }
    }

    /// Replace the default `reqwest::Client` with a custom one (e.g. to
    /// configure timeouts or a proxy).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `POST <url>` with the payload as JSON.
    pub async fn send(&self, payload: &FallbackPayload) -> Result<(), ClientError> {
        let body = serde_json::to_vec(payload)?;

        let resp = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(ClientError::Api { status, body })
        }
    }
}

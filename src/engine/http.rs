//! Engine that delegates each step to a remote reasoning service.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::traits::{ReasoningEngine, ReasoningInput, ReasoningOutcome};
use crate::util::{http_client, remote_error};

/// POSTs the [`ReasoningInput`] as JSON and parses a [`ReasoningOutcome`] back.
pub struct HttpEngine {
    url: String,
    api_token: Option<String>,
    client: Client,
}

impl HttpEngine {
    pub fn new(url: &str, api_token: Option<&str>, timeout: Duration) -> Self {
        Self {
            url: url.trim().to_string(),
            api_token: api_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string),
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl ReasoningEngine for HttpEngine {
    async fn reason(&self, input: ReasoningInput) -> anyhow::Result<ReasoningOutcome> {
        let mut request = self.client.post(&self.url).json(&input);
        if let Some(token) = self.api_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(remote_error("reasoning service", response).await);
        }
        Ok(response.json::<ReasoningOutcome>().await?)
    }

    fn name(&self) -> &str {
        "http"
    }
}

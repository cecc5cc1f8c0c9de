//! Record sync over a JSON HTTP API with bearer authentication.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use super::traits::RecordSync;
use crate::context::{sync_payload, PersistentContext};
use crate::util::{http_client, remote_error};

/// Talks to `{base_url}/tenants/{tenant}/contacts/{contact}/attributes`.
///
/// `GET` returns the attribute object (404 when the contact has none); `PUT`
/// replaces it with the non-null persistent fields.
pub struct HttpRecordSync {
    base_url: String,
    api_token: Option<String>,
    client: Client,
}

impl HttpRecordSync {
    pub fn new(base_url: &str, api_token: Option<&str>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string),
            client: http_client(timeout),
        }
    }

    fn attributes_url(&self, tenant_id: &str, contact_id: &str) -> String {
        format!(
            "{}/tenants/{tenant_id}/contacts/{contact_id}/attributes",
            self.base_url
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl RecordSync for HttpRecordSync {
    async fn fetch_record(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> anyhow::Result<Option<PersistentContext>> {
        let url = self.attributes_url(tenant_id, contact_id);
        let response = self.authorize(self.client.get(&url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(remote_error("record service", response).await);
        }

        let body: serde_json::Value = response.json().await?;
        if body.as_object().is_some_and(serde_json::Map::is_empty) || body.is_null() {
            return Ok(None);
        }
        let context = serde_json::from_value(body)
            .map_err(|e| anyhow::anyhow!("record for {tenant_id}_{contact_id} rejected: {e}"))?;
        Ok(Some(context))
    }

    async fn push_record(
        &self,
        tenant_id: &str,
        contact_id: &str,
        context: &PersistentContext,
    ) -> anyhow::Result<()> {
        let url = self.attributes_url(tenant_id, contact_id);
        let payload = sync_payload(context);
        let response = self
            .authorize(self.client.put(&url).json(&payload))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error("record service", response).await);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

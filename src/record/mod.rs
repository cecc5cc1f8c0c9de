pub mod http;
pub mod in_memory;
pub mod traits;

pub use http::HttpRecordSync;
pub use in_memory::InMemoryRecordSync;
pub use traits::RecordSync;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RecordSyncConfig;
use crate::context::PersistentContext;

/// Used when no system of record is configured: nothing to fetch, pushes are dropped.
pub struct NoopRecordSync;

#[async_trait]
impl RecordSync for NoopRecordSync {
    async fn fetch_record(&self, _: &str, _: &str) -> anyhow::Result<Option<PersistentContext>> {
        Ok(None)
    }

    async fn push_record(&self, _: &str, _: &str, _: &PersistentContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Factory: create the configured record sync adapter.
pub fn create_record_sync(config: &RecordSyncConfig) -> anyhow::Result<Arc<dyn RecordSync>> {
    match config.kind.as_str() {
        "none" => Ok(Arc::new(NoopRecordSync)),
        "memory" => Ok(Arc::new(InMemoryRecordSync::new())),
        "http" => {
            let Some(base_url) = config.base_url.as_deref().filter(|u| !u.trim().is_empty())
            else {
                anyhow::bail!("record_sync.base_url is required when record_sync.kind = \"http\"");
            };
            Ok(Arc::new(HttpRecordSync::new(
                base_url,
                config.api_token.as_deref(),
                Duration::from_secs(config.timeout_secs),
            )))
        }
        other => anyhow::bail!(
            "Unknown record_sync kind '{other}'. Supported values: none, memory, http"
        ),
    }
}

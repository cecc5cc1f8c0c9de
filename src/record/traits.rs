//! Boundary to the external system of record holding customer attributes.

use async_trait::async_trait;

use crate::context::PersistentContext;

/// Best-effort mirror of [`PersistentContext`] in an external CRM or inbox.
///
/// The session pipeline never blocks on `push_record`; `fetch_record` is only
/// consulted when the cache tier and the inbound payload have nothing.
#[async_trait]
pub trait RecordSync: Send + Sync {
    /// Fetch the stored record, `None` when the contact has none.
    async fn fetch_record(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> anyhow::Result<Option<PersistentContext>>;

    /// Replace the stored record.
    async fn push_record(
        &self,
        tenant_id: &str,
        contact_id: &str,
        context: &PersistentContext,
    ) -> anyhow::Result<()>;

    /// The name of this adapter.
    fn name(&self) -> &str;
}

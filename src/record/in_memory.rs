//! In-process record store, for single-process runs and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::traits::RecordSync;
use crate::context::PersistentContext;

#[derive(Default)]
pub struct InMemoryRecordSync {
    records: Mutex<HashMap<(String, String), PersistentContext>>,
    fail_fetch: AtomicBool,
    fail_push: AtomicBool,
    fetches: AtomicUsize,
    pushes: AtomicUsize,
}

impl InMemoryRecordSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: &str, contact_id: &str, context: PersistentContext) {
        self.records
            .lock()
            .insert((tenant_id.to_string(), contact_id.to_string()), context);
    }

    pub fn get(&self, tenant_id: &str, contact_id: &str) -> Option<PersistentContext> {
        self.records
            .lock()
            .get(&(tenant_id.to_string(), contact_id.to_string()))
            .cloned()
    }

    /// Make subsequent fetches fail, as an unreachable service would.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_push(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSync for InMemoryRecordSync {
    async fn fetch_record(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> anyhow::Result<Option<PersistentContext>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            anyhow::bail!("record service unreachable");
        }
        Ok(self.get(tenant_id, contact_id))
    }

    async fn push_record(
        &self,
        tenant_id: &str,
        contact_id: &str,
        context: &PersistentContext,
    ) -> anyhow::Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_push.load(Ordering::SeqCst) {
            anyhow::bail!("record service unreachable");
        }
        self.insert(tenant_id, contact_id, context.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

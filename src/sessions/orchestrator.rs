//! Per-session cycle runner: lock, drain, reason, persist, release.
//!
//! One invocation per inbound message. The invocation that wins the session
//! lock runs reasoning cycles until the queue stays empty; every other
//! invocation enqueues its message and returns `processing`.

use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::error::SessionError;
use super::traits::{CyclePhase, HandleOutcome, HandleStatus, InboundMessage};
use crate::config::{SessionConfig, TenantConfig, TurnstileConfig};
use crate::context::{
    ActiveTaskContext, ContextStore, PersistentContext, PersistentSource, QueuedMessage,
    RuntimeSource,
};
use crate::engine::{ReasoningEngine, ReasoningInput, ReasoningOutcome};
use crate::kv::{KvStore, StoreError};
use crate::lock::{HeldLock, LockOutcome, SessionLockManager};
use crate::observability::SessionMetrics;
use crate::queue::MessageQueue;
use crate::record::RecordSync;

pub const CONFIG_ISSUE_REPLY: &str =
    "I'm sorry, there seems to be a configuration issue. Please contact support.";
pub const BUSY_REPLY: &str = "I'm currently busy. Please try again in a moment.";
pub const FALLBACK_REPLY: &str =
    "I encountered an error processing your message. Please try again.";
pub const DEGRADED_REPLY: &str =
    "I'm having trouble reaching your records right now. Please try again in a moment.";

/// Why a cycle stopped before completing.
enum CycleAbort {
    /// Nothing to process: another holder already consumed our message.
    Empty,
    /// Fencing rejected a write or the lock could not be refreshed. Nothing of
    /// this cycle was stored; `unpersisted` goes back on the queue.
    LockLost { unpersisted: Vec<QueuedMessage> },
    /// The engine failed; partial state was persisted.
    Fault(SessionError),
    Store {
        error: StoreError,
        unpersisted: Vec<QueuedMessage>,
    },
}

impl CycleAbort {
    fn from_session(err: SessionError, unpersisted: Vec<QueuedMessage>) -> Self {
        match err {
            SessionError::LockLost { .. } => Self::LockLost { unpersisted },
            SessionError::StoreUnavailable(error) => Self::Store { error, unpersisted },
            other => Self::Store {
                error: StoreError::Unavailable(other.to_string()),
                unpersisted,
            },
        }
    }
}

struct CycleReport {
    reply: Option<String>,
    /// Messages found by the drain after persisting; not yet seen by the engine.
    drained: Vec<QueuedMessage>,
}

enum StepFault {
    Error(String),
    Panic(String),
    Timeout(Duration),
}

impl StepFault {
    fn kind(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::Panic(_) => "panic",
            Self::Timeout(_) => "timeout",
        }
    }

    fn into_error(self) -> SessionError {
        SessionError::EngineFault(match self {
            Self::Error(e) => e,
            Self::Panic(msg) => format!("panicked: {msg}"),
            Self::Timeout(d) => format!("step exceeded {}s", d.as_secs()),
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Fallback texts are not repeated back to back when a swept cycle fails again.
fn push_notice(replies: &mut Vec<String>, text: &str) {
    if replies.last().map(String::as_str) != Some(text) {
        replies.push(text.to_string());
    }
}

/// Per-inbound context the cycle runner needs alongside the lock.
struct Invocation<'a> {
    message: &'a InboundMessage,
    tenant: &'a TenantConfig,
}

pub struct SessionOrchestrator {
    tenants: HashMap<String, TenantConfig>,
    settings: SessionConfig,
    locks: SessionLockManager,
    queue: MessageQueue,
    contexts: ContextStore,
    engine: Arc<dyn ReasoningEngine>,
    metrics: Arc<SessionMetrics>,
}

impl SessionOrchestrator {
    pub fn new(
        tenants: HashMap<String, TenantConfig>,
        settings: SessionConfig,
        locks: SessionLockManager,
        queue: MessageQueue,
        contexts: ContextStore,
        engine: Arc<dyn ReasoningEngine>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            tenants,
            settings,
            locks,
            queue,
            contexts,
            engine,
            metrics,
        }
    }

    /// Wire every component over one shared store.
    pub fn from_config(
        config: &TurnstileConfig,
        kv: Arc<dyn KvStore>,
        records: Arc<dyn RecordSync>,
        engine: Arc<dyn ReasoningEngine>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        let settings = config.session.clone();
        Self::new(
            config.tenants.clone(),
            settings.clone(),
            SessionLockManager::new(Arc::clone(&kv)),
            MessageQueue::new(Arc::clone(&kv), settings.queue_ttl(), settings.marker_ttl()),
            ContextStore::new(
                kv,
                records,
                config.store.retry_policy(),
                settings.persistent_ttl(),
                settings.history_limit,
            ),
            engine,
            metrics,
        )
    }

    /// Build the store, adapters and metrics named by `config`.
    pub fn build(config: &TurnstileConfig) -> anyhow::Result<Self> {
        let kv = crate::kv::create_kv_store(&config.store)?;
        let records = crate::record::create_record_sync(&config.record_sync)?;
        let engine = crate::engine::create_engine(&config.engine)?;
        let metrics = Arc::new(SessionMetrics::new()?);
        Ok(Self::from_config(config, kv, records, engine, metrics))
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn locks(&self) -> &SessionLockManager {
        &self.locks
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Handle one inbound message. Always answers: a reply, `processing` when
    /// the message was queued behind a running cycle, or a fallback text.
    pub async fn handle_message(&self, message: InboundMessage) -> HandleOutcome {
        self.metrics.messages_received.inc();
        let Some(tenant) = self.tenants.get(&message.tenant_id) else {
            let err = SessionError::UnknownTenant(message.tenant_id.clone());
            tracing::warn!(kind = err.kind(), "{err}");
            return HandleOutcome::replied(CONFIG_ISSUE_REPLY);
        };

        let key = match crate::context::SessionKey::parse(&message.tenant_id, &message.contact_id) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(tenant = %message.tenant_id, "rejecting inbound message: {e}");
                return HandleOutcome::replied(CONFIG_ISSUE_REPLY);
            }
        };
        let inbound = message.to_queued();
        let call = Invocation { message: &message, tenant };
        tracing::debug!(
            session = %key,
            message_id = %inbound.message_id,
            phase = %CyclePhase::LockAttempt,
            "inbound message"
        );

        match self.locks.acquire(&key, self.settings.lock_ttl()).await {
            Ok(LockOutcome::Acquired(held)) => self.run(held, Some(inbound), &call).await,
            Ok(LockOutcome::Busy) => {
                self.metrics.lock_busy.inc();
                if let Err(e) = self.queue.enqueue(&key, &inbound).await {
                    self.metrics.store_errors.inc();
                    tracing::warn!(session = %key, "enqueue behind busy lock failed: {e}");
                    return HandleOutcome::replied(BUSY_REPLY);
                }
                self.metrics.messages_queued.inc();
                tracing::info!(
                    session = %key,
                    message_id = %inbound.message_id,
                    phase = %CyclePhase::Queued,
                    "session busy; message queued"
                );

                // The holder may have released between our acquire and the
                // enqueue. One more attempt keeps the message from stranding.
                match self.locks.acquire(&key, self.settings.lock_ttl()).await {
                    Ok(LockOutcome::Acquired(held)) => self.run(held, None, &call).await,
                    Ok(LockOutcome::Busy) => HandleOutcome::processing(),
                    Err(e) => {
                        tracing::warn!(session = %key, "re-acquire after enqueue failed: {e}");
                        HandleOutcome::processing()
                    }
                }
            }
            Err(e) => {
                self.metrics.store_errors.inc();
                let err = SessionError::from(e);
                tracing::error!(session = %key, kind = err.kind(), "lock acquire failed: {err}");
                HandleOutcome::replied(DEGRADED_REPLY)
            }
        }
    }

    /// Run cycles under `held` until the queue stays empty or the chain bound
    /// is hit. A failed cycle still sweeps the queue before letting go.
    async fn run(
        &self,
        held: HeldLock,
        inbound: Option<QueuedMessage>,
        call: &Invocation<'_>,
    ) -> HandleOutcome {
        let key = held.key().clone();
        let mut held = held;
        let mut inbound = inbound;
        let mut carry: Vec<QueuedMessage> = Vec::new();
        let mut fresh_lock = true;
        let mut replies: Vec<String> = Vec::new();
        let mut answered = false;
        let mut cycle: u32 = 0;

        loop {
            cycle += 1;
            let can_chain = cycle <= self.settings.max_chained_cycles;
            let started = Instant::now();
            self.metrics.cycles_started.inc();
            if cycle > 1 {
                self.metrics.chained_cycles.inc();
            }

            let result = self
                .run_cycle(
                    &held,
                    cycle,
                    fresh_lock,
                    inbound.take(),
                    std::mem::take(&mut carry),
                    call,
                )
                .await;
            fresh_lock = false;
            self.metrics
                .cycle_duration
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(report) => {
                    self.metrics.cycles_completed.inc();
                    answered = true;
                    replies.extend(report.reply);

                    if report.drained.is_empty() {
                        if let Some(next) = self.release_and_sweep(&held, can_chain).await {
                            held = next;
                            fresh_lock = true;
                            continue;
                        }
                        break;
                    }

                    if can_chain {
                        tracing::debug!(
                            session = %key,
                            cycle,
                            messages = report.drained.len(),
                            "messages arrived mid-cycle; chaining"
                        );
                        carry = report.drained;
                        continue;
                    }

                    self.stash_and_release(&held, report.drained).await;
                    break;
                }
                Err(CycleAbort::Empty) => {
                    tracing::debug!(session = %key, phase = %CyclePhase::Idle, "nothing left to process");
                    if let Some(next) = self.release_and_sweep(&held, can_chain).await {
                        held = next;
                        fresh_lock = true;
                        continue;
                    }
                    break;
                }
                Err(CycleAbort::LockLost { unpersisted }) => {
                    self.metrics.lock_lost.inc();
                    tracing::warn!(
                        session = %key,
                        token = %held.token(),
                        cycle,
                        requeued = unpersisted.len(),
                        "session lock lost; cycle discarded"
                    );
                    if let Err(e) = self.queue.requeue(&key, &unpersisted).await {
                        self.metrics.store_errors.inc();
                        tracing::error!(session = %key, "requeue after lock loss failed: {e}");
                    }
                    // The new holder may already be past its final drain.
                    if can_chain {
                        if let Ok(LockOutcome::Acquired(next)) =
                            self.locks.acquire(&key, self.settings.lock_ttl()).await
                        {
                            held = next;
                            fresh_lock = true;
                            continue;
                        }
                    }
                    break;
                }
                Err(CycleAbort::Fault(err)) => {
                    tracing::error!(session = %key, cycle, kind = err.kind(), "{err}");
                    push_notice(&mut replies, FALLBACK_REPLY);
                    answered = true;
                    if let Some(next) = self.release_and_sweep(&held, can_chain).await {
                        held = next;
                        fresh_lock = true;
                        continue;
                    }
                    break;
                }
                Err(CycleAbort::Store { error, unpersisted }) => {
                    self.metrics.store_errors.inc();
                    let err = SessionError::from(error);
                    tracing::error!(session = %key, cycle, kind = err.kind(), "cycle failed: {err}");
                    if !unpersisted.is_empty() {
                        if let Err(e) = self.queue.requeue(&key, &unpersisted).await {
                            tracing::error!(session = %key, "requeue after store failure failed: {e}");
                        }
                    }
                    push_notice(&mut replies, DEGRADED_REPLY);
                    answered = true;
                    if let Some(next) = self.release_and_sweep(&held, can_chain).await {
                        held = next;
                        fresh_lock = true;
                        continue;
                    }
                    break;
                }
            }
        }

        if !answered {
            return HandleOutcome::processing();
        }
        HandleOutcome {
            status: HandleStatus::Replied,
            reply: (!replies.is_empty()).then(|| replies.join("\n\n")),
        }
    }

    async fn run_cycle(
        &self,
        held: &HeldLock,
        cycle: u32,
        fresh_lock: bool,
        inbound: Option<QueuedMessage>,
        carry: Vec<QueuedMessage>,
        call: &Invocation<'_>,
    ) -> Result<CycleReport, CycleAbort> {
        let key = held.key();
        let mut taken = carry;

        let drained = match self.queue.drain_pending(key).await {
            Ok(drained) => drained,
            Err(error) => {
                taken.extend(inbound);
                return Err(CycleAbort::Store {
                    error,
                    unpersisted: taken,
                });
            }
        };
        self.metrics.messages_drained.inc_by(drained.len() as u64);
        taken.extend(drained);
        taken.extend(inbound);

        if !fresh_lock {
            self.refresh_lock(held, &taken).await?;
        }

        let loaded = match self
            .contexts
            .load_persistent(key, call.message.external_record.as_ref())
            .await
        {
            Ok(loaded) => loaded,
            Err(error) => {
                return Err(CycleAbort::Store {
                    error,
                    unpersisted: taken,
                })
            }
        };
        if loaded.degraded {
            self.metrics.degraded_loads.inc();
        }
        let mut active = match self.contexts.load_or_create_active(key).await {
            Ok(active) => active,
            Err(error) => {
                return Err(CycleAbort::Store {
                    error,
                    unpersisted: taken,
                })
            }
        };
        if active.pending.is_empty() && taken.is_empty() {
            return Err(CycleAbort::Empty);
        }
        active.pending.extend(taken.iter().cloned());

        let runtime = self.contexts.load_runtime(
            key,
            RuntimeSource {
                conversation_id: &call.message.conversation_id,
                sender: &call.message.sender,
                tenant: call.tenant,
                history: &call.message.recent_history,
                returning_customer: loaded.source != PersistentSource::Default
                    && !loaded.context.is_empty(),
                now: Utc::now(),
            },
        );
        let mut persistent = loaded.context;
        let mut persistent_dirty = false;
        let mut reply: Option<String> = None;

        tracing::info!(
            session = %key,
            token = %held.token(),
            cycle,
            pending = active.pending.len(),
            phase = %CyclePhase::Running,
            "reasoning cycle started"
        );

        for step in 1..=self.settings.max_reasoning_steps {
            if step > 1 {
                self.refresh_lock(held, &taken).await?;
                match self.queue.drain_pending(key).await {
                    Ok(more) => {
                        self.metrics.messages_drained.inc_by(more.len() as u64);
                        active.pending.extend(more.iter().cloned());
                        taken.extend(more);
                    }
                    Err(error) => {
                        return Err(CycleAbort::Store {
                            error,
                            unpersisted: taken,
                        })
                    }
                }
            }

            let new_messages = std::mem::take(&mut active.pending);
            let input = ReasoningInput {
                persistent: persistent.clone(),
                runtime: runtime.clone(),
                active: active.clone(),
                new_messages: new_messages.clone(),
                cycle,
                step,
            };

            match self.guarded_step(input).await {
                Ok(outcome) => {
                    let done = outcome.done;
                    persistent_dirty |= self.apply_outcome(
                        key,
                        outcome,
                        &mut active,
                        &mut persistent,
                        &mut reply,
                    );
                    if done {
                        break;
                    }
                }
                Err(fault) => {
                    self.metrics
                        .engine_faults
                        .with_label_values(&[fault.kind()])
                        .inc();
                    let err = fault.into_error();
                    tracing::warn!(session = %key, cycle, step, "{err}; keeping partial state");

                    let mut restored = self.charge_attempts(key, new_messages);
                    restored.append(&mut active.pending);
                    active.pending = restored;
                    if let Ok(more) = self.queue.drain_pending(key).await {
                        self.metrics.messages_drained.inc_by(more.len() as u64);
                        active.pending.extend(more.iter().cloned());
                        taken.extend(more);
                    }
                    active.last_activity_at = Utc::now();
                    self.persist(held, &active, &persistent, persistent_dirty)
                        .await
                        .map_err(|e| CycleAbort::from_session(e, std::mem::take(&mut taken)))?;
                    return Err(CycleAbort::Fault(err));
                }
            }
        }

        active.cycles_completed += 1;
        active.last_activity_at = Utc::now();
        self.persist(held, &active, &persistent, persistent_dirty)
            .await
            .map_err(|e| CycleAbort::from_session(e, taken))?;

        tracing::debug!(session = %key, cycle, phase = %CyclePhase::Draining, "final drain");
        let drained = match self.queue.drain_pending(key).await {
            Ok(drained) => drained,
            Err(e) => {
                // The drain is atomic, so on failure the messages are still queued.
                tracing::warn!(session = %key, "final drain failed: {e}");
                Vec::new()
            }
        };
        self.metrics.messages_drained.inc_by(drained.len() as u64);

        tracing::info!(
            session = %key,
            cycle,
            cycles_completed = active.cycles_completed,
            replied = reply.is_some(),
            "reasoning cycle completed"
        );
        Ok(CycleReport { reply, drained })
    }

    /// Fold one engine outcome into the cycle state. Returns whether the
    /// persistent context changed.
    fn apply_outcome(
        &self,
        key: &crate::context::SessionKey,
        outcome: ReasoningOutcome,
        active: &mut ActiveTaskContext,
        persistent: &mut PersistentContext,
        reply: &mut Option<String>,
    ) -> bool {
        // Whatever the engine leaves in `pending` is shown again next step.
        *active = outcome.active;

        let now = Utc::now();
        let mut dirty = false;
        for edit in &outcome.persistent_edits {
            match edit.apply(persistent, now) {
                Ok(changed) if !changed.is_empty() => {
                    tracing::debug!(session = %key, edit = edit.name(), ?changed, "persistent edit applied");
                    dirty = true;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session = %key, edit = edit.name(), "persistent edit skipped: {e}");
                }
            }
        }
        if !outcome.tool_calls.is_empty() {
            let names: Vec<&str> = outcome.tool_calls.iter().map(|c| c.name.as_str()).collect();
            tracing::debug!(session = %key, tools = ?names, "engine requested tools");
        }
        if outcome.reply.is_some() {
            *reply = outcome.reply;
        }
        dirty
    }

    /// Count one more fault against every message of the failed batch and
    /// drop those that reached the attempt limit.
    fn charge_attempts(
        &self,
        key: &crate::context::SessionKey,
        batch: Vec<QueuedMessage>,
    ) -> Vec<QueuedMessage> {
        let limit = self.settings.max_message_attempts;
        let mut kept = Vec::with_capacity(batch.len());
        for mut message in batch {
            message.attempts = message.attempts.saturating_add(1);
            if message.attempts >= limit {
                self.metrics.messages_dropped.inc();
                tracing::warn!(
                    session = %key,
                    message_id = %message.message_id,
                    attempts = message.attempts,
                    "dropping message after repeated engine faults"
                );
            } else {
                kept.push(message);
            }
        }
        kept
    }

    /// One engine call, isolated from errors, panics and overruns.
    async fn guarded_step(&self, input: ReasoningInput) -> Result<ReasoningOutcome, StepFault> {
        let deadline = self.settings.step_deadline();
        let step = AssertUnwindSafe(self.engine.reason(input)).catch_unwind();
        match tokio::time::timeout(deadline, step).await {
            Err(_) => Err(StepFault::Timeout(deadline)),
            Ok(Err(payload)) => Err(StepFault::Panic(panic_message(payload.as_ref()))),
            Ok(Ok(Err(e))) => Err(StepFault::Error(format!("{e:#}"))),
            Ok(Ok(Ok(outcome))) => Ok(outcome),
        }
    }

    async fn refresh_lock(&self, held: &HeldLock, taken: &[QueuedMessage]) -> Result<(), CycleAbort> {
        match self.locks.extend(held, self.settings.lock_ttl()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(CycleAbort::LockLost {
                unpersisted: taken.to_vec(),
            }),
            Err(error) => Err(CycleAbort::Store {
                error,
                unpersisted: taken.to_vec(),
            }),
        }
    }

    async fn persist(
        &self,
        held: &HeldLock,
        active: &ActiveTaskContext,
        persistent: &PersistentContext,
        persistent_dirty: bool,
    ) -> Result<(), SessionError> {
        tracing::debug!(session = %held.key(), phase = %CyclePhase::Persisting, "persisting cycle");
        if active.is_resolved() {
            self.contexts.delete_active(held).await?;
        } else {
            self.contexts
                .save_active(held, active, self.settings.active_ttl())
                .await?;
        }
        if persistent_dirty {
            self.contexts
                .save_persistent(held, persistent, self.settings.persistent_ttl())
                .await?;
        }
        Ok(())
    }

    /// Chain bound reached: park the late messages in the active tier for the
    /// next invocation and let go of the session.
    async fn stash_and_release(&self, held: &HeldLock, drained: Vec<QueuedMessage>) {
        let key = held.key();
        self.metrics.chain_bound_stashes.inc();
        let stashed = match self.contexts.load_or_create_active(key).await {
            Ok(mut active) => {
                active.pending.extend(drained.iter().cloned());
                active.last_activity_at = Utc::now();
                self.contexts
                    .save_active(held, &active, self.settings.active_ttl())
                    .await
            }
            Err(e) => Err(SessionError::from(e)),
        };

        match stashed {
            Ok(()) => {
                tracing::info!(
                    session = %key,
                    stashed = drained.len(),
                    "chained-cycle bound reached; messages kept for the next invocation"
                );
                self.release(held).await;
            }
            Err(err) => {
                tracing::warn!(session = %key, kind = err.kind(), "stash failed, requeueing: {err}");
                if let Err(e) = self.queue.requeue(key, &drained).await {
                    tracing::error!(session = %key, "requeue after failed stash failed: {e}");
                }
                if !matches!(err, SessionError::LockLost { .. }) {
                    self.release(held).await;
                }
            }
        }
    }

    /// Release, then take the lock back if something was enqueued after the
    /// last drain. An enqueuer that lost the race to our release retries the
    /// lock itself, so one of the two always sees the message.
    async fn release_and_sweep(&self, held: &HeldLock, can_chain: bool) -> Option<HeldLock> {
        self.release(held).await;
        if !can_chain || self.queue.len(held.key()).await.unwrap_or(0) == 0 {
            return None;
        }
        match self.locks.acquire(held.key(), self.settings.lock_ttl()).await {
            Ok(LockOutcome::Acquired(next)) => Some(next),
            _ => None,
        }
    }

    async fn release(&self, held: &HeldLock) {
        match self.locks.release(held).await {
            Ok(_) => tracing::debug!(
                session = %held.key(),
                token = %held.token(),
                phase = %CyclePhase::Released,
                "cycle finished"
            ),
            Err(e) => tracing::warn!(
                session = %held.key(),
                "lock release failed, it will expire on its own: {e}"
            ),
        }
    }
}

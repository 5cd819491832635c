//! Sync orchestrator: pushes queued orders and payments, pulls the reference
//! snapshot, and publishes status to subscribers.
//!
//! Status machine: `idle -> pushing -> pulling -> synced`, any step `-> error`,
//! and `error -> idle` when the next attempt begins. At most one full sync,
//! one push and one pull run at a time per terminal; a `full_sync` that finds
//! another in flight waits for it and returns the same outcome.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::PosBackend;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::models::{
    MappingStatus, PushOrder, PushPayment, PushRequest, PushResponse, QueueCounts, SyncIssue,
    SyncedOrder,
};
use crate::queue::{LocalQueue, PaymentSettlement};

const CONFLICT_FALLBACK: &str = "Order conflicts with server state";
const REJECTED_FALLBACK: &str = "Order rejected by server";
const BATCH_REJECTED_FALLBACK: &str = "Sync batch rejected by server";

// ---------------------------------------------------------------------------
// Status + listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Pulling,
    Pushing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pulling => "pulling",
            Self::Pushing => "pushing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Pulling | Self::Pushing)
    }
}

/// What listeners receive on every status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusEvent {
    pub status: SyncStatus,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

pub type StatusListener = Arc<dyn Fn(&SyncStatusEvent) + Send + Sync>;

struct StateInner {
    status: SyncStatus,
    last_error: Option<String>,
    last_synced_at: Option<DateTime<Utc>>,
    listeners: HashMap<u64, StatusListener>,
    next_listener_id: u64,
}

impl StateInner {
    fn event(&self) -> SyncStatusEvent {
        SyncStatusEvent {
            status: self.status,
            last_error: self.last_error.clone(),
            last_synced_at: self.last_synced_at,
        }
    }
}

fn lock_state(inner: &Mutex<StateInner>) -> MutexGuard<'_, StateInner> {
    // Listener panics must not wedge status reporting.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sync status plus its listener registry. One per engine; tests build as
/// many as they like.
#[derive(Clone)]
pub struct SyncStateContext {
    inner: Arc<Mutex<StateInner>>,
}

impl SyncStateContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                status: SyncStatus::Idle,
                last_error: None,
                last_synced_at: None,
                listeners: HashMap::new(),
                next_listener_id: 1,
            })),
        }
    }

    pub fn status(&self) -> SyncStatus {
        lock_state(&self.inner).status
    }

    pub fn snapshot(&self) -> SyncStatusEvent {
        lock_state(&self.inner).event()
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or [`Self::unsubscribe`] is called.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncStatusEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = lock_state(&self.inner);
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.insert(id, Arc::new(listener));
        Subscription {
            id,
            state: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        lock_state(&self.inner).listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        lock_state(&self.inner).listeners.len()
    }

    fn transition(&self, status: SyncStatus, error: Option<String>) {
        let (event, listeners) = {
            let mut inner = lock_state(&self.inner);
            if inner.status == status && inner.last_error == error {
                return;
            }
            inner.status = status;
            inner.last_error = error;
            if status == SyncStatus::Synced {
                inner.last_synced_at = Some(Utc::now());
            }
            let listeners: Vec<StatusListener> = inner.listeners.values().cloned().collect();
            (inner.event(), listeners)
        };

        debug!(status = status.as_str(), "Sync status changed");
        // Called outside the lock so a listener may (un)subscribe.
        for listener in listeners {
            listener(&event);
        }
    }

    /// `error -> idle` at the start of a new attempt.
    fn begin_attempt(&self) {
        if self.status() == SyncStatus::Error {
            self.transition(SyncStatus::Idle, None);
        }
    }

    fn fail(&self, err: &SyncError) {
        warn!(error = %err, "Sync failed");
        self.transition(SyncStatus::Error, Some(err.user_message()));
    }
}

impl Default for SyncStateContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one registered listener; dropping it unregisters.
pub struct Subscription {
    id: u64,
    state: Weak<Mutex<StateInner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.state.upgrade() {
            lock_state(&inner).listeners.remove(&self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOrder {
    pub temp_id: String,
    pub kind: MappingStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    /// False when offline or nothing was pending.
    pub attempted: bool,
    pub submitted_orders: usize,
    pub submitted_payments: usize,
    pub synced: Vec<SyncedOrder>,
    pub rejected: Vec<RejectedOrder>,
    /// Submitted orders the server did not classify; they stay pending.
    pub unmapped: Vec<String>,
    pub payments: PaymentSettlement,
    pub warnings: Vec<SyncIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub attempted: bool,
    pub products: usize,
    pub categories: usize,
    pub printer_routing: usize,
    pub sync_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub skipped_offline: bool,
    pub push: PushReport,
    pub pull: PullReport,
}

// ---------------------------------------------------------------------------
// Indicator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorState {
    Offline,
    Pending,
    Syncing,
    Error,
    Synced,
}

/// Everything the persistent status badge needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncIndicator {
    pub state: IndicatorState,
    pub pending_count: i64,
    pub error_count: i64,
    pub message: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator {
    queue: LocalQueue,
    backend: Arc<dyn PosBackend>,
    connectivity: ConnectivityMonitor,
    state: SyncStateContext,
    /// Held for the whole of a full sync; stores its outcome for coalesced
    /// callers.
    sync_lock: tokio::sync::Mutex<Option<Result<SyncReport, SyncError>>>,
    push_lock: tokio::sync::Mutex<()>,
    pull_lock: tokio::sync::Mutex<()>,
    /// How long synced orders stay in the queue. `None` keeps them.
    synced_retention: Option<Duration>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: LocalQueue,
        backend: Arc<dyn PosBackend>,
        connectivity: ConnectivityMonitor,
        state: SyncStateContext,
    ) -> Self {
        Self {
            queue,
            backend,
            connectivity,
            state,
            sync_lock: tokio::sync::Mutex::new(None),
            push_lock: tokio::sync::Mutex::new(()),
            pull_lock: tokio::sync::Mutex::new(()),
            synced_retention: None,
        }
    }

    pub fn with_synced_retention(mut self, retention: Option<Duration>) -> Self {
        self.synced_retention = retention;
        self
    }

    /// Drop synced orders older than the retention window.
    pub fn purge_expired(&self) -> Result<usize, SyncError> {
        let Some(retention) = self.synced_retention else {
            return Ok(0);
        };
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| SyncError::storage(format!("retention out of range: {e}")))?;
        self.queue.purge_synced_before(Utc::now() - retention)
    }

    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn state(&self) -> &SyncStateContext {
        &self.state
    }

    pub fn status(&self) -> SyncStatusEvent {
        self.state.snapshot()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncStatusEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.state.subscribe(listener)
    }

    /// Push then pull. Concurrent callers share one attempt.
    pub async fn full_sync(&self) -> Result<SyncReport, SyncError> {
        let mut outcome = match self.sync_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Full sync already in flight; waiting for its outcome");
                let guard = self.sync_lock.lock().await;
                return guard.clone().unwrap_or_else(|| Ok(SyncReport::default()));
            }
        };

        if !self.connectivity.is_online() {
            debug!("Offline; full sync skipped");
            let skipped = Ok(SyncReport {
                skipped_offline: true,
                ..SyncReport::default()
            });
            *outcome = Some(skipped.clone());
            return skipped;
        }

        self.state.begin_attempt();
        let result = self.push_then_pull().await;
        match &result {
            Ok(report) => {
                info!(
                    synced = report.push.synced.len(),
                    rejected = report.push.rejected.len(),
                    products = report.pull.products,
                    "Full sync complete"
                );
                self.state.transition(SyncStatus::Synced, None);
            }
            Err(err) => self.state.fail(err),
        }
        *outcome = Some(result.clone());
        result
    }

    async fn push_then_pull(&self) -> Result<SyncReport, SyncError> {
        let push = {
            let _push = self.push_lock.lock().await;
            self.push_once().await?
        };
        let pull = {
            let _pull = self.pull_lock.lock().await;
            self.pull_once().await?
        };
        Ok(SyncReport {
            skipped_offline: false,
            push,
            pull,
        })
    }

    /// Submit every pending order and payment as one batch.
    pub async fn push(&self) -> Result<PushReport, SyncError> {
        let _push = self.push_lock.lock().await;
        if !self.connectivity.is_online() || self.queue.count_pending()? == 0 {
            return self.push_once().await;
        }
        self.state.begin_attempt();
        let result = self.push_once().await;
        match &result {
            Ok(_) => self.state.transition(SyncStatus::Synced, None),
            Err(err) => self.state.fail(err),
        }
        result
    }

    /// Replace the reference snapshot with the server's current one.
    pub async fn pull(&self) -> Result<PullReport, SyncError> {
        let _pull = self.pull_lock.lock().await;
        if !self.connectivity.is_online() {
            return Ok(PullReport::default());
        }
        self.state.begin_attempt();
        let result = self.pull_once().await;
        match &result {
            Ok(_) => self.state.transition(SyncStatus::Synced, None),
            Err(err) => self.state.fail(err),
        }
        result
    }

    async fn push_once(&self) -> Result<PushReport, SyncError> {
        if !self.connectivity.is_online() {
            debug!("Offline; push skipped");
            return Ok(PushReport::default());
        }

        let orders = self.queue.list_pending_orders()?;
        let payments = self.queue.list_pending_payments()?;
        if orders.is_empty() && payments.is_empty() {
            return Ok(PushReport::default());
        }

        self.state.transition(SyncStatus::Pushing, None);

        // Only these ids are settled by the response; anything enqueued
        // while the request is in flight waits for the next cycle.
        let submitted_orders: Vec<String> = orders.iter().map(|o| o.temp_id.clone()).collect();
        let submitted_payments: Vec<String> =
            payments.iter().map(|p| p.payment_id.clone()).collect();

        let request = PushRequest {
            client_id: self.queue.client_id()?,
            pending_orders: orders.iter().map(PushOrder::from).collect(),
            pending_payments: payments.iter().map(PushPayment::from).collect(),
        };
        self.queue.record_push_attempt(&submitted_orders)?;

        info!(
            orders = submitted_orders.len(),
            payments = submitted_payments.len(),
            "Pushing queued records"
        );
        let response = self.backend.push(&request).await?;
        self.apply_push_response(&submitted_orders, &submitted_payments, response)
    }

    fn apply_push_response(
        &self,
        submitted_orders: &[String],
        submitted_payments: &[String],
        response: PushResponse,
    ) -> Result<PushReport, SyncError> {
        if !response.success && response.order_mappings.is_empty() {
            let message = response
                .errors
                .iter()
                .map(|e| e.message.trim())
                .find(|m| !m.is_empty())
                .unwrap_or(BATCH_REJECTED_FALLBACK)
                .to_string();
            warn!(%message, "Push batch rejected; queue left untouched");
            return Err(SyncError::BatchRejected(message));
        }

        let submitted: HashSet<&str> = submitted_orders.iter().map(String::as_str).collect();
        let mut mapped: HashSet<&str> = HashSet::new();
        let mut synced = Vec::new();
        let mut rejected = Vec::new();

        for mapping in &response.order_mappings {
            let Some(&temp_id) = submitted.get(mapping.temp_id.as_str()) else {
                warn!(
                    temp_id = %mapping.temp_id,
                    "Ignoring mapping for an order not in this batch"
                );
                continue;
            };
            mapped.insert(temp_id);
            match mapping.status {
                MappingStatus::Synced => synced.push(SyncedOrder {
                    temp_id: mapping.temp_id.clone(),
                    real_id: mapping.real_id,
                    order_number: mapping.order_number,
                }),
                kind @ (MappingStatus::Conflict | MappingStatus::Error) => {
                    let message = issue_message(&response.errors, temp_id).unwrap_or(match kind {
                        MappingStatus::Conflict => CONFLICT_FALLBACK,
                        _ => REJECTED_FALLBACK,
                    });
                    rejected.push(RejectedOrder {
                        temp_id: mapping.temp_id.clone(),
                        kind,
                        message: message.to_string(),
                    });
                }
            }
        }

        self.queue.mark_orders_synced(&synced)?;
        for rejection in &rejected {
            self.queue
                .mark_order_rejected(&rejection.temp_id, rejection.kind, &rejection.message)?;
        }

        let unmapped: Vec<String> = submitted_orders
            .iter()
            .filter(|id| !mapped.contains(id.as_str()))
            .cloned()
            .collect();
        for temp_id in &unmapped {
            warn!(temp_id = %temp_id, "Server returned no mapping; order stays pending");
        }

        let payments = self
            .queue
            .settle_payments(submitted_payments, response.success)?;

        for warning in &response.warnings {
            warn!(
                temp_id = warning.temp_id.as_deref().unwrap_or("-"),
                code = %warning.code,
                message = %warning.message,
                "Server warning during push"
            );
        }

        info!(
            synced = synced.len(),
            rejected = rejected.len(),
            unmapped = unmapped.len(),
            payments_synced = payments.synced,
            payments_errored = payments.errored,
            "Push settled"
        );

        Ok(PushReport {
            attempted: true,
            submitted_orders: submitted_orders.len(),
            submitted_payments: submitted_payments.len(),
            synced,
            rejected,
            unmapped,
            payments,
            warnings: response.warnings,
        })
    }

    async fn pull_once(&self) -> Result<PullReport, SyncError> {
        if !self.connectivity.is_online() {
            debug!("Offline; pull skipped");
            return Ok(PullReport::default());
        }

        self.state.transition(SyncStatus::Pulling, None);
        let token = self.queue.sync_token()?;
        let snapshot = self.backend.pull(token.as_deref()).await?;
        self.queue.store_sync_snapshot(&snapshot)?;

        info!(
            products = snapshot.products.len(),
            categories = snapshot.categories.len(),
            "Reference snapshot pulled"
        );
        Ok(PullReport {
            attempted: true,
            products: snapshot.products.len(),
            categories: snapshot.categories.len(),
            printer_routing: snapshot.printer_routing.len(),
            sync_token: Some(snapshot.sync_token),
        })
    }

    /// Badge state derived from reachability, sync status and queue counts.
    pub fn indicator(&self) -> Result<SyncIndicator, SyncError> {
        let counts = self.queue.queue_counts()?;
        let status = self.state.snapshot();
        let pending_count = counts.total_pending();
        let error_count = counts.total_errors();

        let (state, message) = if !self.connectivity.is_online() {
            (IndicatorState::Offline, None)
        } else if status.status.is_busy() {
            (IndicatorState::Syncing, None)
        } else if status.status == SyncStatus::Error {
            (IndicatorState::Error, status.last_error.clone())
        } else if error_count > 0 {
            (IndicatorState::Error, Some(attention_message(&counts)))
        } else if pending_count > 0 {
            (IndicatorState::Pending, None)
        } else {
            (IndicatorState::Synced, None)
        };

        Ok(SyncIndicator {
            state,
            pending_count,
            error_count,
            message,
            last_synced_at: status.last_synced_at,
        })
    }
}

/// "1 order needs attention", "2 orders and 1 payment need attention".
fn attention_message(counts: &QueueCounts) -> String {
    let noun = |count: i64, one: &str, many: &str| match count {
        0 => None,
        1 => Some(format!("1 {one}")),
        n => Some(format!("{n} {many}")),
    };
    let parts: Vec<String> = [
        noun(counts.error_orders, "order", "orders"),
        noun(counts.error_payments, "payment", "payments"),
    ]
    .into_iter()
    .flatten()
    .collect();
    let verb = if counts.total_errors() == 1 { "needs" } else { "need" };
    format!("{} {verb} attention", parts.join(" and "))
}

fn issue_message<'a>(errors: &'a [SyncIssue], temp_id: &str) -> Option<&'a str> {
    errors
        .iter()
        .find(|e| e.temp_id.as_deref() == Some(temp_id))
        .map(|e| e.message.trim())
        .filter(|m| !m.is_empty())
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background sync loop.
///
/// Runs one `full_sync` when started online and one per offline -> online
/// transition. With `interval`, also syncs on every tick while online with
/// pending work. A successful cycle then purges synced orders past the
/// orchestrator's retention window. Stops when `cancel` fires.
///
/// Transitions are handled one at a time. If the network drops and returns
/// while a reconnect sync is still running, that sync finishes and no
/// separate one follows; the work left behind waits for the next interval
/// tick, or for the next reconnect when `interval` is `None`.
pub fn start_sync_loop(
    orchestrator: Arc<SyncOrchestrator>,
    interval: Option<Duration>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Sync loop started (interval: {interval:?})");
        let mut online_rx = orchestrator.connectivity.subscribe();
        let mut was_online = *online_rx.borrow_and_update();
        let mut ticker = interval.map(|period| {
            let mut t = tokio::time::interval_at(Instant::now() + period, period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        if was_online {
            run_cycle(&orchestrator, "startup").await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    let restored = online && !was_online;
                    if !online && was_online {
                        info!("Network offline; deferring remote sync and keeping queue pending");
                    }
                    was_online = online;
                    if restored {
                        info!("Network restored; resuming queued sync");
                        run_cycle(&orchestrator, "reconnect").await;
                    }
                }
                _ = next_tick(&mut ticker) => {
                    if !orchestrator.connectivity.is_online() {
                        continue;
                    }
                    match orchestrator.queue.count_pending() {
                        Ok(0) => {}
                        Ok(_) => run_cycle(&orchestrator, "interval").await,
                        Err(e) => warn!("Could not count pending records: {e}"),
                    }
                }
            }
        }
        info!("Sync loop stopped");
    })
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_cycle(orchestrator: &SyncOrchestrator, trigger: &str) {
    match orchestrator.full_sync().await {
        Ok(report) => {
            if report.push.attempted {
                info!(trigger, synced = report.push.synced.len(), "Sync cycle complete");
            } else {
                debug!(trigger, "Sync cycle complete (nothing pushed)");
            }
            if let Err(e) = orchestrator.purge_expired() {
                warn!(trigger, "Could not purge synced orders: {e}");
            }
        }
        Err(e) => warn!(trigger, "Sync cycle failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{
        OrderItem, PaymentMethod, PendingOrder, PendingPayment, QueueStatus, SalesChannel,
    };
    use crate::testing::FakeBackend;

    struct Harness {
        orch: Arc<SyncOrchestrator>,
        backend: Arc<FakeBackend>,
        queue: LocalQueue,
        monitor: ConnectivityMonitor,
    }

    fn harness(online: bool) -> Harness {
        let queue = LocalQueue::new(Arc::new(db::init_in_memory().unwrap()));
        let backend = Arc::new(FakeBackend::new());
        let monitor = ConnectivityMonitor::new(online);
        let orch = Arc::new(SyncOrchestrator::new(
            queue.clone(),
            backend.clone(),
            monitor.clone(),
            SyncStateContext::new(),
        ));
        Harness {
            orch,
            backend,
            queue,
            monitor,
        }
    }

    fn order(temp_id: &str) -> PendingOrder {
        PendingOrder::new(
            temp_id,
            vec![OrderItem {
                product_id: 3,
                quantity: 1,
                notes: None,
                modifiers: vec![],
                removed_ingredients: vec![],
            }],
            SalesChannel::DineIn,
            1,
        )
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_offline_orders_sync_with_partial_rejection() {
        let h = harness(false);
        h.queue.enqueue_order(&order("t1")).unwrap();
        h.queue.enqueue_order(&order("t2")).unwrap();
        assert_eq!(h.queue.count_pending().unwrap(), 2);
        assert_eq!(h.orch.indicator().unwrap().state, IndicatorState::Offline);

        h.backend.reject("t2", MappingStatus::Error, "Table not found");
        h.monitor.set_online(true);
        let report = h.orch.full_sync().await.unwrap();

        assert_eq!(
            report.push.synced,
            vec![SyncedOrder {
                temp_id: "t1".into(),
                real_id: Some(501),
                order_number: Some(12),
            }]
        );
        assert_eq!(report.push.rejected[0].message, "Table not found");

        let counts = h.queue.queue_counts().unwrap();
        assert_eq!(counts.pending_orders, 0);
        assert_eq!(counts.error_orders, 1);

        let found = h.queue.find_by_order_number(12).unwrap().expect("synced order");
        assert_eq!(found.temp_id, "t1");

        let indicator = h.orch.indicator().unwrap();
        assert_eq!(indicator.state, IndicatorState::Error);
        assert_eq!(indicator.error_count, 1);
        assert_eq!(indicator.pending_count, 0);
        assert_eq!(indicator.message.as_deref(), Some("1 order needs attention"));
        assert_eq!(h.orch.status().status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_concurrent_full_syncs_push_once() {
        let h = harness(true);
        h.queue.enqueue_order(&order("t1")).unwrap();
        h.backend.set_push_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(h.orch.full_sync(), h.orch.full_sync());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(h.backend.push_calls(), 1);
        assert_eq!(h.backend.server_order_count(), 1);
    }

    #[tokio::test]
    async fn test_push_preserves_enqueue_order() {
        let h = harness(true);
        for id in ["a", "b", "c"] {
            h.queue.enqueue_order(&order(id)).unwrap();
        }
        h.orch.full_sync().await.unwrap();
        assert_eq!(h.backend.pushed_batches(), vec![vec!["a", "b", "c"]]);
    }

    #[tokio::test]
    async fn test_rejected_order_is_not_pushed_again() {
        let h = harness(true);
        h.queue.enqueue_order(&order("t1")).unwrap();
        h.backend.reject("t1", MappingStatus::Conflict, "");
        h.orch.full_sync().await.unwrap();

        let stored = h.queue.find_order("t1").unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some(CONFLICT_FALLBACK));
        assert_eq!(stored.rejection_kind, Some(MappingStatus::Conflict));

        h.queue.enqueue_order(&order("t2")).unwrap();
        h.orch.full_sync().await.unwrap();
        assert_eq!(
            h.backend.pushed_batches(),
            vec![vec!["t1".to_string()], vec!["t2".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_retry_after_lost_response_creates_one_server_order() {
        let h = harness(true);
        h.queue.enqueue_order(&order("t1")).unwrap();
        h.backend.lose_next_push_response();

        let err = h.orch.full_sync().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(h.orch.status().status, SyncStatus::Error);
        assert_eq!(
            h.queue.find_order("t1").unwrap().unwrap().status,
            QueueStatus::Pending
        );

        h.orch.full_sync().await.unwrap();
        assert_eq!(h.backend.push_calls(), 2);
        assert_eq!(h.backend.server_order_count(), 1);
        let stored = h.queue.find_order("t1").unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Synced);
        assert_eq!(stored.real_id, Some(501));
        assert_eq!(stored.push_attempts, 2);
    }

    #[tokio::test]
    async fn test_order_enqueued_mid_push_waits_for_next_cycle() {
        let h = harness(true);
        h.queue.enqueue_order(&order("t1")).unwrap();
        let late_queue = h.queue.clone();
        h.backend.on_push(move || {
            let _ = late_queue.enqueue_order(&order("late"));
        });

        let report = h.orch.full_sync().await.unwrap();
        assert_eq!(report.push.submitted_orders, 1);
        assert_eq!(
            h.queue.find_order("late").unwrap().unwrap().status,
            QueueStatus::Pending
        );

        h.orch.full_sync().await.unwrap();
        let batches = h.backend.pushed_batches();
        assert_eq!(batches[1], vec!["late".to_string()]);
        assert_eq!(
            h.queue.find_order("late").unwrap().unwrap().status,
            QueueStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_unmapped_order_stays_pending() {
        let h = harness(true);
        h.queue.enqueue_order(&order("t1")).unwrap();
        h.queue.enqueue_order(&order("t2")).unwrap();
        h.backend.leave_unmapped("t2");

        let report = h.orch.full_sync().await.unwrap();
        assert_eq!(report.push.unmapped, vec!["t2".to_string()]);
        assert_eq!(
            h.queue.find_order("t2").unwrap().unwrap().status,
            QueueStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_batch_rejection_leaves_queue_untouched() {
        let h = harness(true);
        h.queue.enqueue_order(&order("t1")).unwrap();
        h.backend.reject_batch("Shift is closed");

        let err = h.orch.full_sync().await.unwrap_err();
        assert!(matches!(&err, SyncError::BatchRejected(message) if message == "Shift is closed"));
        assert_eq!(err.to_string(), "Shift is closed");
        assert_eq!(h.queue.count_pending().unwrap(), 1);
        let status = h.orch.status();
        assert_eq!(status.status, SyncStatus::Error);
        assert_eq!(status.last_error.as_deref(), Some("Shift is closed"));
    }

    #[tokio::test]
    async fn test_payments_follow_their_order() {
        let h = harness(true);
        let paid = PendingPayment::new("t1", PaymentMethod::Card, 12.0);
        let doomed = PendingPayment::new("t2", PaymentMethod::Cash, 5.0);
        h.queue
            .enqueue_order_with_payments(&order("t1"), std::slice::from_ref(&paid))
            .unwrap();
        h.queue
            .enqueue_order_with_payments(&order("t2"), std::slice::from_ref(&doomed))
            .unwrap();
        h.backend.reject("t2", MappingStatus::Error, "Invalid product");

        let report = h.orch.full_sync().await.unwrap();
        assert_eq!(report.push.payments.synced, 1);
        assert_eq!(report.push.payments.errored, 1);
        assert_eq!(h.backend.server_payment_count(), 1);

        let batch = h.backend.last_batch().unwrap();
        assert_eq!(batch.pending_payments[0].payment_id, paid.payment_id);
        assert!(batch.client_id.starts_with("term-"));
        assert_eq!(h.queue.count_pending().unwrap(), 0);

        let indicator = h.orch.indicator().unwrap();
        assert_eq!(indicator.error_count, 2);
        assert_eq!(
            indicator.message.as_deref(),
            Some("1 order and 1 payment need attention")
        );
    }

    #[tokio::test]
    async fn test_offline_sync_is_a_no_op() {
        let h = harness(false);
        h.queue.enqueue_order(&order("t1")).unwrap();
        let report = h.orch.full_sync().await.unwrap();
        assert!(report.skipped_offline);
        assert_eq!(h.backend.push_calls(), 0);
        assert!(h.backend.pull_tokens().is_empty());
        assert_eq!(h.orch.status().status, SyncStatus::Idle);

        assert!(!h.orch.push().await.unwrap().attempted);
        assert!(!h.orch.pull().await.unwrap().attempted);
    }

    #[tokio::test]
    async fn test_pull_failure_keeps_queue() {
        let h = harness(true);
        h.queue.enqueue_order(&order("t1")).unwrap();
        h.backend.fail_next_pull(SyncError::TransportFailure("reset".into()));

        let err = h.orch.pull().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(h.queue.count_pending().unwrap(), 1);
        assert_eq!(h.orch.status().status, SyncStatus::Error);
        assert!(h.queue.load_sync_snapshot().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_replaces_snapshot_and_forwards_token() {
        let h = harness(true);
        h.orch.full_sync().await.unwrap();
        h.orch.full_sync().await.unwrap();

        assert_eq!(h.backend.pull_tokens(), vec![None, Some("tok-1".to_string())]);
        let snapshot = h.queue.load_sync_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.sync_token, "tok-2");
        assert_eq!(snapshot.products.len(), 1);
    }

    #[tokio::test]
    async fn test_listeners_observe_transitions_until_dropped() {
        let h = harness(true);
        let seen: Arc<Mutex<Vec<SyncStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = h.orch.subscribe(move |event| {
            sink.lock().unwrap().push(event.status);
        });

        h.queue.enqueue_order(&order("t1")).unwrap();
        h.backend.fail_next_push(SyncError::TransportFailure("down".into()));
        assert!(h.orch.full_sync().await.is_err());
        h.orch.full_sync().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SyncStatus::Pushing,
                SyncStatus::Error,
                SyncStatus::Idle,
                SyncStatus::Pushing,
                SyncStatus::Pulling,
                SyncStatus::Synced,
            ]
        );

        assert_eq!(h.orch.state().listener_count(), 1);
        drop(subscription);
        assert_eq!(h.orch.state().listener_count(), 0);

        h.orch.full_sync().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_explicit_unsubscribe_by_id() {
        let state = SyncStateContext::new();
        let subscription = state.subscribe(|_| {});
        let id = subscription.id();
        assert!(state.unsubscribe(id));
        assert!(!state.unsubscribe(id));
        subscription.unsubscribe();
        assert_eq!(state.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_loop_runs_once_per_reconnect() {
        let h = harness(false);
        h.queue.enqueue_order(&order("t1")).unwrap();
        let cancel = CancellationToken::new();
        let handle = start_sync_loop(h.orch.clone(), None, cancel.clone());

        h.monitor.set_online(true);
        let backend = h.backend.clone();
        eventually("first reconnect sync", || backend.pull_tokens().len() == 1).await;
        assert_eq!(h.backend.push_calls(), 1);

        // Redundant online signal is not a transition.
        h.monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.backend.pull_tokens().len(), 1);

        h.monitor.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.monitor.set_online(true);
        let backend = h.backend.clone();
        eventually("second reconnect sync", || backend.pull_tokens().len() == 2).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_loop_interval_drains_pending_work() {
        let h = harness(true);
        let cancel = CancellationToken::new();
        let handle = start_sync_loop(
            h.orch.clone(),
            Some(Duration::from_millis(20)),
            cancel.clone(),
        );
        let backend = h.backend.clone();
        eventually("startup sync", || backend.pull_tokens().len() == 1).await;

        h.queue.enqueue_order(&order("t1")).unwrap();
        let queue = h.queue.clone();
        eventually("interval push", || queue.count_pending().unwrap() == 0).await;
        assert_eq!(h.backend.push_calls(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_loop_purges_synced_orders_past_retention() {
        let mut h = harness(false);
        h.orch = Arc::new(
            SyncOrchestrator::new(
                h.queue.clone(),
                h.backend.clone(),
                h.monitor.clone(),
                SyncStateContext::new(),
            )
            .with_synced_retention(Some(Duration::ZERO)),
        );
        h.queue.enqueue_order(&order("t1")).unwrap();
        let cancel = CancellationToken::new();
        let handle = start_sync_loop(h.orch.clone(), None, cancel.clone());

        h.monitor.set_online(true);
        let backend = h.backend.clone();
        eventually("first reconnect sync", || backend.pull_tokens().len() == 1).await;

        // synced_at has millisecond precision; a later cycle is past the cutoff.
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.monitor.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.monitor.set_online(true);
        let queue = h.queue.clone();
        eventually("synced order purged", || queue.find_order("t1").unwrap().is_none()).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_orders_without_retention() {
        let h = harness(true);
        h.queue.enqueue_order(&order("t1")).unwrap();
        h.orch.full_sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(h.orch.purge_expired().unwrap(), 0);
        assert!(h.queue.find_order("t1").unwrap().is_some());
    }
}

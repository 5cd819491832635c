//! Scripted in-process backend shared by the unit tests.
//!
//! Behaves like a dashboard that honours tempId idempotency: pushing or
//! creating the same tempId twice returns the mapping it already assigned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::api::PosBackend;
use crate::error::SyncError;
use crate::models::{
    MappingStatus, OrderMapping, OrderRequest, PushRequest, PushResponse, ServerOrder, SyncIssue,
    SyncSnapshot,
};

type PushHook = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct ServerRecord {
    real_id: i64,
    order_number: i64,
}

#[derive(Default)]
struct ServerState {
    orders: HashMap<String, ServerRecord>,
    payments: HashSet<String>,
    next_real_id: i64,
    next_order_number: i64,
    pulls: usize,
}

pub(crate) struct FakeBackend {
    healthy: AtomicBool,
    push_calls: AtomicUsize,
    create_calls: AtomicUsize,
    state: Mutex<ServerState>,
    batches: Mutex<Vec<PushRequest>>,
    pull_tokens: Mutex<Vec<Option<String>>>,
    rejections: Mutex<HashMap<String, (MappingStatus, String)>>,
    unmapped: Mutex<HashSet<String>>,
    batch_rejection: Mutex<Option<String>>,
    push_failures: Mutex<VecDeque<SyncError>>,
    pull_failures: Mutex<VecDeque<SyncError>>,
    create_failures: Mutex<VecDeque<SyncError>>,
    lose_next_push_response: AtomicBool,
    lose_next_create_response: AtomicBool,
    push_delay: Mutex<Option<Duration>>,
    on_push: Mutex<Option<PushHook>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            push_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            state: Mutex::new(ServerState {
                next_real_id: 501,
                next_order_number: 12,
                ..ServerState::default()
            }),
            batches: Mutex::new(Vec::new()),
            pull_tokens: Mutex::new(Vec::new()),
            rejections: Mutex::new(HashMap::new()),
            unmapped: Mutex::new(HashSet::new()),
            batch_rejection: Mutex::new(None),
            push_failures: Mutex::new(VecDeque::new()),
            pull_failures: Mutex::new(VecDeque::new()),
            create_failures: Mutex::new(VecDeque::new()),
            lose_next_push_response: AtomicBool::new(false),
            lose_next_create_response: AtomicBool::new(false),
            push_delay: Mutex::new(None),
            on_push: Mutex::new(None),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn reject(&self, temp_id: &str, status: MappingStatus, message: &str) {
        self.rejections
            .lock()
            .unwrap()
            .insert(temp_id.to_string(), (status, message.to_string()));
    }

    pub fn leave_unmapped(&self, temp_id: &str) {
        self.unmapped.lock().unwrap().insert(temp_id.to_string());
    }

    pub fn reject_batch(&self, message: &str) {
        *self.batch_rejection.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_next_push(&self, err: SyncError) {
        self.push_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_pull(&self, err: SyncError) {
        self.pull_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_create(&self, err: SyncError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    /// Apply the next push server-side, then report a dropped connection.
    pub fn lose_next_push_response(&self) {
        self.lose_next_push_response.store(true, Ordering::SeqCst);
    }

    /// Create the next order server-side, then report a dropped connection.
    pub fn lose_next_create_response(&self) {
        self.lose_next_create_response.store(true, Ordering::SeqCst);
    }

    pub fn set_push_delay(&self, delay: Duration) {
        *self.push_delay.lock().unwrap() = Some(delay);
    }

    /// Run `hook` while a push is in flight, before the response is built.
    pub fn on_push(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_push.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Temp ids of every pushed batch, in submission order.
    pub fn pushed_batches(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.pending_orders.iter().map(|o| o.temp_id.clone()).collect())
            .collect()
    }

    pub fn last_batch(&self) -> Option<PushRequest> {
        self.batches.lock().unwrap().last().cloned()
    }

    pub fn pull_tokens(&self) -> Vec<Option<String>> {
        self.pull_tokens.lock().unwrap().clone()
    }

    pub fn server_order_count(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }

    pub fn server_payment_count(&self) -> usize {
        self.state.lock().unwrap().payments.len()
    }

    fn record_order(state: &mut ServerState, temp_id: &str) -> ServerRecord {
        if let Some(existing) = state.orders.get(temp_id) {
            return *existing;
        }
        let record = ServerRecord {
            real_id: state.next_real_id,
            order_number: state.next_order_number,
        };
        state.next_real_id += 1;
        state.next_order_number += 1;
        state.orders.insert(temp_id.to_string(), record);
        record
    }
}

#[async_trait]
impl PosBackend for FakeBackend {
    async fn pull(&self, sync_token: Option<&str>) -> Result<SyncSnapshot, SyncError> {
        self.pull_tokens
            .lock()
            .unwrap()
            .push(sync_token.map(str::to_string));
        if let Some(err) = self.pull_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        state.pulls += 1;
        Ok(SyncSnapshot {
            products: vec![json!({"id": 1, "name": "Espresso"})],
            categories: vec![json!({"id": 1, "name": "Coffee"})],
            printer_routing: vec![json!({"categoryId": 1, "printer": "bar"})],
            server_time: Utc::now(),
            sync_token: format!("tok-{}", state.pulls),
        })
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(request.clone());

        let delay = *self.push_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(hook) = self.on_push.lock().unwrap().as_ref() {
            hook();
        }
        if let Some(err) = self.push_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(message) = self.batch_rejection.lock().unwrap().take() {
            return Ok(PushResponse {
                success: false,
                order_mappings: vec![],
                errors: vec![SyncIssue {
                    temp_id: None,
                    code: "BATCH_REJECTED".into(),
                    message,
                }],
                warnings: vec![],
                synced_at: None,
            });
        }

        let rejections = self.rejections.lock().unwrap().clone();
        let unmapped = self.unmapped.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        let mut mappings = Vec::new();
        let mut errors = Vec::new();
        for order in &request.pending_orders {
            if unmapped.contains(&order.temp_id) {
                continue;
            }
            if let Some((status, message)) = rejections.get(&order.temp_id) {
                mappings.push(OrderMapping {
                    temp_id: order.temp_id.clone(),
                    real_id: None,
                    order_number: None,
                    status: *status,
                });
                errors.push(SyncIssue {
                    temp_id: Some(order.temp_id.clone()),
                    code: status.as_str().to_string(),
                    message: message.clone(),
                });
                continue;
            }
            let record = Self::record_order(&mut state, &order.temp_id);
            mappings.push(OrderMapping {
                temp_id: order.temp_id.clone(),
                real_id: Some(record.real_id),
                order_number: Some(record.order_number),
                status: MappingStatus::Synced,
            });
        }
        for payment in &request.pending_payments {
            if state.orders.contains_key(&payment.temp_order_id) {
                state.payments.insert(payment.payment_id.clone());
            }
        }
        drop(state);

        if self.lose_next_push_response.swap(false, Ordering::SeqCst) {
            return Err(SyncError::TransportFailure("connection reset".into()));
        }

        Ok(PushResponse {
            success: true,
            order_mappings: mappings,
            errors,
            warnings: vec![],
            synced_at: Some(Utc::now()),
        })
    }

    async fn create_order(
        &self,
        temp_id: &str,
        order: &OrderRequest,
    ) -> Result<ServerOrder, SyncError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let record = {
            let mut state = self.state.lock().unwrap();
            Self::record_order(&mut state, temp_id)
        };
        if self.lose_next_create_response.swap(false, Ordering::SeqCst) {
            return Err(SyncError::TransportFailure("connection reset".into()));
        }
        let total: f64 = order.payments.iter().map(|p| p.amount).sum();
        Ok(ServerOrder {
            id: record.real_id,
            order_number: Some(record.order_number),
            subtotal: total,
            total,
            status: Some("PENDING".into()),
        })
    }

    async fn health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

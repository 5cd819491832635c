//! Order intake: create orders directly when the dashboard answers, queue
//! them when it cannot be reached.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::api::PosBackend;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::models::{OrderRequest, PaymentRequest, PendingOrder, PendingPayment, ServerOrder};
use crate::queue::LocalQueue;

/// Sentinel id carried by orders that only exist in the local queue.
pub const OFFLINE_ORDER_ID: i64 = -1;

/// What the till renders right after taking an order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub id: i64,
    pub temp_id: String,
    pub order_number: Option<i64>,
    pub subtotal: f64,
    pub total: f64,
    pub status: String,
    pub is_offline: bool,
}

impl CreatedOrder {
    fn from_server(temp_id: String, order: ServerOrder) -> Self {
        Self {
            id: order.id,
            temp_id,
            order_number: order.order_number,
            subtotal: order.subtotal,
            total: order.total,
            status: order.status.unwrap_or_else(|| "PENDING".to_string()),
            is_offline: false,
        }
    }

    /// Placeholder for a queued order: sentinel id, zero totals.
    fn offline(temp_id: String) -> Self {
        Self {
            id: OFFLINE_ORDER_ID,
            temp_id,
            order_number: None,
            subtotal: 0.0,
            total: 0.0,
            status: "PENDING_SYNC".to_string(),
            is_offline: true,
        }
    }
}

pub struct OrderIntake {
    queue: LocalQueue,
    backend: Arc<dyn PosBackend>,
    connectivity: ConnectivityMonitor,
}

impl OrderIntake {
    pub fn new(
        queue: LocalQueue,
        backend: Arc<dyn PosBackend>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self {
            queue,
            backend,
            connectivity,
        }
    }

    /// Create an order.
    ///
    /// Online, the order goes straight to the dashboard. If that request
    /// never got an answer the order is queued instead; if the dashboard
    /// refused it, the refusal is returned and nothing is queued. The temp id
    /// is fixed before the direct call so a create whose response was lost
    /// and that later gets pushed is recognised server-side.
    pub async fn create(&self, request: OrderRequest) -> Result<CreatedOrder, SyncError> {
        let temp_id = LocalQueue::generate_temp_id();

        if self.connectivity.is_online() {
            match self.backend.create_order(&temp_id, &request).await {
                Ok(order) => {
                    info!(
                        temp_id = %temp_id,
                        order_id = order.id,
                        "Order created on admin dashboard"
                    );
                    return Ok(CreatedOrder::from_server(temp_id, order));
                }
                Err(err) if err.is_transport() => {
                    warn!(
                        temp_id = %temp_id,
                        error = %err,
                        "Direct order create failed; queueing offline"
                    );
                }
                Err(err) => {
                    warn!(temp_id = %temp_id, error = %err, "Order rejected by admin dashboard");
                    return Err(err);
                }
            }
        }

        self.enqueue(temp_id, &request)
    }

    fn enqueue(&self, temp_id: String, request: &OrderRequest) -> Result<CreatedOrder, SyncError> {
        let mut order = PendingOrder::new(
            temp_id.clone(),
            request.items.clone(),
            request.channel,
            request.shift_id,
        );
        order.table_id = request.table_id;
        order.customer_id = request.customer_id;

        let payments: Vec<PendingPayment> = request
            .payments
            .iter()
            .map(|p| pending_payment(&temp_id, p))
            .collect();

        self.queue.enqueue_order_with_payments(&order, &payments)?;
        Ok(CreatedOrder::offline(temp_id))
    }

    /// Attach a payment to an order still known only by its temp id.
    pub fn add_payment(
        &self,
        temp_order_id: &str,
        payment: &PaymentRequest,
    ) -> Result<PendingPayment, SyncError> {
        let pending = pending_payment(temp_order_id, payment);
        self.queue.enqueue_payment(&pending)?;
        Ok(pending)
    }
}

fn pending_payment(temp_order_id: &str, request: &PaymentRequest) -> PendingPayment {
    let payment = PendingPayment::new(temp_order_id, request.method, request.amount);
    match request.tendered {
        Some(tendered) => payment.with_tendered(tendered),
        None => payment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{OrderItem, PaymentMethod, QueueStatus, SalesChannel};
    use crate::sync::{SyncOrchestrator, SyncStateContext};
    use crate::testing::FakeBackend;

    fn setup(online: bool) -> (OrderIntake, Arc<FakeBackend>, LocalQueue, ConnectivityMonitor) {
        let queue = LocalQueue::new(Arc::new(db::init_in_memory().unwrap()));
        let backend = Arc::new(FakeBackend::new());
        let monitor = ConnectivityMonitor::new(online);
        let intake = OrderIntake::new(queue.clone(), backend.clone(), monitor.clone());
        (intake, backend, queue, monitor)
    }

    fn request() -> OrderRequest {
        OrderRequest {
            items: vec![OrderItem {
                product_id: 8,
                quantity: 2,
                notes: Some("extra hot".into()),
                modifiers: vec![],
                removed_ingredients: vec![],
            }],
            channel: SalesChannel::DineIn,
            table_id: Some(4),
            customer_id: None,
            shift_id: 2,
            payments: vec![PaymentRequest {
                method: PaymentMethod::Cash,
                amount: 17.5,
                tendered: Some(20.0),
            }],
        }
    }

    #[tokio::test]
    async fn test_online_create_goes_direct() {
        let (intake, backend, queue, _) = setup(true);
        let created = intake.create(request()).await.unwrap();
        assert!(!created.is_offline);
        assert_eq!(created.id, 501);
        assert_eq!(created.order_number, Some(12));
        assert_eq!(backend.create_calls(), 1);
        assert_eq!(queue.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_create_queues_placeholder() {
        let (intake, backend, queue, _) = setup(false);
        let created = intake.create(request()).await.unwrap();

        assert!(created.is_offline);
        assert_eq!(created.id, OFFLINE_ORDER_ID);
        assert_eq!(created.total, 0.0);
        assert_eq!(backend.create_calls(), 0);

        let stored = queue.find_order(&created.temp_id).unwrap().expect("queued");
        assert_eq!(stored.table_id, Some(4));
        assert_eq!(stored.status, QueueStatus::Pending);

        let payments = queue.list_payments_for_order(&created.temp_id).unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, 17.5);
        assert_eq!(payments[0].tendered, Some(20.0));
        assert_eq!(payments[0].change_given, Some(2.5));
    }

    #[tokio::test]
    async fn test_transport_failure_falls_back_to_queue() {
        let (intake, backend, queue, _) = setup(true);
        backend.fail_next_create(SyncError::TransportFailure("connection refused".into()));

        let created = intake.create(request()).await.unwrap();
        assert!(created.is_offline);
        assert_eq!(queue.queue_counts().unwrap().pending_orders, 1);
        assert_eq!(queue.queue_counts().unwrap().pending_payments, 1);
    }

    #[tokio::test]
    async fn test_rejection_is_surfaced_and_not_queued() {
        let (intake, backend, queue, _) = setup(true);
        backend.fail_next_create(SyncError::rejection(422, "Invalid product id"));

        let err = intake.create(request()).await.unwrap_err();
        assert!(matches!(err, SyncError::ApplicationRejection { status: 422, .. }));
        assert_eq!(err.user_message(), "Invalid product id");
        assert_eq!(queue.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lost_create_response_is_not_duplicated_by_push() {
        let (intake, backend, queue, monitor) = setup(true);
        backend.lose_next_create_response();

        let created = intake.create(request()).await.unwrap();
        assert!(created.is_offline);
        assert_eq!(backend.server_order_count(), 1);

        let orch = SyncOrchestrator::new(
            queue.clone(),
            backend.clone(),
            monitor,
            SyncStateContext::new(),
        );
        orch.full_sync().await.unwrap();

        assert_eq!(backend.server_order_count(), 1);
        let stored = queue.find_order(&created.temp_id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Synced);
        assert_eq!(stored.real_id, Some(501));
    }

    #[tokio::test]
    async fn test_add_payment_requires_queued_order() {
        let (intake, _, queue, _) = setup(false);
        let payment = PaymentRequest {
            method: PaymentMethod::Card,
            amount: 9.0,
            tendered: None,
        };
        assert!(matches!(
            intake.add_payment("tmp-missing", &payment),
            Err(SyncError::UnknownOrder(_))
        ));

        let created = intake.create(request()).await.unwrap();
        let added = intake.add_payment(&created.temp_id, &payment).unwrap();
        assert_eq!(added.temp_order_id, created.temp_id);
        assert_eq!(added.change_given, None);
        assert_eq!(queue.list_pending_payments().unwrap().len(), 2);
    }
}

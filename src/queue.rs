//! Local persistent queue of orders and payments not yet confirmed by the
//! server, plus the cached reference-data snapshot.
//!
//! The queue is the single source of truth for offline state: the
//! orchestrator never keeps its own copy, it reads and writes through here.
//! Every mutation is a committed sqlite transaction before the call returns.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::SyncError;
use crate::models::{
    MappingStatus, OrderItem, PaymentMethod, PendingOrder, PendingPayment, QueueCounts,
    QueueStatus, SalesChannel, SyncSnapshot, SyncedOrder,
};

const SETTINGS_CATEGORY: &str = "sync";
const CLIENT_ID_KEY: &str = "client_id";

const ORDER_COLUMNS: &str = "temp_id, items, channel, table_id, customer_id, created_at, shift_id,
     status, error_message, rejection_kind, real_id, order_number, push_attempts";

const PAYMENT_COLUMNS: &str = "payment_id, temp_order_id, method, amount, tendered, change_given,
     created_at, status, error_message";

/// Outcome of settling the payments of one push batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSettlement {
    pub synced: usize,
    pub errored: usize,
    pub still_pending: usize,
}

#[derive(Clone)]
pub struct LocalQueue {
    db: Arc<DbState>,
}

impl LocalQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        Ok(self.db.conn.lock()?)
    }

    /// Provisional order id: time-based prefix plus random suffix. Unique per
    /// terminal; never compared across terminals.
    pub fn generate_temp_id() -> String {
        let millis = Utc::now().timestamp_millis().max(0);
        let random = Uuid::new_v4().simple().to_string();
        format!("tmp-{millis:x}-{}", &random[..12])
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    pub fn enqueue_order(&self, order: &PendingOrder) -> Result<(), SyncError> {
        self.enqueue_order_with_payments(order, &[])
    }

    /// Persist an order and the payments captured with it in one transaction.
    /// Records always enter the queue as `pending`.
    pub fn enqueue_order_with_payments(
        &self,
        order: &PendingOrder,
        payments: &[PendingPayment],
    ) -> Result<(), SyncError> {
        let items = serde_json::to_string(&order.items)
            .map_err(|e| SyncError::storage(format!("serialize order items: {e}")))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO pending_orders (
                 temp_id, items, channel, table_id, customer_id, shift_id, created_at, status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
            params![
                order.temp_id,
                items,
                order.channel.as_str(),
                order.table_id,
                order.customer_id,
                order.shift_id,
                format_ts(&order.created_at),
            ],
        )?;
        for payment in payments {
            insert_payment(&tx, payment)?;
        }
        tx.commit()?;

        info!(
            temp_id = %order.temp_id,
            items = order.items.len(),
            payments = payments.len(),
            "Order queued for sync"
        );
        Ok(())
    }

    /// Queue a payment against an order that is already in the queue.
    pub fn enqueue_payment(&self, payment: &PendingPayment) -> Result<(), SyncError> {
        let conn = self.conn()?;
        let known: Option<i64> = conn
            .query_row(
                "SELECT seq FROM pending_orders WHERE temp_id = ?1",
                params![payment.temp_order_id],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(SyncError::UnknownOrder(payment.temp_order_id.clone()));
        }
        insert_payment(&conn, payment)?;

        info!(
            payment_id = %payment.payment_id,
            temp_order_id = %payment.temp_order_id,
            method = payment.method.as_str(),
            amount = payment.amount,
            "Payment queued for sync"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Orders still `pending`, oldest first.
    pub fn list_pending_orders(&self) -> Result<Vec<PendingOrder>, SyncError> {
        self.query_orders("WHERE status = 'pending' ORDER BY seq ASC", params![])
    }

    /// Payments still `pending`, oldest first.
    pub fn list_pending_payments(&self) -> Result<Vec<PendingPayment>, SyncError> {
        self.query_payments("WHERE status = 'pending' ORDER BY seq ASC", params![])
    }

    /// Orders the server rejected; they wait for a human.
    pub fn list_error_orders(&self) -> Result<Vec<PendingOrder>, SyncError> {
        self.query_orders("WHERE status = 'error' ORDER BY seq ASC", params![])
    }

    pub fn list_payments_for_order(
        &self,
        temp_order_id: &str,
    ) -> Result<Vec<PendingPayment>, SyncError> {
        self.query_payments(
            "WHERE temp_order_id = ?1 ORDER BY seq ASC",
            params![temp_order_id],
        )
    }

    pub fn find_order(&self, temp_id: &str) -> Result<Option<PendingOrder>, SyncError> {
        Ok(self
            .query_orders("WHERE temp_id = ?1", params![temp_id])?
            .into_iter()
            .next())
    }

    /// Look up a synced order by the number the server assigned.
    pub fn find_by_order_number(
        &self,
        order_number: i64,
    ) -> Result<Option<PendingOrder>, SyncError> {
        Ok(self
            .query_orders(
                "WHERE order_number = ?1 AND status = 'synced' ORDER BY seq DESC",
                params![order_number],
            )?
            .into_iter()
            .next())
    }

    /// Number of records still waiting to be pushed (badge count).
    pub fn count_pending(&self) -> Result<i64, SyncError> {
        Ok(self.queue_counts()?.total_pending())
    }

    pub fn queue_counts(&self) -> Result<QueueCounts, SyncError> {
        let conn = self.conn()?;
        let count = |table: &str, status: &str| -> Result<i64, SyncError> {
            let query = format!("SELECT COUNT(*) FROM {table} WHERE status = ?1");
            Ok(conn.query_row(&query, params![status], |row| row.get(0))?)
        };
        Ok(QueueCounts {
            pending_orders: count("pending_orders", "pending")?,
            pending_payments: count("pending_payments", "pending")?,
            error_orders: count("pending_orders", "error")?,
            error_payments: count("pending_payments", "error")?,
        })
    }

    fn query_orders(
        &self,
        clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<PendingOrder>, SyncError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM pending_orders {clause}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, OrderRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(OrderRow::into_order).collect()
    }

    fn query_payments(
        &self,
        clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<PendingPayment>, SyncError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM pending_payments {clause}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, PaymentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(PaymentRow::into_payment).collect()
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Move orders to `synced` and record the server's id and number.
    /// Re-marking an already synced order is a no-op. Returns rows changed.
    pub fn mark_orders_synced(&self, synced: &[SyncedOrder]) -> Result<usize, SyncError> {
        if synced.is_empty() {
            return Ok(0);
        }
        let now = format_ts(&Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        for order in synced {
            changed += tx.execute(
                "UPDATE pending_orders
                 SET status = 'synced', real_id = ?2, order_number = ?3,
                     error_message = NULL, rejection_kind = NULL,
                     synced_at = ?4, updated_at = datetime('now')
                 WHERE temp_id = ?1 AND status <> 'synced'",
                params![order.temp_id, order.real_id, order.order_number, now],
            )?;
        }
        tx.commit()?;
        debug!(requested = synced.len(), changed, "Marked orders synced");
        Ok(changed)
    }

    /// Move an order to `error`. Errored orders are not retried by later
    /// pushes; they stay visible until someone retries or discards them.
    pub fn mark_order_error(&self, temp_id: &str, message: &str) -> Result<bool, SyncError> {
        self.mark_order_rejected(temp_id, MappingStatus::Error, message)
    }

    /// Like [`Self::mark_order_error`] but keeps whether the server said
    /// CONFLICT or ERROR.
    pub fn mark_order_rejected(
        &self,
        temp_id: &str,
        kind: MappingStatus,
        message: &str,
    ) -> Result<bool, SyncError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE pending_orders
             SET status = 'error', error_message = ?2, rejection_kind = ?3,
                 updated_at = datetime('now')
             WHERE temp_id = ?1 AND status <> 'synced'",
            params![temp_id, message, kind.as_str()],
        )?;
        if changed > 0 {
            warn!(temp_id, kind = kind.as_str(), message, "Order rejected by server");
        }
        Ok(changed > 0)
    }

    /// Settle the payments submitted in one push according to where their
    /// order ended up. Payments for orders the queue does not know follow the
    /// batch verdict.
    pub fn settle_payments(
        &self,
        payment_ids: &[String],
        batch_accepted: bool,
    ) -> Result<PaymentSettlement, SyncError> {
        let mut settlement = PaymentSettlement::default();
        if payment_ids.is_empty() {
            return Ok(settlement);
        }
        let now = format_ts(&Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for payment_id in payment_ids {
            let order_state: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT o.status, o.error_message
                     FROM pending_payments p
                     LEFT JOIN pending_orders o ON o.temp_id = p.temp_order_id
                     WHERE p.payment_id = ?1 AND p.status = 'pending'",
                    params![payment_id],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                            row.get(1)?,
                        ))
                    },
                )
                .optional()?;
            let Some((order_status, order_error)) = order_state else {
                continue;
            };

            match QueueStatus::parse(&order_status) {
                Some(QueueStatus::Synced) => {
                    tx.execute(
                        "UPDATE pending_payments
                         SET status = 'synced', synced_at = ?2, updated_at = datetime('now')
                         WHERE payment_id = ?1",
                        params![payment_id, now],
                    )?;
                    settlement.synced += 1;
                }
                Some(QueueStatus::Error) => {
                    let message = format!(
                        "Order rejected: {}",
                        order_error.as_deref().unwrap_or("see order")
                    );
                    tx.execute(
                        "UPDATE pending_payments
                         SET status = 'error', error_message = ?2, updated_at = datetime('now')
                         WHERE payment_id = ?1",
                        params![payment_id, message],
                    )?;
                    settlement.errored += 1;
                }
                Some(QueueStatus::Pending) => settlement.still_pending += 1,
                None if batch_accepted => {
                    tx.execute(
                        "UPDATE pending_payments
                         SET status = 'synced', synced_at = ?2, updated_at = datetime('now')
                         WHERE payment_id = ?1",
                        params![payment_id, now],
                    )?;
                    settlement.synced += 1;
                }
                None => settlement.still_pending += 1,
            }
        }
        tx.commit()?;
        Ok(settlement)
    }

    /// Bump the attempt counter of every order in a submitted batch.
    pub fn record_push_attempt(&self, temp_ids: &[String]) -> Result<(), SyncError> {
        if temp_ids.is_empty() {
            return Ok(());
        }
        let now = format_ts(&Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for temp_id in temp_ids {
            tx.execute(
                "UPDATE pending_orders
                 SET push_attempts = push_attempts + 1, last_attempt_at = ?2
                 WHERE temp_id = ?1",
                params![temp_id, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Put a rejected order (and its rejected payments) back in line after a
    /// human fixed whatever the server complained about.
    pub fn retry_error_order(&self, temp_id: &str) -> Result<(), SyncError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE pending_orders
             SET status = 'pending', error_message = NULL, rejection_kind = NULL,
                 updated_at = datetime('now')
             WHERE temp_id = ?1 AND status = 'error'",
            params![temp_id],
        )?;
        if changed == 0 {
            return Err(SyncError::UnknownOrder(temp_id.to_string()));
        }
        tx.execute(
            "UPDATE pending_payments
             SET status = 'pending', error_message = NULL, updated_at = datetime('now')
             WHERE temp_order_id = ?1 AND status = 'error'",
            params![temp_id],
        )?;
        tx.commit()?;
        info!(temp_id, "Rejected order re-queued by operator");
        Ok(())
    }

    /// Drop a rejected order and its payments from the queue.
    pub fn discard_error_order(&self, temp_id: &str) -> Result<(), SyncError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM pending_orders WHERE temp_id = ?1 AND status = 'error'",
            params![temp_id],
        )?;
        if removed == 0 {
            return Err(SyncError::UnknownOrder(temp_id.to_string()));
        }
        info!(temp_id, "Rejected order discarded by operator");
        Ok(())
    }

    /// Delete synced orders (and their payments) synced before `cutoff`,
    /// keeping any order that still has an unsettled payment.
    pub fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize, SyncError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM pending_orders
             WHERE status = 'synced'
               AND synced_at IS NOT NULL
               AND synced_at < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM pending_payments p
                   WHERE p.temp_order_id = pending_orders.temp_id
                     AND p.status <> 'synced'
               )",
            params![format_ts(&cutoff)],
        )?;
        if removed > 0 {
            info!(removed, "Purged synced orders from queue");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Snapshot + terminal identity
    // -----------------------------------------------------------------------

    /// Replace the stored reference snapshot in one transaction.
    pub fn store_sync_snapshot(&self, snapshot: &SyncSnapshot) -> Result<(), SyncError> {
        let encode = |section: &Vec<Value>, name: &str| {
            serde_json::to_string(section)
                .map_err(|e| SyncError::storage(format!("serialize {name}: {e}")))
        };
        let products = encode(&snapshot.products, "products")?;
        let categories = encode(&snapshot.categories, "categories")?;
        let routing = encode(&snapshot.printer_routing, "printer_routing")?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sync_snapshot", [])?;
        tx.execute(
            "INSERT INTO sync_snapshot (
                 id, products, categories, printer_routing, server_time, sync_token, pulled_at
             ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                products,
                categories,
                routing,
                format_ts(&snapshot.server_time),
                snapshot.sync_token,
                format_ts(&Utc::now()),
            ],
        )?;
        tx.commit()?;

        debug!(
            products = snapshot.products.len(),
            categories = snapshot.categories.len(),
            printer_routing = snapshot.printer_routing.len(),
            "Reference snapshot replaced"
        );
        Ok(())
    }

    pub fn load_sync_snapshot(&self) -> Result<Option<SyncSnapshot>, SyncError> {
        let conn = self.conn()?;
        let row: Option<(String, String, String, String, String)> = conn
            .query_row(
                "SELECT products, categories, printer_routing, server_time, sync_token
                 FROM sync_snapshot WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((products, categories, routing, server_time, sync_token)) = row else {
            return Ok(None);
        };
        Ok(Some(SyncSnapshot {
            products: decode_json(&products, "products")?,
            categories: decode_json(&categories, "categories")?,
            printer_routing: decode_json(&routing, "printer_routing")?,
            server_time: parse_ts(&server_time)?,
            sync_token,
        }))
    }

    pub fn sync_token(&self) -> Result<Option<String>, SyncError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT sync_token FROM sync_snapshot WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn snapshot_pulled_at(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT pulled_at FROM sync_snapshot WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        raw.as_deref().map(parse_ts).transpose()
    }

    /// Terminal identifier sent with every push. Generated on first use and
    /// persisted so it never changes for this installation.
    pub fn client_id(&self) -> Result<String, SyncError> {
        let conn = self.conn()?;
        if let Some(existing) = db::get_setting(&conn, SETTINGS_CATEGORY, CLIENT_ID_KEY)
            .filter(|v| !v.trim().is_empty())
        {
            return Ok(existing);
        }
        let generated = format!("term-{}", Uuid::new_v4());
        db::set_setting(&conn, SETTINGS_CATEGORY, CLIENT_ID_KEY, &generated)?;
        info!(client_id = %generated, "Generated terminal sync client id");
        Ok(generated)
    }

    /// Most recent rejection messages, newest first (diagnostics).
    pub fn recent_errors(&self, limit: i64) -> Result<Vec<Value>, SyncError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT temp_id, rejection_kind, error_message, push_attempts, created_at, updated_at
             FROM pending_orders
             WHERE status = 'error'
             ORDER BY updated_at DESC, seq DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(serde_json::json!({
                    "tempId": row.get::<_, String>(0)?,
                    "kind": row.get::<_, Option<String>>(1)?,
                    "message": row.get::<_, Option<String>>(2)?,
                    "pushAttempts": row.get::<_, i64>(3)?,
                    "createdAt": row.get::<_, String>(4)?,
                    "updatedAt": row.get::<_, Option<String>>(5)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn insert_payment(conn: &Connection, payment: &PendingPayment) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO pending_payments (
             payment_id, temp_order_id, method, amount, tendered, change_given,
             created_at, status
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending')",
        params![
            payment.payment_id,
            payment.temp_order_id,
            payment.method.as_str(),
            payment.amount,
            payment.tendered,
            payment.change_given,
            format_ts(&payment.created_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::storage(format!("bad timestamp {raw:?}: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T, SyncError> {
    serde_json::from_str(raw).map_err(|e| SyncError::storage(format!("decode {what}: {e}")))
}

struct OrderRow {
    temp_id: String,
    items: String,
    channel: String,
    table_id: Option<i64>,
    customer_id: Option<i64>,
    created_at: String,
    shift_id: i64,
    status: String,
    error_message: Option<String>,
    rejection_kind: Option<String>,
    real_id: Option<i64>,
    order_number: Option<i64>,
    push_attempts: i64,
}

impl OrderRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            temp_id: row.get(0)?,
            items: row.get(1)?,
            channel: row.get(2)?,
            table_id: row.get(3)?,
            customer_id: row.get(4)?,
            created_at: row.get(5)?,
            shift_id: row.get(6)?,
            status: row.get(7)?,
            error_message: row.get(8)?,
            rejection_kind: row.get(9)?,
            real_id: row.get(10)?,
            order_number: row.get(11)?,
            push_attempts: row.get(12)?,
        })
    }

    fn into_order(self) -> Result<PendingOrder, SyncError> {
        let items: Vec<OrderItem> = decode_json(&self.items, "order items")?;
        let channel = SalesChannel::parse(&self.channel)
            .ok_or_else(|| SyncError::storage(format!("unknown channel {}", self.channel)))?;
        let status = QueueStatus::parse(&self.status)
            .ok_or_else(|| SyncError::storage(format!("unknown status {}", self.status)))?;
        Ok(PendingOrder {
            temp_id: self.temp_id,
            items,
            channel,
            table_id: self.table_id,
            customer_id: self.customer_id,
            created_at: parse_ts(&self.created_at)?,
            shift_id: self.shift_id,
            status,
            error_message: self.error_message,
            rejection_kind: self.rejection_kind.as_deref().and_then(MappingStatus::parse),
            real_id: self.real_id,
            order_number: self.order_number,
            push_attempts: self.push_attempts,
        })
    }
}

struct PaymentRow {
    payment_id: String,
    temp_order_id: String,
    method: String,
    amount: f64,
    tendered: Option<f64>,
    change_given: Option<f64>,
    created_at: String,
    status: String,
    error_message: Option<String>,
}

impl PaymentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            payment_id: row.get(0)?,
            temp_order_id: row.get(1)?,
            method: row.get(2)?,
            amount: row.get(3)?,
            tendered: row.get(4)?,
            change_given: row.get(5)?,
            created_at: row.get(6)?,
            status: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    fn into_payment(self) -> Result<PendingPayment, SyncError> {
        let method = PaymentMethod::parse(&self.method)
            .ok_or_else(|| SyncError::storage(format!("unknown payment method {}", self.method)))?;
        let status = QueueStatus::parse(&self.status)
            .ok_or_else(|| SyncError::storage(format!("unknown status {}", self.status)))?;
        Ok(PendingPayment {
            payment_id: self.payment_id,
            temp_order_id: self.temp_order_id,
            method,
            amount: self.amount,
            tendered: self.tendered,
            change_given: self.change_given,
            created_at: parse_ts(&self.created_at)?,
            status,
            error_message: self.error_message,
        })
    }
}

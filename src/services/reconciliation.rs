//! Checkout-completion reconciliation.
//!
//! Converts one authenticated "checkout session completed" notification into
//! exactly one persisted order with correctly priced line items and
//! decremented stock. Order creation, line items, stock decrements and the
//! price backfill run inside a single transaction: a failure anywhere rolls
//! back everything, so no partial order is ever visible.

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_line_item::{self, Entity as OrderLineItemEntity},
        product::{self, Entity as ProductEntity},
        shipping_method::Entity as ShippingMethodEntity,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    webhooks::event::{CartEntry, CheckoutSession},
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, Set, SqlErr, TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of reconciling one completed-session event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new order was materialized.
    Created { order_id: Uuid },
    /// An order for this session already exists; the delivery was a
    /// duplicate and nothing was mutated.
    AlreadyProcessed { order_id: Uuid },
}

/// Service reconciling completed checkout sessions into persisted orders.
#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<Arc<EventSender>>,
}

impl ReconciliationService {
    /// Creates a new reconciliation service instance
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self { db, event_sender }
    }

    /// Reconciles one completed checkout session.
    ///
    /// Idempotent per session id: redelivered events return
    /// `AlreadyProcessed` without touching the store. The pre-check below is
    /// an optimization; the real guarantee is the UNIQUE constraint on the
    /// session id column, which closes the window between concurrent
    /// deliveries of the same event.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub async fn reconcile_completed_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let db = &*self.db;

        if let Some(existing) = OrderEntity::find()
            .filter(order::Column::StripeSessionId.eq(session.id.as_str()))
            .one(db)
            .await?
        {
            info!(order_id = %existing.id, "session already reconciled; duplicate delivery ignored");
            counter!("atelier_reconciliation_duplicates_total", 1);
            self.emit(Event::DuplicateDeliveryIgnored {
                session_id: session.id.clone(),
                order_id: existing.id,
            })
            .await;
            return Ok(ReconcileOutcome::AlreadyProcessed {
                order_id: existing.id,
            });
        }

        // Both of these are terminal payload defects when absent; fail
        // before opening a transaction.
        let entries = session.cart_entries()?;
        let total = session.total_amount()?;

        let txn = db.begin().await?;

        let persisted = self.persist_order(&txn, session, &entries, total).await;

        let order_id = match persisted {
            Ok(order_id) => {
                txn.commit().await?;
                order_id
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(error = %rollback_err, "failed to roll back reconciliation transaction");
                }

                // A concurrent delivery of the same event won the insert
                // race; surface it as the same success no-op as the
                // pre-check path.
                if is_unique_violation(&err) {
                    if let Some(existing) = OrderEntity::find()
                        .filter(order::Column::StripeSessionId.eq(session.id.as_str()))
                        .one(db)
                        .await?
                    {
                        info!(order_id = %existing.id, "lost insert race to concurrent delivery; treating as duplicate");
                        counter!("atelier_reconciliation_duplicates_total", 1);
                        return Ok(ReconcileOutcome::AlreadyProcessed {
                            order_id: existing.id,
                        });
                    }
                }

                if let ServiceError::InsufficientStock {
                    product_id,
                    requested,
                    available,
                } = &err
                {
                    counter!("atelier_reconciliation_stock_shortfalls_total", 1);
                    self.emit(Event::StockShortfall {
                        session_id: session.id.clone(),
                        product_id: *product_id,
                        requested: *requested,
                        available: *available,
                    })
                    .await;
                }

                return Err(err);
            }
        };

        info!(order_id = %order_id, line_items = entries.len(), "order reconciled from completed session");
        counter!("atelier_reconciliation_orders_created_total", 1);

        self.emit(Event::OrderCreated(order_id)).await;
        self.emit(Event::CheckoutSessionReconciled {
            session_id: session.id.clone(),
            order_id,
        })
        .await;

        Ok(ReconcileOutcome::Created { order_id })
    }

    /// Runs the mutation sequence inside the caller's transaction: order row,
    /// line items, guarded stock decrements, then the authoritative price
    /// backfill.
    async fn persist_order<C: ConnectionTrait>(
        &self,
        txn: &C,
        session: &CheckoutSession,
        entries: &[CartEntry],
        total: Decimal,
    ) -> Result<Uuid, ServiceError> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        // The chosen method may have been deleted since checkout; an
        // unresolvable reference must not block the order.
        let shipping_method_id = match session.shipping_method_ref() {
            Some(id) => {
                let found = ShippingMethodEntity::find_by_id(id).one(txn).await?;
                if found.is_none() {
                    warn!(shipping_method_id = %id, "shipping method no longer exists; storing order without it");
                }
                found.map(|m| m.id)
            }
            None => None,
        };

        let address = session.shipping_address();

        order::ActiveModel {
            id: Set(order_id),
            stripe_session_id: Set(session.id.clone()),
            status: Set(OrderStatus::Paid),
            total_amount: Set(total),
            currency: Set(session
                .currency
                .clone()
                .unwrap_or_else(|| "eur".to_string())),
            customer_name: Set(session.customer_name()),
            customer_email: Set(session.customer_email()),
            shipping_line1: Set(address.and_then(|a| a.line1.clone())),
            shipping_line2: Set(address.and_then(|a| a.line2.clone())),
            shipping_city: Set(address.and_then(|a| a.city.clone())),
            shipping_postal_code: Set(address.and_then(|a| a.postal_code.clone())),
            shipping_country: Set(address.and_then(|a| a.country.clone())),
            shipping_method_id: Set(shipping_method_id),
            created_at: Set(now),
        }
        .insert(txn)
        .await?;

        // Line items are created with a zero price: the client-supplied cart
        // snapshot cannot be trusted for amounts any more than for totals.
        for entry in entries {
            order_line_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(entry.product_id),
                quantity: Set(entry.quantity),
                unit_price: Set(Decimal::ZERO),
                created_at: Set(now),
            }
            .insert(txn)
            .await?;

            self.decrement_stock(txn, entry).await?;
        }

        self.backfill_prices(txn, order_id).await?;

        Ok(order_id)
    }

    /// Atomically decrements stock, guarded against going negative.
    ///
    /// The condition lives in the UPDATE itself (`stock >= quantity`), not in
    /// application code, so concurrent decrements of the same product cannot
    /// interleave between a read and a write.
    async fn decrement_stock<C: ConnectionTrait>(
        &self,
        txn: &C,
        entry: &CartEntry,
    ) -> Result<(), ServiceError> {
        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(entry.quantity),
            )
            .filter(product::Column::Id.eq(entry.product_id))
            .filter(product::Column::Stock.gte(entry.quantity))
            .exec(txn)
            .await?;

        if result.rows_affected > 0 {
            return Ok(());
        }

        // Nothing matched: either the product is gone or there is not
        // enough stock left. Distinguish for the operator.
        match ProductEntity::find_by_id(entry.product_id).one(txn).await? {
            Some(prod) => {
                warn!(
                    product_id = %entry.product_id,
                    requested = entry.quantity,
                    available = prod.stock,
                    "insufficient stock at fulfillment time"
                );
                Err(ServiceError::InsufficientStock {
                    product_id: entry.product_id,
                    requested: entry.quantity,
                    available: prod.stock,
                })
            }
            None => Err(ServiceError::MalformedPayload(format!(
                "cart snapshot references unknown product {}",
                entry.product_id
            ))),
        }
    }

    /// Second pass: stamps every line item with the product's current
    /// catalog price. Runs inside the same transaction as creation, so a
    /// committed order never exposes an unpriced line item.
    async fn backfill_prices<C: ConnectionTrait>(
        &self,
        txn: &C,
        order_id: Uuid,
    ) -> Result<(), ServiceError> {
        let items = OrderLineItemEntity::find()
            .filter(order_line_item::Column::OrderId.eq(order_id))
            .all(txn)
            .await?;

        for item in items {
            let prod = ProductEntity::find_by_id(item.product_id)
                .one(txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::MalformedPayload(format!(
                        "cart snapshot references unknown product {}",
                        item.product_id
                    ))
                })?;

            let mut active: order_line_item::ActiveModel = item.into();
            active.unit_price = Set(prod.price);
            active.update(txn).await?;
        }

        Ok(())
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to send reconciliation event");
            }
        }
    }
}

fn is_unique_violation(err: &ServiceError) -> bool {
    match err {
        ServiceError::DatabaseError(db_err) => {
            matches!(db_err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        }
        _ => false,
    }
}

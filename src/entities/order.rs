use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order lifecycle status. Only `Paid` is reachable from webhook
/// reconciliation; the later fulfillment transitions belong to the
/// back-office order management surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum OrderStatus {
    #[sea_orm(string_value = "created")]
    Created,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// An order materialized from a completed payment session.
///
/// `stripe_session_id` is the natural idempotency key: the column is UNIQUE
/// so the same completed-session event can never produce two orders, even
/// under concurrent redelivery. Customer name, email and address are
/// denormalized snapshots taken from the session at reconciliation time,
/// not references to any account.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub stripe_session_id: String,

    pub status: OrderStatus,

    /// Amount actually charged, as reported by the payment provider.
    /// Never recomputed from cart data.
    pub total_amount: Decimal,
    pub currency: String,

    pub customer_name: String,
    pub customer_email: String,

    pub shipping_line1: Option<String>,
    pub shipping_line2: Option<String>,
    pub shipping_city: Option<String>,
    pub shipping_postal_code: Option<String>,
    pub shipping_country: Option<String>,

    /// Nullable: the method chosen at checkout may have been deleted by the
    /// time the webhook fires, which must not block order creation.
    pub shipping_method_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line_item::Entity")]
    OrderLineItems,
    #[sea_orm(
        belongs_to = "super::shipping_method::Entity",
        from = "Column::ShippingMethodId",
        to = "super::shipping_method::Column::Id"
    )]
    ShippingMethod,
}

impl Related<super::order_line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderLineItems.def()
    }
}

impl Related<super::shipping_method::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ShippingMethod.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;

        if insert {
            if let sea_orm::ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = sea_orm::Set(Utc::now());
            }
        }

        Ok(active_model)
    }
}

//! Database store for the auction settlement and payout engine.
//!
//! ## Design Decisions
//!
//! ### Conditional writes instead of read-then-write
//! - **Idempotent payouts**: `seller_payouts.order_id` is unique and payouts
//!   are inserted with `ON CONFLICT DO NOTHING`, so concurrent deliveries of
//!   the same order can never produce two payouts.
//! - **Guarded transitions**: every status change is an `UPDATE ... WHERE
//!   status = <expected>`; zero affected rows means another worker got there
//!   first and the caller backs off.
//! - **One open settlement order per auction**: a partial unique index on
//!   `orders(auction_id)` rejects a second non-cancelled order.
//!
//! ### Time Source Dependency
//! - Functions that need the current time accept a `TimeSource` so holds and
//!   payment deadlines can be driven deterministically in tests.
//!
//! ### Database Triggers
//! - `updated_at` columns are maintained by triggers.
//! - `seller_payouts` rejects backwards status transitions and
//!   `payout_safety_logs` rejects updates and deletes.

use jiff::Timestamp;
use jiff_sqlx::Timestamp as SqlxTs;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use payloads::{
    AuctionId, AuctionStatus, BidId, OptionalTimestamp, OrderId, OrderStatus,
    PaymentStatus, PayoutMethodId, SellerProfileId, UserId,
};

pub mod auction;
pub mod payout;
pub mod safety;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct SellerProfile {
    pub id: SellerProfileId,
    pub user_id: UserId,
    pub display_name: String,
    /// Legacy single payout method, used when no default method row exists.
    pub payout_method: Option<String>,
    pub payout_account_name: Option<String>,
    pub payout_account_number: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct SellerPayoutMethod {
    pub id: PayoutMethodId,
    pub seller_profile_id: SellerProfileId,
    pub method_type: String,
    pub channel_code: String,
    pub account_name: String,
    pub account_number: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Auction {
    pub id: AuctionId,
    pub seller_profile_id: SellerProfileId,
    pub title: String,
    pub status: AuctionStatus,
    #[sqlx(try_from = "SqlxTs")]
    pub start_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub end_at: Timestamp,
    pub reserve_price: Decimal,
    pub winner_user_id: Option<UserId>,
    pub winning_bid_id: Option<BidId>,
    pub settlement_order_id: Option<OrderId>,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub payment_due_at: Option<Timestamp>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct Bid {
    pub id: BidId,
    pub auction_id: AuctionId,
    pub user_id: UserId,
    pub amount: Decimal,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub seller_profile_id: Option<SellerProfileId>,
    pub auction_id: Option<AuctionId>,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_link_id: Option<String>,
    pub payment_link_url: Option<String>,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub cancelled_at: Option<Timestamp>,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub delivered_at: Option<Timestamp>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

/// Where a seller's money is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutDestination {
    /// Short method label stored on payouts, e.g. `bank_transfer`.
    pub method: String,
    pub channel_code: Option<String>,
    pub account_name: Option<String>,
    pub account_number: Option<String>,
}

pub async fn get_order(
    order_id: &OrderId,
    pool: &PgPool,
) -> Result<Order, StoreError> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::OrderNotFound)
}

pub(crate) async fn get_order_tx(
    order_id: &OrderId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Order, StoreError> {
    sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::OrderNotFound)
}

pub async fn get_user(
    user_id: &UserId,
    pool: &PgPool,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::UserNotFound)
}

pub async fn get_seller_profile(
    seller_profile_id: &SellerProfileId,
    pool: &PgPool,
) -> Result<SellerProfile, StoreError> {
    sqlx::query_as::<_, SellerProfile>(
        "SELECT * FROM seller_profiles WHERE id = $1",
    )
    .bind(seller_profile_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::SellerProfileNotFound)
}

/// Resolve where a seller is paid: their default payout method row, falling
/// back to the legacy single-method profile fields.
#[tracing::instrument(skip(pool))]
pub async fn resolve_payout_destination(
    seller_profile_id: &SellerProfileId,
    pool: &PgPool,
) -> Result<Option<PayoutDestination>, StoreError> {
    let default_method = sqlx::query_as::<_, SellerPayoutMethod>(
        "SELECT * FROM seller_payout_methods
        WHERE seller_profile_id = $1 AND is_default
        LIMIT 1",
    )
    .bind(seller_profile_id)
    .fetch_optional(pool)
    .await?;

    if let Some(method) = default_method {
        return Ok(Some(PayoutDestination {
            method: method.method_type,
            channel_code: Some(method.channel_code),
            account_name: Some(method.account_name),
            account_number: Some(method.account_number),
        }));
    }

    let profile = get_seller_profile(seller_profile_id, pool).await?;
    Ok(profile
        .payout_method
        .filter(|m| !m.trim().is_empty())
        .map(|method| PayoutDestination {
            method,
            channel_code: None,
            account_name: profile.payout_account_name,
            account_number: profile.payout_account_number,
        }))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Order not found")]
    OrderNotFound,
    #[error("Order has no seller profile")]
    MissingSellerProfile,
    #[error("Seller profile not found")]
    SellerProfileNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("Auction not found")]
    AuctionNotFound,
    #[error("Auction cannot move from {from} to {to}")]
    InvalidAuctionTransition {
        from: AuctionStatus,
        to: AuctionStatus,
    },
    #[error("Order cannot be marked delivered from status {0}")]
    InvalidOrderTransition(OrderStatus),
    #[error("No payout method configured. Add a payout method first.")]
    NoPaymentMethod,
    #[error("No funds available for withdrawal")]
    NoFundsAvailable,
    #[error("No pending payouts available for instant payout")]
    NoPendingPayouts,
    #[error("Minimum payout amount is {minimum}; available amount is {amount}")]
    BelowMinimum { amount: Decimal, minimum: Decimal },
    #[error("Payout gateway rejected the request: {0}")]
    GatewayError(String),
    #[error("{0} timed out")]
    ExternalTimeout(String),
    #[error("Payouts changed while the withdrawal was in progress")]
    PayoutConflict,
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e
            && db_err.is_unique_violation()
        {
            return StoreError::NotUnique(e);
        }
        StoreError::Database(e)
    }
}

use crate::{
    OrderId, PayoutId, PayoutMode, PayoutStatus, PayoutType, SellerProfileId,
};
use jiff::Timestamp;
#[cfg(feature = "use-sqlx")]
use jiff_sqlx::Timestamp as SqlxTs;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[cfg(feature = "use-sqlx")]
use crate::OptionalTimestamp;

/// A seller payout row as it is stored and returned to sellers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::FromRow))]
pub struct SellerPayout {
    pub id: PayoutId,
    pub seller_profile_id: SellerProfileId,
    pub order_id: OrderId,
    /// Gross order amount.
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub net_amount: Decimal,
    pub status: PayoutStatus,
    pub payout_type: PayoutType,
    /// Earliest time the payout may move from pending to ready.
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub ready_date: Timestamp,
    pub payout_method: Option<String>,
    pub instant_fee: Option<Decimal>,
    pub payout_reference: Option<String>,
    pub notes: Option<String>,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "OptionalTimestamp"))]
    pub paid_at: Option<Timestamp>,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "use-sqlx", sqlx(try_from = "SqlxTs"))]
    pub updated_at: Timestamp,
}

/// Amounts are fixed two-decimal strings so clients never see float noise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerBalance {
    pub available: String,
    pub pending: String,
    pub total_paid: String,
    pub ready_count: i64,
    pub pending_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub amount: Decimal,
    pub payout_count: i64,
    pub reference: String,
    pub method: String,
    pub mode: PayoutMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantPayout {
    /// Amount sent to the seller after the instant fee.
    pub amount: Decimal,
    pub instant_fee: Decimal,
    pub gross_amount: Decimal,
    pub payout_count: i64,
    pub reference: String,
    pub method: String,
    pub mode: PayoutMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutHistory {
    pub payouts: Vec<SellerPayout>,
    pub total: i64,
    pub has_more: bool,
}

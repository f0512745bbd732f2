//! Types shared between the api server and its clients.
//!
//! Ids are transparent uuid newtypes so they can be bound directly in sqlx
//! queries (with the `use-sqlx` feature) without reaching for the inner
//! value.
pub mod api_client;
pub mod requests;
pub mod responses;

pub use api_client::{APIClient, ClientError};

use derive_more::Display;
#[cfg(feature = "use-sqlx")]
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug,
                Clone,
                Copy,
                PartialEq,
                Eq,
                Hash,
                Display,
                Serialize,
                Deserialize,
            )]
            #[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
            #[cfg_attr(feature = "use-sqlx", sqlx(transparent))]
            pub struct $name(pub Uuid);
        )*
    };
}

id_type!(
    UserId,
    SellerProfileId,
    PayoutMethodId,
    AuctionId,
    BidId,
    OrderId,
    PayoutId,
    /// Audit row id for a payout safety check.
    SafetyLogId,
    NotificationId,
);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "use-sqlx",
    sqlx(type_name = "auction_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Scheduled,
    Active,
    Paused,
    Ended,
    Settled,
    Cancelled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "use-sqlx",
    sqlx(type_name = "order_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "use-sqlx",
    sqlx(type_name = "payment_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Expired,
}

/// Payouts only ever move forward through these states.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Display,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "use-sqlx",
    sqlx(type_name = "payout_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Ready,
    Paid,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "use-sqlx",
    sqlx(type_name = "payout_type", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType {
    Standard,
    Instant,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "use-sqlx",
    sqlx(type_name = "safety_check_type", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCheckType {
    FirstSale,
    HighValue,
    NewBuyer,
}

/// Whether payouts are simulated in-process or sent to the real gateway.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMode {
    #[default]
    #[display("demo")]
    Demo,
    #[display("production")]
    Production,
}

impl std::str::FromStr for PayoutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "demo" => Ok(Self::Demo),
            "production" => Ok(Self::Production),
            other => Err(format!("unknown payout mode '{other}'")),
        }
    }
}

/// Nullable timestamp column decoding helper.
#[cfg(feature = "use-sqlx")]
#[derive(sqlx::Type)]
#[sqlx(transparent)]
pub struct OptionalTimestamp(Option<jiff_sqlx::Timestamp>);

#[cfg(feature = "use-sqlx")]
impl From<OptionalTimestamp> for Option<Timestamp> {
    fn from(x: OptionalTimestamp) -> Option<Timestamp> {
        x.0.map(|x| x.to_jiff())
    }
}

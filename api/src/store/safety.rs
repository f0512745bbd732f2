//! Payout safety checks.
//!
//! Before a payout is opened the order is screened for conditions that call
//! for a longer escrow hold. Each condition is evaluated independently and
//! every one that trips is written to the append-only `payout_safety_logs`
//! audit trail. The hold itself follows a strict precedence, most
//! conservative first:
//!
//! ```text
//! test mode override  -> PAYOUT_TEST_HOLD_MINUTES
//! first sale          -> 72 hours
//! high value (>5000)  -> 48 hours
//! otherwise           -> 24 hours
//! ```

use anyhow::Context;
use jiff::{Span, Timestamp};
use jiff_sqlx::ToSqlx;
use payloads::{OrderId, SafetyCheckType, SellerProfileId, UserId};
use rust_decimal::{Decimal, dec};
use sqlx::PgPool;

use super::{Order, StoreError, payout::PayoutSettings};
use crate::{telemetry::log_error, time::TimeSource};

pub const HIGH_VALUE_THRESHOLD: Decimal = dec!(5000);

const FIRST_SALE_HOLD_HOURS: i64 = 72;
const HIGH_VALUE_HOLD_HOURS: i64 = 48;
const STANDARD_HOLD_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyFlags {
    /// The seller has never been paid out before.
    pub is_first_sale: bool,
    pub is_high_value: bool,
    /// This order is the buyer's first paid purchase.
    pub is_new_buyer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPeriod {
    Test,
    FirstSale,
    HighValue,
    Standard,
}

impl HoldPeriod {
    /// Fails only for a test hold outside the range a span can hold.
    pub fn span(&self, settings: &PayoutSettings) -> anyhow::Result<Span> {
        let span = match self {
            Self::Test => Span::new()
                .try_minutes(settings.test_hold_minutes)
                .with_context(|| {
                    format!(
                        "test hold of {} minutes",
                        settings.test_hold_minutes
                    )
                })?,
            Self::FirstSale => Span::new().hours(FIRST_SALE_HOLD_HOURS),
            Self::HighValue => Span::new().hours(HIGH_VALUE_HOLD_HOURS),
            Self::Standard => Span::new().hours(STANDARD_HOLD_HOURS),
        };
        Ok(span)
    }
}

impl SafetyFlags {
    /// Derive flags from the raw counts gathered for an order.
    ///
    /// `buyer_paid_orders` only needs to be counted up to two: exactly one
    /// paid order means the current one is the buyer's first.
    pub fn from_counts(
        seller_paid_payouts: i64,
        order_total: Decimal,
        buyer_paid_orders: i64,
    ) -> Self {
        Self {
            is_first_sale: seller_paid_payouts == 0,
            is_high_value: order_total > HIGH_VALUE_THRESHOLD,
            is_new_buyer: buyer_paid_orders == 1,
        }
    }

    pub fn hold_period(&self, test_mode: bool) -> HoldPeriod {
        if test_mode {
            HoldPeriod::Test
        } else if self.is_first_sale {
            HoldPeriod::FirstSale
        } else if self.is_high_value {
            HoldPeriod::HighValue
        } else {
            HoldPeriod::Standard
        }
    }

    /// The checks that tripped, with a note for each.
    pub fn tripped(&self) -> Vec<(SafetyCheckType, &'static str)> {
        [
            (
                self.is_first_sale,
                SafetyCheckType::FirstSale,
                "First sale for this seller - extended hold",
            ),
            (
                self.is_high_value,
                SafetyCheckType::HighValue,
                "High-value order - extended hold",
            ),
            (
                self.is_new_buyer,
                SafetyCheckType::NewBuyer,
                "First paid purchase by this buyer",
            ),
        ]
        .into_iter()
        .filter(|(tripped, _, _)| *tripped)
        .map(|(_, check, note)| (check, note))
        .collect()
    }

    pub fn notes(&self) -> Option<String> {
        let notes: Vec<&str> =
            self.tripped().into_iter().map(|(_, note)| note).collect();
        if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyCheckResult {
    pub flags: SafetyFlags,
    pub hold: HoldPeriod,
    pub ready_date: Timestamp,
    pub notes: Option<String>,
}

/// Screen an order before opening its payout.
///
/// Nothing is written here. The caller records the tripped checks with
/// [`record_safety_checks`] once it owns the new payout, so a lost insert
/// race leaves no audit rows behind.
#[tracing::instrument(skip(order, settings, pool, time_source), fields(order_id = %order.id))]
pub async fn evaluate_safety_checks(
    order: &Order,
    seller_profile_id: &SellerProfileId,
    settings: &PayoutSettings,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<SafetyCheckResult, StoreError> {
    let seller_paid_payouts = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM seller_payouts
        WHERE seller_profile_id = $1 AND status = 'paid'",
    )
    .bind(seller_profile_id)
    .fetch_one(pool)
    .await?;

    let buyer_paid_orders = count_paid_orders_up_to_two(&order.user_id, pool)
        .await?;

    let flags = SafetyFlags::from_counts(
        seller_paid_payouts,
        order.total_amount,
        buyer_paid_orders,
    );
    let hold = flags.hold_period(settings.test_mode);
    let ready_date = time_source.after(hold.span(settings)?)?;

    if flags != SafetyFlags::default() {
        tracing::info!(?flags, ?hold, "payout safety checks tripped");
    }

    Ok(SafetyCheckResult {
        flags,
        hold,
        ready_date,
        notes: flags.notes(),
    })
}

/// Append one audit row per tripped check.
///
/// Best-effort: a failed insert is logged and never blocks the payout.
pub async fn record_safety_checks(
    order_id: &OrderId,
    seller_profile_id: &SellerProfileId,
    flags: &SafetyFlags,
    pool: &PgPool,
    time_source: &TimeSource,
) {
    for (check_type, note) in flags.tripped() {
        let _ = log_safety_check(
            order_id,
            seller_profile_id,
            check_type,
            note,
            time_source,
            pool,
        )
        .await
        .map_err(log_error);
    }
}

async fn count_paid_orders_up_to_two(
    user_id: &UserId,
    pool: &PgPool,
) -> Result<i64, StoreError> {
    let ids = sqlx::query_scalar::<_, OrderId>(
        "SELECT id FROM orders
        WHERE user_id = $1 AND payment_status = 'paid'
        LIMIT 2",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(ids.len() as i64)
}

/// `passed` is false for every tripped check: the row records that the
/// order needed extra scrutiny.
async fn log_safety_check(
    order_id: &OrderId,
    seller_profile_id: &SellerProfileId,
    check_type: SafetyCheckType,
    note: &str,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO payout_safety_logs (
            order_id,
            seller_profile_id,
            check_type,
            passed,
            notes,
            created_at
        ) VALUES ($1, $2, $3, false, $4, $5)",
    )
    .bind(order_id)
    .bind(seller_profile_id)
    .bind(check_type)
    .bind(note)
    .bind(time_source.now().to_sqlx())
    .execute(pool)
    .await?;
    Ok(())
}

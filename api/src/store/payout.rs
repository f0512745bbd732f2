//! Seller payout ledger.
//!
//! A payout is opened when an order is delivered and moves strictly forward:
//!
//! ```text
//! pending --(ready_date passes)--> ready --(withdrawal)--> paid
//!    \                                                      ^
//!     `----------------(instant payout, +1% fee)-----------'
//! ```
//!
//! # Money
//!
//! All amounts are `Decimal` with two decimal places stored in the database.
//! Fees are rounded half away from zero to cents and the net amount is
//! always `amount - fee`, so the two columns sum back to the gross exactly.
//!
//! # Withdrawals
//!
//! The payouts included in a withdrawal are locked with `SELECT ... FOR
//! UPDATE` for the duration of the gateway call, and marked paid with an
//! update that is conditional on their previous status. A failed or timed out
//! gateway call rolls the transaction back, leaving every payout untouched.

use jiff::Timestamp;
use jiff_sqlx::ToSqlx;
use payloads::{
    OrderId, PayoutId, PayoutStatus, SellerProfileId, responses,
    responses::SellerPayout,
};
use rust_decimal::{Decimal, RoundingStrategy, dec};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    PayoutDestination, StoreError, get_order, get_seller_profile,
    resolve_payout_destination, safety,
};
use crate::{
    Services,
    gateway::{PayoutGateway, PayoutRequest, PayoutResult},
    time::TimeSource,
};

pub const PLATFORM_FEE_RATE: Decimal = dec!(0.04);
pub const INSTANT_FEE_RATE: Decimal = dec!(0.01);
pub const MINIMUM_PAYOUT: Decimal = dec!(100);
pub const DEFAULT_TEST_HOLD_MINUTES: i64 = 2;

#[derive(Debug, Clone)]
pub struct PayoutSettings {
    pub platform_fee_rate: Decimal,
    pub instant_fee_rate: Decimal,
    pub minimum_payout: Decimal,
    /// Shortens every escrow hold to `test_hold_minutes`. Never enable in
    /// production.
    pub test_mode: bool,
    pub test_hold_minutes: i64,
}

impl Default for PayoutSettings {
    fn default() -> Self {
        Self {
            platform_fee_rate: PLATFORM_FEE_RATE,
            instant_fee_rate: INSTANT_FEE_RATE,
            minimum_payout: MINIMUM_PAYOUT,
            test_mode: false,
            test_hold_minutes: DEFAULT_TEST_HOLD_MINUTES,
        }
    }
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Fixed two decimal rendering used in balance responses.
pub fn format_money(amount: Decimal) -> String {
    format!("{:.2}", round_money(amount))
}

/// Returns `(platform_fee, net_amount)`.
pub fn split_platform_fee(amount: Decimal, rate: Decimal) -> (Decimal, Decimal) {
    let fee = round_money(amount * rate);
    (fee, amount - fee)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstantFeeSplit {
    pub gross: Decimal,
    pub fee: Decimal,
    pub final_amount: Decimal,
    /// The fee recorded on each included payout.
    pub fee_per_payout: Decimal,
}

pub fn split_instant_fee(
    gross: Decimal,
    rate: Decimal,
    payout_count: usize,
) -> InstantFeeSplit {
    let fee = round_money(gross * rate);
    let fee_per_payout = if payout_count == 0 {
        Decimal::ZERO
    } else {
        round_money(fee / Decimal::from(payout_count))
    };
    InstantFeeSplit {
        gross,
        fee,
        final_amount: gross - fee,
        fee_per_payout,
    }
}

/// `<prefix>-<unix millis>-<first 8 hex chars of the seller id>`
pub fn payout_reference(
    prefix: &str,
    now: Timestamp,
    seller_profile_id: &SellerProfileId,
) -> String {
    let seller = seller_profile_id.0.simple().to_string();
    format!("{prefix}-{}-{}", now.as_millisecond(), &seller[..8])
}

/// Gateway idempotency key for paying exactly this set of payouts.
///
/// Independent of time and row order: retrying the same batch yields the
/// same key, while any change to the batch yields a new one.
pub fn payout_batch_key(prefix: &str, payout_ids: &[PayoutId]) -> String {
    let mut ids: Vec<Uuid> = payout_ids.iter().map(|id| id.0).collect();
    ids.sort_unstable();
    let bytes: Vec<u8> =
        ids.iter().flat_map(|id| id.as_bytes().to_owned()).collect();
    format!("{prefix}-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, &bytes))
}

/// Outcome of a promotion pass. Row failures do not stop the pass.
#[derive(Debug, Default)]
pub struct ProcessedPayouts {
    pub processed: u64,
    pub errors: Vec<String>,
}

pub async fn get_payout_for_order(
    order_id: &OrderId,
    pool: &PgPool,
) -> Result<Option<SellerPayout>, StoreError> {
    Ok(sqlx::query_as::<_, SellerPayout>(
        "SELECT * FROM seller_payouts WHERE order_id = $1",
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await?)
}

/// Open the payout for a delivered order.
///
/// Idempotent: a second call for the same order returns the existing payout.
/// The unique `order_id` constraint settles races between concurrent calls.
#[tracing::instrument(skip(settings, pool, time_source))]
pub async fn create_payout(
    order_id: &OrderId,
    settings: &PayoutSettings,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<SellerPayout, StoreError> {
    let order = get_order(order_id, pool).await?;
    let seller_profile_id = order
        .seller_profile_id
        .ok_or(StoreError::MissingSellerProfile)?;

    if let Some(existing) = get_payout_for_order(order_id, pool).await? {
        tracing::debug!(payout_id = %existing.id, "payout already exists");
        return Ok(existing);
    }

    let (platform_fee, net_amount) =
        split_platform_fee(order.total_amount, settings.platform_fee_rate);
    let payout_method = resolve_payout_destination(&seller_profile_id, pool)
        .await?
        .map(|d| d.method);
    let checks = safety::evaluate_safety_checks(
        &order,
        &seller_profile_id,
        settings,
        pool,
        time_source,
    )
    .await?;

    let inserted = sqlx::query_as::<_, SellerPayout>(
        "INSERT INTO seller_payouts (
            seller_profile_id,
            order_id,
            amount,
            platform_fee,
            net_amount,
            status,
            payout_type,
            ready_date,
            payout_method,
            notes,
            created_at
        ) VALUES ($1, $2, $3, $4, $5, 'pending', 'standard', $6, $7, $8, $9)
        ON CONFLICT (order_id) DO NOTHING
        RETURNING *",
    )
    .bind(seller_profile_id)
    .bind(order_id)
    .bind(order.total_amount)
    .bind(platform_fee)
    .bind(net_amount)
    .bind(checks.ready_date.to_sqlx())
    .bind(&payout_method)
    .bind(&checks.notes)
    .bind(time_source.now().to_sqlx())
    .fetch_optional(pool)
    .await
    .inspect_err(|e| {
        tracing::error!(
            %seller_profile_id,
            amount = %order.total_amount,
            %platform_fee,
            %net_amount,
            ready_date = %checks.ready_date,
            "failed to insert seller payout: {e}"
        )
    })?;

    match inserted {
        Some(payout) => {
            safety::record_safety_checks(
                order_id,
                &seller_profile_id,
                &checks.flags,
                pool,
                time_source,
            )
            .await;
            tracing::info!(
                payout_id = %payout.id,
                %net_amount,
                ready_date = %payout.ready_date,
                "seller payout created"
            );
            Ok(payout)
        }
        // lost a race with a concurrent create for the same order
        None => get_payout_for_order(order_id, pool)
            .await?
            .ok_or(StoreError::OrderNotFound),
    }
}

/// Move pending payouts whose hold has passed to ready, optionally for a
/// single seller.
#[tracing::instrument(skip(pool, time_source))]
pub async fn promote_due_payouts(
    seller_profile_id: Option<&SellerProfileId>,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<ProcessedPayouts, StoreError> {
    let due = sqlx::query_scalar::<_, PayoutId>(
        "SELECT id FROM seller_payouts
        WHERE status = 'pending'
            AND ready_date <= $1
            AND ($2::uuid IS NULL OR seller_profile_id = $2)
        ORDER BY ready_date",
    )
    .bind(time_source.now().to_sqlx())
    .bind(seller_profile_id.copied())
    .fetch_all(pool)
    .await?;

    let mut result = ProcessedPayouts::default();
    for payout_id in due {
        let updated = sqlx::query(
            "UPDATE seller_payouts SET status = 'ready'
            WHERE id = $1 AND status = 'pending'",
        )
        .bind(payout_id)
        .execute(pool)
        .await;

        match updated {
            Ok(r) => result.processed += r.rows_affected(),
            Err(e) => {
                tracing::error!(%payout_id, "failed to mark payout ready: {e}");
                result.errors.push(format!("{payout_id}: {e}"));
            }
        }
    }

    if result.processed > 0 {
        tracing::info!(processed = result.processed, "payouts now ready");
    }
    Ok(result)
}

/// Scheduled promotion of every due payout.
pub async fn process_ready_payouts(
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<ProcessedPayouts, StoreError> {
    promote_due_payouts(None, pool, time_source).await
}

/// Promotion before a balance read or withdrawal. Row errors are logged; the
/// caller proceeds with whatever was promoted.
async fn promote_for_seller(
    seller_profile_id: &SellerProfileId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<(), StoreError> {
    let promoted =
        promote_due_payouts(Some(seller_profile_id), pool, time_source).await?;
    for error in promoted.errors {
        tracing::warn!("payout promotion error: {error}");
    }
    Ok(())
}

#[tracing::instrument(skip(pool, time_source))]
pub async fn get_seller_balance(
    seller_profile_id: &SellerProfileId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::SellerBalance, StoreError> {
    get_seller_profile(seller_profile_id, pool).await?;
    promote_for_seller(seller_profile_id, pool, time_source).await?;

    let totals = sqlx::query_as::<_, (PayoutStatus, Decimal, i64)>(
        "SELECT status, COALESCE(SUM(net_amount), 0), COUNT(*)
        FROM seller_payouts
        WHERE seller_profile_id = $1
        GROUP BY status",
    )
    .bind(seller_profile_id)
    .fetch_all(pool)
    .await?;

    let total_for = |status: PayoutStatus| {
        totals
            .iter()
            .find(|(s, _, _)| *s == status)
            .map(|(_, sum, count)| (*sum, *count))
            .unwrap_or((Decimal::ZERO, 0))
    };
    let (available, ready_count) = total_for(PayoutStatus::Ready);
    let (pending, pending_count) = total_for(PayoutStatus::Pending);
    let (total_paid, _) = total_for(PayoutStatus::Paid);

    Ok(responses::SellerBalance {
        available: format_money(available),
        pending: format_money(pending),
        total_paid: format_money(total_paid),
        ready_count,
        pending_count,
    })
}

/// Send `amount` through the gateway under the configured timeout.
async fn send_payout(
    gateway: &dyn PayoutGateway,
    request: &PayoutRequest,
    services: &Services,
) -> Result<PayoutResult, StoreError> {
    let result = tokio::time::timeout(
        services.external_timeout,
        gateway.process_payout(request),
    )
    .await
    .map_err(|_| StoreError::ExternalTimeout("payout gateway".into()))?
    .map_err(|e| StoreError::GatewayError(format!("{e:#}")))?;

    if !result.success {
        return Err(StoreError::GatewayError(result.status));
    }
    Ok(result)
}

async fn payout_destination(
    seller_profile_id: &SellerProfileId,
    pool: &PgPool,
) -> Result<PayoutDestination, StoreError> {
    resolve_payout_destination(seller_profile_id, pool)
        .await?
        .ok_or(StoreError::NoPaymentMethod)
}

/// Withdraw every ready payout for a seller in one gateway call.
#[tracing::instrument(skip(services, pool, time_source))]
pub async fn withdraw_balance(
    seller_profile_id: &SellerProfileId,
    services: &Services,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::Withdrawal, StoreError> {
    let profile = get_seller_profile(seller_profile_id, pool).await?;
    promote_for_seller(seller_profile_id, pool, time_source).await?;
    let destination = payout_destination(seller_profile_id, pool).await?;

    let mut tx = pool.begin().await?;
    let ready = sqlx::query_as::<_, (PayoutId, Decimal)>(
        "SELECT id, net_amount FROM seller_payouts
        WHERE seller_profile_id = $1 AND status = 'ready'
        ORDER BY created_at
        FOR UPDATE",
    )
    .bind(seller_profile_id)
    .fetch_all(&mut *tx)
    .await?;

    if ready.is_empty() {
        return Err(StoreError::NoFundsAvailable);
    }
    let total: Decimal = ready.iter().map(|(_, net)| *net).sum();
    if total < services.payout_settings.minimum_payout {
        return Err(StoreError::BelowMinimum {
            amount: total,
            minimum: services.payout_settings.minimum_payout,
        });
    }

    let ids: Vec<PayoutId> = ready.iter().map(|(id, _)| *id).collect();
    let now = time_source.now();
    let request = PayoutRequest {
        destination: destination.clone(),
        amount: total,
        seller_profile_id: *seller_profile_id,
        seller_name: profile.display_name,
        payout_id: payout_reference("PO", now, seller_profile_id),
        idempotency_key: payout_batch_key("PO", &ids),
    };
    let gateway = services.payouts.as_ref();
    let result = send_payout(gateway, &request, services).await?;

    let updated = sqlx::query(
        "UPDATE seller_payouts
        SET status = 'paid',
            payout_reference = $1,
            paid_at = $2,
            payout_method = $3
        WHERE id = ANY($4) AND status = 'ready'",
    )
    .bind(&result.reference_id)
    .bind(now.to_sqlx())
    .bind(&destination.method)
    .bind(&ids)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated != ids.len() as u64 {
        tracing::error!(
            reference = %result.reference_id,
            expected = ids.len(),
            updated,
            "withdrawal batch changed underneath the gateway call"
        );
        return Err(StoreError::PayoutConflict);
    }
    tx.commit().await?;

    tracing::info!(
        amount = %total,
        payout_count = ids.len(),
        reference = %result.reference_id,
        "withdrawal completed"
    );
    Ok(responses::Withdrawal {
        amount: total,
        payout_count: ids.len() as i64,
        reference: result.reference_id,
        method: destination.method,
        mode: gateway.mode(),
    })
}

/// Pay out pending payouts before their hold ends, less the instant fee.
#[tracing::instrument(skip(services, pool, time_source))]
pub async fn request_instant_payout(
    seller_profile_id: &SellerProfileId,
    services: &Services,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<responses::InstantPayout, StoreError> {
    let profile = get_seller_profile(seller_profile_id, pool).await?;
    let destination = payout_destination(seller_profile_id, pool).await?;

    let mut tx = pool.begin().await?;
    let pending = sqlx::query_as::<_, (PayoutId, Decimal)>(
        "SELECT id, net_amount FROM seller_payouts
        WHERE seller_profile_id = $1 AND status = 'pending'
        ORDER BY created_at
        FOR UPDATE",
    )
    .bind(seller_profile_id)
    .fetch_all(&mut *tx)
    .await?;

    if pending.is_empty() {
        return Err(StoreError::NoPendingPayouts);
    }
    let gross: Decimal = pending.iter().map(|(_, net)| *net).sum();
    let split = split_instant_fee(
        gross,
        services.payout_settings.instant_fee_rate,
        pending.len(),
    );
    if split.final_amount < services.payout_settings.minimum_payout {
        return Err(StoreError::BelowMinimum {
            amount: split.final_amount,
            minimum: services.payout_settings.minimum_payout,
        });
    }

    let ids: Vec<PayoutId> = pending.iter().map(|(id, _)| *id).collect();
    let now = time_source.now();
    let request = PayoutRequest {
        destination: destination.clone(),
        amount: split.final_amount,
        seller_profile_id: *seller_profile_id,
        seller_name: profile.display_name,
        payout_id: payout_reference("IP", now, seller_profile_id),
        idempotency_key: payout_batch_key("IP", &ids),
    };
    let gateway = services.payouts.as_ref();
    let result = send_payout(gateway, &request, services).await?;

    let updated = sqlx::query(
        "UPDATE seller_payouts
        SET status = 'paid',
            payout_type = 'instant',
            instant_fee = $1,
            payout_reference = $2,
            paid_at = $3,
            payout_method = $4
        WHERE id = ANY($5) AND status = 'pending'",
    )
    .bind(split.fee_per_payout)
    .bind(&result.reference_id)
    .bind(now.to_sqlx())
    .bind(&destination.method)
    .bind(&ids)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated != ids.len() as u64 {
        tracing::error!(
            reference = %result.reference_id,
            expected = ids.len(),
            updated,
            "instant payout batch changed underneath the gateway call"
        );
        return Err(StoreError::PayoutConflict);
    }
    tx.commit().await?;

    tracing::info!(
        amount = %split.final_amount,
        instant_fee = %split.fee,
        reference = %result.reference_id,
        "instant payout completed"
    );
    Ok(responses::InstantPayout {
        amount: split.final_amount,
        instant_fee: split.fee,
        gross_amount: split.gross,
        payout_count: ids.len() as i64,
        reference: result.reference_id,
        method: destination.method,
        mode: gateway.mode(),
    })
}

/// Newest first.
pub async fn get_payout_history(
    seller_profile_id: &SellerProfileId,
    limit: i64,
    offset: i64,
    pool: &PgPool,
) -> Result<responses::PayoutHistory, StoreError> {
    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM seller_payouts WHERE seller_profile_id = $1",
    )
    .bind(seller_profile_id)
    .fetch_one(pool)
    .await?;

    let payouts = sqlx::query_as::<_, SellerPayout>(
        "SELECT * FROM seller_payouts
        WHERE seller_profile_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2 OFFSET $3",
    )
    .bind(seller_profile_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let has_more = offset + (payouts.len() as i64) < total;
    Ok(responses::PayoutHistory {
        payouts,
        total,
        has_more,
    })
}

/// Record delivery of a paid order and open its payout.
///
/// Calling this again for an already delivered order returns the existing
/// payout.
#[tracing::instrument(skip(settings, pool, time_source))]
pub async fn mark_order_delivered(
    order_id: &OrderId,
    settings: &PayoutSettings,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<SellerPayout, StoreError> {
    let updated = sqlx::query(
        "UPDATE orders SET status = 'delivered', delivered_at = $2
        WHERE id = $1 AND status IN ('paid', 'shipped')",
    )
    .bind(order_id)
    .bind(time_source.now().to_sqlx())
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        let order = get_order(order_id, pool).await?;
        if order.status != payloads::OrderStatus::Delivered {
            return Err(StoreError::InvalidOrderTransition(order.status));
        }
    }

    create_payout(order_id, settings, pool, time_source).await
}

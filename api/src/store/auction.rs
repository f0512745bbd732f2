//! Auction state transitions.
//!
//! ```text
//! scheduled --> active <--> paused
//!                  \          /
//!                   v        v
//!                    ended ------> settled
//!                      ^              |
//!                      |  unpaid by payment_due_at
//!                      `--------------'
//!          (next bidder becomes winner, or no winner: terminal)
//! ```
//!
//! Every transition is an `UPDATE ... WHERE status = <expected>` executed
//! against a row locked with `FOR UPDATE`, so a transition that lost a race
//! simply reports that nothing changed.

use anyhow::Context;
use jiff::Span;
use jiff_sqlx::ToSqlx;
use payloads::{AuctionId, AuctionStatus, PaymentStatus, UserId};
use sqlx::{PgPool, Postgres, Transaction};

use super::{Auction, Bid, Order, StoreError, get_order_tx};
use crate::{
    Services,
    gateway::PaymentLink,
    notifier::WinnerNotification,
    telemetry::best_effort,
    time::TimeSource,
};

pub const DEFAULT_PAYMENT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct AuctionSettings {
    /// Hours a winner has to pay before the win rolls over.
    pub payment_window_hours: i64,
}

impl Default for AuctionSettings {
    fn default() -> Self {
        Self {
            payment_window_hours: DEFAULT_PAYMENT_WINDOW_HOURS,
        }
    }
}

impl AuctionSettings {
    pub fn payment_window(&self) -> anyhow::Result<Span> {
        Span::new()
            .try_hours(self.payment_window_hours)
            .with_context(|| {
                format!(
                    "payment window of {} hours",
                    self.payment_window_hours
                )
            })
    }
}

#[derive(Debug, Clone)]
pub struct ClosedAuction {
    pub auction: Auction,
    pub was_paused: bool,
    pub winning_bid: Option<Bid>,
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub order: Order,
    pub payment_link: PaymentLink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloverOutcome {
    /// The winner paid; nothing to do.
    AlreadyPaid,
    /// No eligible bidder remained. The auction ended without a sale.
    Unsold,
    /// The win moved to the next bidder. `settled` is false when creating
    /// the new order failed; the next settlement pass retries it.
    Reassigned { winner_user_id: UserId, settled: bool },
    /// The auction was no longer settled and overdue when locked.
    Skipped,
}

pub async fn get_auction(
    auction_id: &AuctionId,
    pool: &PgPool,
) -> Result<Auction, StoreError> {
    sqlx::query_as::<_, Auction>("SELECT * FROM auctions WHERE id = $1")
        .bind(auction_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::AuctionNotFound)
}

async fn lock_auction(
    auction_id: &AuctionId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Auction, StoreError> {
    sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions WHERE id = $1 FOR UPDATE",
    )
    .bind(auction_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::AuctionNotFound)
}

/// Scheduled auctions whose start time has passed.
pub async fn list_auctions_to_activate(
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Vec<Auction>, StoreError> {
    Ok(sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions
        WHERE status = 'scheduled' AND start_at <= $1
        ORDER BY start_at",
    )
    .bind(time_source.now().to_sqlx())
    .fetch_all(pool)
    .await?)
}

/// Returns whether the auction was activated by this call.
pub async fn activate_auction(
    auction_id: &AuctionId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE auctions SET status = 'active'
        WHERE id = $1 AND status = 'scheduled' AND start_at <= $2",
    )
    .bind(auction_id)
    .bind(time_source.now().to_sqlx())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Active or paused auctions whose end time has passed.
pub async fn list_auctions_to_close(
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Vec<Auction>, StoreError> {
    Ok(sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions
        WHERE status IN ('active', 'paused') AND end_at <= $1
        ORDER BY end_at",
    )
    .bind(time_source.now().to_sqlx())
    .fetch_all(pool)
    .await?)
}

/// The highest bid at or above the reserve; ties go to the earlier bid.
async fn highest_bid_meeting_reserve(
    auction: &Auction,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<Bid>, StoreError> {
    Ok(sqlx::query_as::<_, Bid>(
        "SELECT * FROM bids
        WHERE auction_id = $1 AND amount >= $2
        ORDER BY amount DESC, created_at ASC, id ASC
        LIMIT 1",
    )
    .bind(auction.id)
    .bind(auction.reserve_price)
    .fetch_optional(&mut **tx)
    .await?)
}

/// End an auction whose time is up and record its winner, if any bid met the
/// reserve. Returns `None` when the auction was not closable anymore.
#[tracing::instrument(skip(pool, time_source))]
pub async fn close_auction(
    auction_id: &AuctionId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Option<ClosedAuction>, StoreError> {
    let mut tx = pool.begin().await?;
    let auction = lock_auction(auction_id, &mut tx).await?;

    let closable =
        matches!(auction.status, AuctionStatus::Active | AuctionStatus::Paused)
            && auction.end_at <= time_source.now();
    if !closable {
        return Ok(None);
    }

    let winning_bid = highest_bid_meeting_reserve(&auction, &mut tx).await?;
    let closed = sqlx::query_as::<_, Auction>(
        "UPDATE auctions
        SET status = 'ended',
            winner_user_id = $2,
            winning_bid_id = $3
        WHERE id = $1 AND status = $4
        RETURNING *",
    )
    .bind(auction_id)
    .bind(winning_bid.as_ref().map(|b| b.user_id))
    .bind(winning_bid.as_ref().map(|b| b.id))
    .bind(auction.status)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    match &winning_bid {
        Some(bid) => tracing::info!(
            winner_user_id = %bid.user_id,
            amount = %bid.amount,
            "auction closed with a winner"
        ),
        None => tracing::info!("auction closed without a bid meeting reserve"),
    }

    Ok(Some(ClosedAuction {
        auction: closed,
        was_paused: auction.status == AuctionStatus::Paused,
        winning_bid,
    }))
}

/// Ended auctions with a winner and no settlement order yet.
pub async fn list_auctions_to_settle(
    pool: &PgPool,
) -> Result<Vec<Auction>, StoreError> {
    Ok(sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions
        WHERE status = 'ended'
            AND winner_user_id IS NOT NULL
            AND settlement_order_id IS NULL
        ORDER BY end_at",
    )
    .fetch_all(pool)
    .await?)
}

/// Turn the current winning bid into an order with a payment link, then
/// notify the winner.
///
/// The order insert, payment link and auction claim commit together; the
/// claim is conditional on `settlement_order_id IS NULL`, so an auction can
/// never be settled twice. Returns `None` if the auction had nothing to
/// settle when locked.
#[tracing::instrument(skip(services, pool, time_source))]
pub async fn settle_auction(
    auction_id: &AuctionId,
    services: &Services,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Option<Settlement>, StoreError> {
    let mut tx = pool.begin().await?;
    let auction = lock_auction(auction_id, &mut tx).await?;

    let (winner_user_id, winning_bid_id) = match (
        auction.status,
        auction.settlement_order_id,
        auction.winner_user_id,
        auction.winning_bid_id,
    ) {
        (AuctionStatus::Ended, None, Some(user), Some(bid)) => (user, bid),
        _ => return Ok(None),
    };

    let amount = sqlx::query_scalar::<_, rust_decimal::Decimal>(
        "SELECT amount FROM bids WHERE id = $1",
    )
    .bind(winning_bid_id)
    .fetch_one(&mut *tx)
    .await?;

    let now = time_source.now();
    let order = sqlx::query_as::<_, Order>(
        "INSERT INTO orders (
            user_id,
            seller_profile_id,
            auction_id,
            total_amount,
            status,
            payment_status,
            created_at
        ) VALUES ($1, $2, $3, $4, 'pending', 'unpaid', $5)
        RETURNING *",
    )
    .bind(winner_user_id)
    .bind(auction.seller_profile_id)
    .bind(auction.id)
    .bind(amount)
    .bind(now.to_sqlx())
    .fetch_one(&mut *tx)
    .await?;

    let payment_link = tokio::time::timeout(
        services.external_timeout,
        services.payments.create_payment_link(&order),
    )
    .await
    .map_err(|_| StoreError::ExternalTimeout("payment link creation".into()))?
    .map_err(|e| StoreError::GatewayError(format!("{e:#}")))?;

    let order = sqlx::query_as::<_, Order>(
        "UPDATE orders SET payment_link_id = $2, payment_link_url = $3
        WHERE id = $1
        RETURNING *",
    )
    .bind(order.id)
    .bind(&payment_link.payment_link_id)
    .bind(&payment_link.checkout_url)
    .fetch_one(&mut *tx)
    .await?;

    let payment_due_at =
        time_source.after(services.auction_settings.payment_window()?)?;
    let claimed = sqlx::query(
        "UPDATE auctions
        SET status = 'settled',
            settlement_order_id = $2,
            payment_due_at = $3
        WHERE id = $1
            AND status = 'ended'
            AND settlement_order_id IS NULL",
    )
    .bind(auction.id)
    .bind(order.id)
    .bind(payment_due_at.to_sqlx())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed != 1 {
        // the uncommitted order is rolled back with the transaction; the
        // payment link is orphaned and must not stay payable
        let _ = best_effort(
            "cancelling unclaimed payment link",
            services.external_timeout,
            services
                .payments
                .cancel_payment_link(&payment_link.payment_link_id),
        )
        .await;
        return Ok(None);
    }
    tx.commit().await?;

    tracing::info!(
        order_id = %order.id,
        %winner_user_id,
        %amount,
        "auction settled"
    );

    let notification = WinnerNotification {
        auction_id: auction.id,
        auction_title: auction.title.clone(),
        winner_user_id,
        order_id: order.id,
        amount,
        payment_link_url: payment_link.checkout_url.clone(),
        payment_due_at,
    };
    let _ = best_effort(
        "notifying auction winner",
        services.external_timeout,
        services.notifier.notify_auction_winner(&notification),
    )
    .await;

    Ok(Some(Settlement {
        order,
        payment_link,
    }))
}

/// Settled auctions whose payment deadline has passed without payment.
pub async fn list_overdue_settlements(
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Vec<Auction>, StoreError> {
    Ok(sqlx::query_as::<_, Auction>(
        "SELECT auctions.* FROM auctions
        JOIN orders ON orders.id = auctions.settlement_order_id
        WHERE auctions.status = 'settled'
            AND auctions.payment_due_at <= $1
            AND orders.payment_status <> 'paid'
        ORDER BY auctions.payment_due_at",
    )
    .bind(time_source.now().to_sqlx())
    .fetch_all(pool)
    .await?)
}

/// The best bid from the highest distinct bidder still eligible to win.
///
/// Excludes the current winner, every bidder whose settlement order for this
/// auction was already cancelled, and bids under the reserve.
pub async fn next_winning_bid(
    auction: &Auction,
    exclude_user_id: &UserId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Option<Bid>, StoreError> {
    Ok(sqlx::query_as::<_, Bid>(
        "SELECT * FROM (
            SELECT DISTINCT ON (user_id) * FROM bids
            WHERE auction_id = $1
                AND amount >= $2
                AND user_id <> $3
                AND NOT EXISTS (
                    SELECT 1 FROM orders
                    WHERE orders.auction_id = $1
                        AND orders.user_id = bids.user_id
                        AND orders.status = 'cancelled'
                )
            ORDER BY user_id, amount DESC, created_at ASC
        ) best_per_bidder
        ORDER BY amount DESC, created_at ASC, id ASC
        LIMIT 1",
    )
    .bind(auction.id)
    .bind(auction.reserve_price)
    .bind(exclude_user_id)
    .fetch_optional(&mut **tx)
    .await?)
}

async fn cancel_unpaid_order(
    order: &Order,
    tx: &mut Transaction<'_, Postgres>,
    time_source: &TimeSource,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE orders
        SET status = 'cancelled',
            payment_status = 'expired',
            cancelled_at = $2
        WHERE id = $1 AND payment_status <> 'paid'",
    )
    .bind(order.id)
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Handle a settled auction whose winner did not pay in time.
///
/// The old payment link is cancelled best-effort: local state moves on even
/// if the gateway is unreachable. The old order is cancelled and the win
/// either moves to the next eligible bidder, who is then settled, or the
/// auction ends unsold with every winner field cleared.
#[tracing::instrument(skip(services, pool, time_source))]
pub async fn rollover_unpaid_winner(
    auction_id: &AuctionId,
    services: &Services,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<RolloverOutcome, StoreError> {
    let mut tx = pool.begin().await?;
    let auction = lock_auction(auction_id, &mut tx).await?;

    let (order_id, failed_winner) =
        match (auction.settlement_order_id, auction.winner_user_id) {
            (Some(order_id), Some(winner))
                if auction.status == AuctionStatus::Settled
                    && auction
                        .payment_due_at
                        .is_some_and(|due| due <= time_source.now()) =>
            {
                (order_id, winner)
            }
            _ => return Ok(RolloverOutcome::Skipped),
        };

    let order = get_order_tx(&order_id, &mut tx).await?;
    if order.payment_status == PaymentStatus::Paid {
        return Ok(RolloverOutcome::AlreadyPaid);
    }

    if let Some(link_id) = &order.payment_link_id {
        let _ = best_effort(
            "cancelling expired payment link",
            services.external_timeout,
            services.payments.cancel_payment_link(link_id),
        )
        .await;
    }
    cancel_unpaid_order(&order, &mut tx, time_source).await?;

    let next = next_winning_bid(&auction, &failed_winner, &mut tx).await?;
    let Some(next) = next else {
        sqlx::query(
            "UPDATE auctions
            SET status = 'ended',
                winner_user_id = NULL,
                winning_bid_id = NULL,
                settlement_order_id = NULL,
                payment_due_at = NULL
            WHERE id = $1",
        )
        .bind(auction.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            %failed_winner,
            "winner did not pay and no bidder remains; auction unsold"
        );
        return Ok(RolloverOutcome::Unsold);
    };

    let payment_due_at =
        time_source.after(services.auction_settings.payment_window()?)?;
    sqlx::query(
        "UPDATE auctions
        SET status = 'ended',
            winner_user_id = $2,
            winning_bid_id = $3,
            settlement_order_id = NULL,
            payment_due_at = $4
        WHERE id = $1",
    )
    .bind(auction.id)
    .bind(next.user_id)
    .bind(next.id)
    .bind(payment_due_at.to_sqlx())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(
        %failed_winner,
        new_winner = %next.user_id,
        amount = %next.amount,
        "auction rolled over to next bidder"
    );

    let settled = settle_auction(auction_id, services, pool, time_source)
        .await
        .inspect_err(|e| {
            tracing::error!(
                "settling rolled over auction failed; will retry: {e:#}"
            )
        })
        .is_ok_and(|s| s.is_some());

    Ok(RolloverOutcome::Reassigned {
        winner_user_id: next.user_id,
        settled,
    })
}

/// Apply a status change that is only valid from one of `from`.
async fn transition(
    auction_id: &AuctionId,
    from: &[AuctionStatus],
    to: AuctionStatus,
    pool: &PgPool,
) -> Result<Auction, StoreError> {
    let mut tx = pool.begin().await?;
    let auction = lock_auction(auction_id, &mut tx).await?;
    if !from.contains(&auction.status) {
        return Err(StoreError::InvalidAuctionTransition {
            from: auction.status,
            to,
        });
    }
    let updated = sqlx::query_as::<_, Auction>(
        "UPDATE auctions SET status = $2 WHERE id = $1 RETURNING *",
    )
    .bind(auction_id)
    .bind(to)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(updated)
}

#[tracing::instrument(skip(pool))]
pub async fn pause_auction(
    auction_id: &AuctionId,
    pool: &PgPool,
) -> Result<Auction, StoreError> {
    transition(auction_id, &[AuctionStatus::Active], AuctionStatus::Paused, pool)
        .await
}

/// A resumed auction past its end time is closed by the next cron cycle.
#[tracing::instrument(skip(pool))]
pub async fn resume_auction(
    auction_id: &AuctionId,
    pool: &PgPool,
) -> Result<Auction, StoreError> {
    transition(auction_id, &[AuctionStatus::Paused], AuctionStatus::Active, pool)
        .await
}

#[tracing::instrument(skip(pool))]
pub async fn cancel_auction(
    auction_id: &AuctionId,
    pool: &PgPool,
) -> Result<Auction, StoreError> {
    transition(
        auction_id,
        &[
            AuctionStatus::Scheduled,
            AuctionStatus::Active,
            AuctionStatus::Paused,
        ],
        AuctionStatus::Cancelled,
        pool,
    )
    .await
}

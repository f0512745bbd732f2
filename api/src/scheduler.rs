//! Top-level orchestration of time-based jobs.
//!
//! Two jobs run on their own intervals: the auction job (every few minutes)
//! and the payout job (hourly). Each job run holds a transaction-scoped
//! advisory lock, so overlapping runs and other scheduler instances skip the
//! cycle instead of doing the same work twice.
//!
//! ```text
//! auction job
//!   activate scheduled auctions whose start_at passed
//!   close active/paused auctions whose end_at passed
//!       (a closed auction that was paused is settled right away)
//!   settle ended auctions that have a winner but no order
//!   roll over settled auctions whose winner missed payment_due_at
//!
//! payout job
//!   promote pending payouts whose ready_date passed
//! ```
//!
//! Failures on one auction are logged and the job moves on to the next.

use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tokio::time;

use crate::{
    Services,
    store::{self, auction::RolloverOutcome},
    telemetry::log_error,
    time::TimeSource,
};

const AUCTION_JOB: &str = "auction_cron";
const PAYOUT_JOB: &str = "payout_cron";

pub struct Scheduler {
    pool: PgPool,
    time_source: TimeSource,
    services: Services,
    auction_interval: Duration,
    payout_interval: Duration,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        services: Services,
        auction_interval: Duration,
        payout_interval: Duration,
    ) -> Self {
        Self {
            pool,
            time_source,
            services,
            auction_interval,
            payout_interval,
        }
    }

    pub async fn run(&self) {
        let mut auction_interval = time::interval(self.auction_interval);
        let mut payout_interval = time::interval(self.payout_interval);
        auction_interval
            .set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        payout_interval
            .set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = auction_interval.tick() => {
                    let _ = run_auction_cron(
                        &self.pool,
                        &self.services,
                        &self.time_source,
                    )
                    .await
                    .map_err(log_error);
                }
                _ = payout_interval.tick() => {
                    let _ = run_payout_cron(&self.pool, &self.time_source)
                        .await
                        .map_err(log_error);
                }
            }
        }
    }
}

/// Take the job's advisory lock on the coordination transaction. No other
/// work is attached to this transaction; dropping it releases the lock.
async fn try_lock_job(
    job: &str,
    coordination_tx: &mut Transaction<'_, Postgres>,
) -> anyhow::Result<bool> {
    Ok(sqlx::query_scalar::<_, bool>(
        "SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))",
    )
    .bind(format!("scheduler:{job}"))
    .fetch_one(&mut **coordination_tx)
    .await?)
}

/// Counts from one auction job run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuctionCronReport {
    pub activated: u64,
    pub closed: u64,
    pub settled: u64,
    pub rolled_over: u64,
    pub unsold: u64,
    pub errors: u64,
    /// Another run held the lock; nothing was done.
    pub skipped: bool,
}

/// Run every auction lifecycle step once.
#[tracing::instrument(skip(pool, services, time_source))]
pub async fn run_auction_cron(
    pool: &PgPool,
    services: &Services,
    time_source: &TimeSource,
) -> anyhow::Result<AuctionCronReport> {
    let mut coordination_tx = pool.begin().await?;
    if !try_lock_job(AUCTION_JOB, &mut coordination_tx).await? {
        tracing::info!("auction job already running; skipping cycle");
        return Ok(AuctionCronReport {
            skipped: true,
            ..Default::default()
        });
    }

    let mut report = AuctionCronReport::default();
    activate_scheduled_auctions(pool, time_source, &mut report).await?;
    close_ended_auctions(pool, services, time_source, &mut report).await?;
    settle_auctions(pool, services, time_source, &mut report).await?;
    rollover_unpaid_winners(pool, services, time_source, &mut report).await?;

    coordination_tx.commit().await?;
    if report != AuctionCronReport::default() {
        tracing::info!(?report, "auction job finished");
    }
    Ok(report)
}

async fn activate_scheduled_auctions(
    pool: &PgPool,
    time_source: &TimeSource,
    report: &mut AuctionCronReport,
) -> anyhow::Result<()> {
    for auction in
        store::auction::list_auctions_to_activate(pool, time_source).await?
    {
        match store::auction::activate_auction(&auction.id, pool, time_source)
            .await
        {
            Ok(true) => {
                tracing::info!(auction_id = %auction.id, "auction activated");
                report.activated += 1;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    auction_id = %auction.id,
                    "failed to activate auction: {e:#}"
                );
                report.errors += 1;
            }
        }
    }
    Ok(())
}

async fn close_ended_auctions(
    pool: &PgPool,
    services: &Services,
    time_source: &TimeSource,
    report: &mut AuctionCronReport,
) -> anyhow::Result<()> {
    for auction in
        store::auction::list_auctions_to_close(pool, time_source).await?
    {
        let closed =
            match store::auction::close_auction(&auction.id, pool, time_source)
                .await
            {
                Ok(Some(closed)) => closed,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(
                        auction_id = %auction.id,
                        "failed to close auction: {e:#}"
                    );
                    report.errors += 1;
                    continue;
                }
            };
        report.closed += 1;

        // paused auctions skip the regular settlement pass
        if closed.was_paused && closed.winning_bid.is_some() {
            settle_one(&auction.id, pool, services, time_source, report).await;
        }
    }
    Ok(())
}

async fn settle_auctions(
    pool: &PgPool,
    services: &Services,
    time_source: &TimeSource,
    report: &mut AuctionCronReport,
) -> anyhow::Result<()> {
    for auction in store::auction::list_auctions_to_settle(pool).await? {
        settle_one(&auction.id, pool, services, time_source, report).await;
    }
    Ok(())
}

async fn settle_one(
    auction_id: &payloads::AuctionId,
    pool: &PgPool,
    services: &Services,
    time_source: &TimeSource,
    report: &mut AuctionCronReport,
) {
    match store::auction::settle_auction(auction_id, services, pool, time_source)
        .await
    {
        Ok(Some(_)) => report.settled += 1,
        Ok(None) => {}
        Err(e) => {
            tracing::error!(%auction_id, "failed to settle auction: {e:#}");
            report.errors += 1;
        }
    }
}

async fn rollover_unpaid_winners(
    pool: &PgPool,
    services: &Services,
    time_source: &TimeSource,
    report: &mut AuctionCronReport,
) -> anyhow::Result<()> {
    for auction in
        store::auction::list_overdue_settlements(pool, time_source).await?
    {
        match store::auction::rollover_unpaid_winner(
            &auction.id,
            services,
            pool,
            time_source,
        )
        .await
        {
            Ok(RolloverOutcome::Reassigned { settled, .. }) => {
                report.rolled_over += 1;
                if settled {
                    report.settled += 1;
                }
            }
            Ok(RolloverOutcome::Unsold) => report.unsold += 1,
            Ok(RolloverOutcome::AlreadyPaid | RolloverOutcome::Skipped) => {}
            Err(e) => {
                tracing::error!(
                    auction_id = %auction.id,
                    "failed to roll over unpaid winner: {e:#}"
                );
                report.errors += 1;
            }
        }
    }
    Ok(())
}

/// Promote every payout whose hold has passed. Returns `None` when another
/// run held the lock.
#[tracing::instrument(skip(pool, time_source))]
pub async fn run_payout_cron(
    pool: &PgPool,
    time_source: &TimeSource,
) -> anyhow::Result<Option<store::payout::ProcessedPayouts>> {
    let mut coordination_tx = pool.begin().await?;
    if !try_lock_job(PAYOUT_JOB, &mut coordination_tx).await? {
        tracing::info!("payout job already running; skipping cycle");
        return Ok(None);
    }

    let processed =
        store::payout::process_ready_payouts(pool, time_source).await?;
    coordination_tx.commit().await?;

    if !processed.errors.is_empty() {
        tracing::warn!(
            processed = processed.processed,
            errors = processed.errors.len(),
            "payout job finished with errors"
        );
    }
    Ok(Some(processed))
}

//! Winner notifications.
//!
//! The in-app notification is keyed on `(user_id, kind, auction_id)` so
//! repeated calls for the same win are no-ops. Email is sent on every call;
//! duplicate emails after a retry are accepted.

use anyhow::Context;
use async_trait::async_trait;
use jiff::Timestamp;
use jiff_sqlx::ToSqlx;
use payloads::{AuctionId, OrderId, UserId};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::{email::EmailService, store, time::TimeSource};

const AUCTION_WON: &str = "auction_won";

#[derive(Debug, Clone)]
pub struct WinnerNotification {
    pub auction_id: AuctionId,
    pub auction_title: String,
    pub winner_user_id: UserId,
    pub order_id: OrderId,
    pub amount: Decimal,
    pub payment_link_url: String,
    pub payment_due_at: Timestamp,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_auction_winner(
        &self,
        notification: &WinnerNotification,
    ) -> anyhow::Result<()>;
}

/// Writes in-app notifications to the database and emails the winner.
pub struct DatabaseNotifier {
    pool: PgPool,
    email: EmailService,
    time_source: TimeSource,
}

impl DatabaseNotifier {
    pub fn new(
        pool: PgPool,
        email: EmailService,
        time_source: TimeSource,
    ) -> Self {
        Self {
            pool,
            email,
            time_source,
        }
    }
}

#[async_trait]
impl Notifier for DatabaseNotifier {
    #[tracing::instrument(skip(self, notification), fields(
        auction_id = %notification.auction_id,
        user_id = %notification.winner_user_id,
    ))]
    async fn notify_auction_winner(
        &self,
        notification: &WinnerNotification,
    ) -> anyhow::Result<()> {
        let inserted = sqlx::query(
            "INSERT INTO notifications (
                user_id,
                kind,
                auction_id,
                title,
                body,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, kind, auction_id) DO NOTHING",
        )
        .bind(notification.winner_user_id)
        .bind(AUCTION_WON)
        .bind(notification.auction_id)
        .bind(format!("You won {}", notification.auction_title))
        .bind(format!(
            "Pay {:.2} before {} to claim your item.",
            notification.amount,
            notification.payment_due_at.strftime("%Y-%m-%d %H:%M UTC")
        ))
        .bind(self.time_source.now().to_sqlx())
        .execute(&self.pool)
        .await
        .context("inserting in-app notification")?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!("in-app notification already exists");
        }

        let winner = store::get_user(&notification.winner_user_id, &self.pool)
            .await
            .context("loading winner for email")?;
        self.email
            .send_auction_won_email(
                &winner.email,
                &notification.auction_title,
                notification.amount,
                &notification.payment_link_url,
                notification.payment_due_at,
            )
            .await
    }
}

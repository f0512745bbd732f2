use jiff::Span;
use museum_api::{
    email::EmailService,
    notifier::{DatabaseNotifier, Notifier, WinnerNotification},
    store::{StoreError, auction},
};
use payloads::{
    AuctionId, AuctionStatus, OrderStatus, PaymentStatus, UserId,
};
use rust_decimal::dec;
use test_helpers::{Seller, TestApp, spawn_app};

struct Bidders {
    alice: UserId,
    bob: UserId,
    carol: UserId,
}

async fn bidders(app: &TestApp) -> anyhow::Result<Bidders> {
    Ok(Bidders {
        alice: app.create_user("alice").await?,
        bob: app.create_user("bob").await?,
        carol: app.create_user("carol").await?,
    })
}

/// Move past the auction's end and run one cron cycle.
async fn end_auction(app: &TestApp, auction_id: &AuctionId) -> anyhow::Result<()> {
    let auction = app.auction(auction_id).await?;
    app.time_source.set(auction.end_at + Span::new().seconds(1));
    app.run_auction_cron().await?;
    Ok(())
}

/// Move past the payment deadline and run one cron cycle.
async fn miss_payment(app: &TestApp, auction_id: &AuctionId) -> anyhow::Result<()> {
    let auction = app.auction(auction_id).await?;
    let due = auction.payment_due_at.expect("settled auction has a deadline");
    app.time_source.set(due + Span::new().seconds(1));
    app.run_auction_cron().await?;
    Ok(())
}

async fn open_orders(
    app: &TestApp,
    auction_id: &AuctionId,
) -> anyhow::Result<Vec<museum_api::store::Order>> {
    Ok(app
        .auction_orders(auction_id)
        .await?
        .into_iter()
        .filter(|o| o.status != OrderStatus::Cancelled)
        .collect())
}

async fn seller(app: &TestApp) -> anyhow::Result<Seller> {
    app.create_payable_seller("gallery").await
}

#[tokio::test]
async fn scheduled_auction_activates_at_start() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let now = app.time_source.now();
    let auction_id = app
        .create_auction(
            &seller,
            AuctionStatus::Scheduled,
            now + Span::new().hours(1),
            now + Span::new().hours(5),
            dec!(0),
        )
        .await?;

    let report = app.run_auction_cron().await?;
    assert_eq!(report.activated, 0);
    assert_eq!(app.auction(&auction_id).await?.status, AuctionStatus::Scheduled);

    app.time_source.advance(Span::new().hours(1));
    let report = app.run_auction_cron().await?;
    assert_eq!(report.activated, 1);
    assert_eq!(app.auction(&auction_id).await?.status, AuctionStatus::Active);
    Ok(())
}

#[tokio::test]
async fn ended_auction_is_settled_with_highest_bid() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(250), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.alice, dec!(200)).await?;
    let winning_bid = app.place_bid(&auction_id, &b.bob, dec!(300)).await?;
    app.place_bid(&auction_id, &b.carol, dec!(275)).await?;

    end_auction(&app, &auction_id).await?;

    let settled = app.auction(&auction_id).await?;
    assert_eq!(settled.status, AuctionStatus::Settled);
    assert_eq!(settled.winner_user_id, Some(b.bob));
    assert_eq!(settled.winning_bid_id, Some(winning_bid));
    assert_eq!(
        settled.payment_due_at,
        Some(app.time_source.now() + Span::new().hours(24))
    );

    let order_id = settled.settlement_order_id.unwrap();
    let order = app.order(&order_id).await?;
    assert_eq!(order.user_id, b.bob);
    assert_eq!(order.total_amount, dec!(300));
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Unpaid);
    assert_eq!(order.seller_profile_id, Some(seller.seller_profile_id));
    assert_eq!(
        order.payment_link_id.as_deref(),
        Some(format!("mock-link-{order_id}").as_str())
    );

    let sent = app.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].winner_user_id, b.bob);
    assert_eq!(sent[0].order_id, order_id);
    assert_eq!(sent[0].amount, dec!(300));

    // further cycles change nothing
    let report = app.run_auction_cron().await?;
    assert_eq!(report.settled, 0);
    assert_eq!(app.auction_orders(&auction_id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn tied_bids_go_to_the_earliest() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.carol, dec!(400)).await?;
    app.place_bid(&auction_id, &b.alice, dec!(400)).await?;

    end_auction(&app, &auction_id).await?;

    assert_eq!(app.auction(&auction_id).await?.winner_user_id, Some(b.carol));
    Ok(())
}

#[tokio::test]
async fn auction_without_bid_meeting_reserve_ends_unsold() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(1000), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.alice, dec!(999.99)).await?;

    end_auction(&app, &auction_id).await?;

    let ended = app.auction(&auction_id).await?;
    assert_eq!(ended.status, AuctionStatus::Ended);
    assert_eq!(ended.winner_user_id, None);
    assert_eq!(ended.settlement_order_id, None);
    assert!(app.auction_orders(&auction_id).await?.is_empty());
    assert!(app.notifier.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn unpaid_winner_rolls_over_to_next_bidder() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(300), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.bob, dec!(400)).await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;
    end_auction(&app, &auction_id).await?;
    let first_order_id =
        app.auction(&auction_id).await?.settlement_order_id.unwrap();

    miss_payment(&app, &auction_id).await?;

    let first_order = app.order(&first_order_id).await?;
    assert_eq!(first_order.status, OrderStatus::Cancelled);
    assert_eq!(first_order.payment_status, PaymentStatus::Expired);
    assert_eq!(first_order.cancelled_at, Some(app.time_source.now()));
    assert_eq!(
        app.gateway.links_cancelled(),
        vec![format!("mock-link-{first_order_id}")]
    );

    let rolled = app.auction(&auction_id).await?;
    assert_eq!(rolled.status, AuctionStatus::Settled);
    assert_eq!(rolled.winner_user_id, Some(b.bob));
    let second_order_id = rolled.settlement_order_id.unwrap();
    assert_ne!(second_order_id, first_order_id);
    assert_eq!(
        rolled.payment_due_at,
        Some(app.time_source.now() + Span::new().hours(24))
    );

    let second_order = app.order(&second_order_id).await?;
    assert_eq!(second_order.user_id, b.bob);
    assert_eq!(second_order.total_amount, dec!(400));

    let open = open_orders(&app, &auction_id).await?;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, second_order_id);

    let notified: Vec<_> =
        app.notifier.sent().iter().map(|n| n.winner_user_id).collect();
    assert_eq!(notified, vec![b.alice, b.bob]);
    Ok(())
}

#[tokio::test]
async fn unpaid_winner_without_other_bidders_ends_unsold() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(300), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;
    // below reserve, never eligible
    app.place_bid(&auction_id, &b.bob, dec!(250)).await?;
    end_auction(&app, &auction_id).await?;

    miss_payment(&app, &auction_id).await?;

    let unsold = app.auction(&auction_id).await?;
    assert_eq!(unsold.status, AuctionStatus::Ended);
    assert_eq!(unsold.winner_user_id, None);
    assert_eq!(unsold.winning_bid_id, None);
    assert_eq!(unsold.settlement_order_id, None);
    assert_eq!(unsold.payment_due_at, None);

    // later settlement passes leave it alone
    app.time_source.advance(Span::new().hours(24));
    let report = app.run_auction_cron().await?;
    assert_eq!(report.settled, 0);
    let orders = app.auction_orders(&auction_id).await?;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Cancelled);
    Ok(())
}

#[tokio::test]
async fn rollover_skips_bidders_who_already_failed_to_pay() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.carol, dec!(350)).await?;
    app.place_bid(&auction_id, &b.bob, dec!(300)).await?;
    app.place_bid(&auction_id, &b.bob, dec!(400)).await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;
    end_auction(&app, &auction_id).await?;
    assert_eq!(app.auction(&auction_id).await?.winner_user_id, Some(b.alice));

    miss_payment(&app, &auction_id).await?;
    let second = app.auction(&auction_id).await?;
    assert_eq!(second.winner_user_id, Some(b.bob));
    let bob_order = app.order(&second.settlement_order_id.unwrap()).await?;
    assert_eq!(bob_order.total_amount, dec!(400));

    miss_payment(&app, &auction_id).await?;
    let third = app.auction(&auction_id).await?;
    assert_eq!(third.winner_user_id, Some(b.carol));

    miss_payment(&app, &auction_id).await?;
    let last = app.auction(&auction_id).await?;
    assert_eq!(last.status, AuctionStatus::Ended);
    assert_eq!(last.winner_user_id, None);
    assert!(open_orders(&app, &auction_id).await?.is_empty());
    assert_eq!(app.auction_orders(&auction_id).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn paid_winner_is_not_rolled_over() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.bob, dec!(400)).await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;
    end_auction(&app, &auction_id).await?;
    let order_id = app.auction(&auction_id).await?.settlement_order_id.unwrap();

    app.mark_order_paid(&order_id).await?;
    miss_payment(&app, &auction_id).await?;

    let auction = app.auction(&auction_id).await?;
    assert_eq!(auction.status, AuctionStatus::Settled);
    assert_eq!(auction.winner_user_id, Some(b.alice));
    assert_eq!(auction.settlement_order_id, Some(order_id));
    assert_eq!(app.order(&order_id).await?.status, OrderStatus::Paid);
    assert!(app.gateway.links_cancelled().is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_link_cancellation_does_not_block_rollover() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.bob, dec!(400)).await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;
    end_auction(&app, &auction_id).await?;

    app.gateway.fail_cancellations(true);
    miss_payment(&app, &auction_id).await?;

    assert_eq!(app.auction(&auction_id).await?.winner_user_id, Some(b.bob));
    assert_eq!(open_orders(&app, &auction_id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_payment_link_leaves_auction_for_next_cycle() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;

    app.gateway.fail_payment_links(true);
    let auction = app.auction(&auction_id).await?;
    app.time_source.set(auction.end_at + Span::new().seconds(1));
    let report = app.run_auction_cron().await?;
    assert_eq!(report.closed, 1);
    assert_eq!(report.errors, 1);

    let ended = app.auction(&auction_id).await?;
    assert_eq!(ended.status, AuctionStatus::Ended);
    assert_eq!(ended.winner_user_id, Some(b.alice));
    assert_eq!(ended.settlement_order_id, None);
    assert!(app.auction_orders(&auction_id).await?.is_empty());

    app.gateway.fail_payment_links(false);
    let report = app.run_auction_cron().await?;
    assert_eq!(report.settled, 1);
    assert_eq!(app.auction(&auction_id).await?.status, AuctionStatus::Settled);
    Ok(())
}

#[tokio::test]
async fn failed_notification_does_not_block_settlement() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;

    app.notifier.fail(true);
    end_auction(&app, &auction_id).await?;

    assert_eq!(app.auction(&auction_id).await?.status, AuctionStatus::Settled);
    assert!(app.notifier.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn paused_auction_past_end_is_closed_and_settled() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;
    auction::pause_auction(&auction_id, &app.db_pool).await?;

    let report = {
        let auction = app.auction(&auction_id).await?;
        app.time_source.set(auction.end_at + Span::new().seconds(1));
        app.run_auction_cron().await?
    };
    assert_eq!(report.closed, 1);
    assert_eq!(report.settled, 1);
    assert_eq!(app.auction(&auction_id).await?.status, AuctionStatus::Settled);
    assert_eq!(app.notifier.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn pause_resume_and_cancel_follow_the_lifecycle() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;

    let paused = auction::pause_auction(&auction_id, &app.db_pool).await?;
    assert_eq!(paused.status, AuctionStatus::Paused);
    assert!(matches!(
        auction::pause_auction(&auction_id, &app.db_pool).await,
        Err(StoreError::InvalidAuctionTransition {
            from: AuctionStatus::Paused,
            to: AuctionStatus::Paused,
        })
    ));

    let resumed = auction::resume_auction(&auction_id, &app.db_pool).await?;
    assert_eq!(resumed.status, AuctionStatus::Active);

    let cancelled = auction::cancel_auction(&auction_id, &app.db_pool).await?;
    assert_eq!(cancelled.status, AuctionStatus::Cancelled);
    assert!(
        auction::resume_auction(&auction_id, &app.db_pool)
            .await
            .is_err()
    );

    // cancelled auctions are never closed
    app.time_source.advance(Span::new().hours(3));
    let report = app.run_auction_cron().await?;
    assert_eq!(report.closed, 0);
    assert_eq!(
        app.auction(&auction_id).await?.status,
        AuctionStatus::Cancelled
    );
    Ok(())
}

#[tokio::test]
async fn settling_twice_creates_one_order() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;
    let auction = app.auction(&auction_id).await?;
    app.time_source.set(auction.end_at + Span::new().seconds(1));
    auction::close_auction(&auction_id, &app.db_pool, &app.time_source)
        .await?
        .unwrap();

    let (first, second) = tokio::join!(
        auction::settle_auction(
            &auction_id,
            &app.services,
            &app.db_pool,
            &app.time_source,
        ),
        auction::settle_auction(
            &auction_id,
            &app.services,
            &app.db_pool,
            &app.time_source,
        ),
    );
    let settled = [first?, second?].into_iter().flatten().count();
    assert_eq!(settled, 1);
    assert_eq!(app.auction_orders(&auction_id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn overlapping_cron_runs_do_not_double_settle() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let b = bidders(&app).await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    app.place_bid(&auction_id, &b.alice, dec!(500)).await?;
    let auction = app.auction(&auction_id).await?;
    app.time_source.set(auction.end_at + Span::new().seconds(1));

    let (a, b) = tokio::join!(app.run_auction_cron(), app.run_auction_cron());
    let (a, b) = (a?, b?);
    assert_eq!(a.settled + b.settled, 1);
    assert_eq!(app.auction_orders(&auction_id).await?.len(), 1);
    assert_eq!(app.notifier.sent().len(), 1);
    Ok(())
}

#[tokio::test]
async fn database_notifier_writes_one_notification_per_win() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = seller(&app).await?;
    let winner = app.create_user("alice").await?;
    let auction_id = app
        .create_active_auction(&seller, dec!(100), Span::new().hours(2))
        .await?;
    let order_id = app
        .create_order(
            &winner,
            Some(&seller.seller_profile_id),
            dec!(500),
            OrderStatus::Pending,
            PaymentStatus::Unpaid,
        )
        .await?;

    let notifier = DatabaseNotifier::new(
        app.db_pool.clone(),
        EmailService::new(
            secrecy::SecretBox::new(Box::new("test-api-key".to_string())),
            "test@example.com".into(),
        ),
        app.time_source.clone(),
    );
    let notification = WinnerNotification {
        auction_id,
        auction_title: "Untitled (Blue Study), 1962".into(),
        winner_user_id: winner,
        order_id,
        amount: dec!(500),
        payment_link_url: "https://pay.example.com/abc".into(),
        payment_due_at: app.time_source.now() + Span::new().hours(24),
    };

    notifier.notify_auction_winner(&notification).await?;
    notifier.notify_auction_winner(&notification).await?;

    assert_eq!(app.notification_count(&winner).await?, 1);
    Ok(())
}

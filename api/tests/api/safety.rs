use jiff::Span;
use museum_api::store::payout::{self, PayoutSettings};
use payloads::{OrderStatus, PaymentStatus, SafetyCheckType, UserId};
use rust_decimal::{Decimal, dec};
use test_helpers::{Seller, TestApp, spawn_app};

async fn deliver_with(
    app: &TestApp,
    seller: &Seller,
    buyer: &UserId,
    amount: Decimal,
    settings: &PayoutSettings,
) -> anyhow::Result<(payloads::OrderId, payloads::responses::SellerPayout)> {
    let order_id = app.create_shipped_order(buyer, seller, amount).await?;
    let created = payout::mark_order_delivered(
        &order_id,
        settings,
        &app.db_pool,
        &app.time_source,
    )
    .await?;
    Ok((order_id, created))
}

/// A buyer with enough history not to count as new.
async fn returning_buyer(app: &TestApp, name: &str) -> anyhow::Result<UserId> {
    let buyer = app.create_user(name).await?;
    app.create_purchase_history(&buyer, 3).await?;
    Ok(buyer)
}

#[tokio::test]
async fn first_sale_gets_three_day_hold() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    let buyer = returning_buyer(&app, "ben").await?;

    let (order_id, created) = deliver_with(
        &app,
        &seller,
        &buyer,
        dec!(1000),
        &PayoutSettings::default(),
    )
    .await?;

    assert_eq!(
        created.ready_date,
        app.time_source.now() + Span::new().hours(72)
    );
    assert_eq!(
        app.safety_checks_for_order(&order_id).await?,
        vec![SafetyCheckType::FirstSale]
    );
    assert!(created.notes.unwrap().contains("First sale"));
    Ok(())
}

#[tokio::test]
async fn high_value_order_gets_two_day_hold() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    app.create_paid_payouts(&seller, 2).await?;
    let buyer = returning_buyer(&app, "ben").await?;

    let (order_id, created) = deliver_with(
        &app,
        &seller,
        &buyer,
        dec!(5000.01),
        &PayoutSettings::default(),
    )
    .await?;

    assert_eq!(
        created.ready_date,
        app.time_source.now() + Span::new().hours(48)
    );
    assert_eq!(
        app.safety_checks_for_order(&order_id).await?,
        vec![SafetyCheckType::HighValue]
    );
    Ok(())
}

#[tokio::test]
async fn threshold_amount_is_not_high_value() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    app.create_paid_payouts(&seller, 1).await?;
    let buyer = returning_buyer(&app, "ben").await?;

    let (order_id, created) = deliver_with(
        &app,
        &seller,
        &buyer,
        dec!(5000),
        &PayoutSettings::default(),
    )
    .await?;

    assert_eq!(
        created.ready_date,
        app.time_source.now() + Span::new().hours(24)
    );
    assert!(app.safety_checks_for_order(&order_id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn first_sale_hold_wins_over_high_value() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    let buyer = returning_buyer(&app, "ben").await?;

    let (order_id, created) = deliver_with(
        &app,
        &seller,
        &buyer,
        dec!(8000),
        &PayoutSettings::default(),
    )
    .await?;

    assert_eq!(
        created.ready_date,
        app.time_source.now() + Span::new().hours(72)
    );
    assert_eq!(
        app.safety_checks_for_order(&order_id).await?,
        vec![SafetyCheckType::FirstSale, SafetyCheckType::HighValue]
    );
    let notes = created.notes.unwrap();
    assert!(notes.contains("First sale") && notes.contains("High-value"));
    Ok(())
}

#[tokio::test]
async fn new_buyer_is_logged_without_extending_hold() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    app.create_paid_payouts(&seller, 1).await?;
    let buyer = app.create_user("ben").await?;

    let (order_id, created) = deliver_with(
        &app,
        &seller,
        &buyer,
        dec!(250),
        &PayoutSettings::default(),
    )
    .await?;

    assert_eq!(
        created.ready_date,
        app.time_source.now() + Span::new().hours(24)
    );
    assert_eq!(
        app.safety_checks_for_order(&order_id).await?,
        vec![SafetyCheckType::NewBuyer]
    );
    Ok(())
}

#[tokio::test]
async fn test_mode_overrides_every_hold() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    let buyer = returning_buyer(&app, "ben").await?;
    let settings = PayoutSettings {
        test_mode: true,
        ..Default::default()
    };
    let services = app.services_with(settings.clone());

    let (order_id, created) =
        deliver_with(&app, &seller, &buyer, dec!(9000), &settings).await?;

    assert_eq!(
        created.ready_date,
        app.time_source.now() + Span::new().minutes(2)
    );
    // checks are still recorded
    assert_eq!(
        app.safety_checks_for_order(&order_id).await?.len(),
        2
    );

    app.time_source.advance(Span::new().minutes(2));
    let withdrawal = payout::withdraw_balance(
        &seller.seller_profile_id,
        &services,
        &app.db_pool,
        &app.time_source,
    )
    .await?;
    assert_eq!(withdrawal.amount, dec!(8640));
    Ok(())
}

#[tokio::test]
async fn safety_logs_are_append_only() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    let buyer = returning_buyer(&app, "ben").await?;
    let (order_id, _) = deliver_with(
        &app,
        &seller,
        &buyer,
        dec!(1000),
        &PayoutSettings::default(),
    )
    .await?;

    let update = sqlx::query(
        "UPDATE payout_safety_logs SET passed = true WHERE order_id = $1",
    )
    .bind(order_id)
    .execute(&app.db_pool)
    .await;
    assert!(update.is_err());

    let delete =
        sqlx::query("DELETE FROM payout_safety_logs WHERE order_id = $1")
            .bind(order_id)
            .execute(&app.db_pool)
            .await;
    assert!(delete.is_err());

    assert_eq!(app.safety_checks_for_order(&order_id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_creates_log_each_check_once() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    let buyer = app.create_user("ben").await?;
    let order_id = app
        .create_order(
            &buyer,
            Some(&seller.seller_profile_id),
            dec!(1000),
            OrderStatus::Delivered,
            PaymentStatus::Paid,
        )
        .await?;
    let settings = PayoutSettings::default();

    let (a, b) = tokio::join!(
        payout::create_payout(
            &order_id,
            &settings,
            &app.db_pool,
            &app.time_source,
        ),
        payout::create_payout(
            &order_id,
            &settings,
            &app.db_pool,
            &app.time_source,
        ),
    );
    assert_eq!(a?.id, b?.id);
    assert_eq!(app.seller_payouts(&seller.seller_profile_id).await?.len(), 1);
    assert_eq!(
        app.safety_checks_for_order(&order_id).await?,
        vec![SafetyCheckType::FirstSale, SafetyCheckType::NewBuyer]
    );
    Ok(())
}

#[tokio::test]
async fn failed_safety_log_does_not_block_payout() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let seller = app.create_payable_seller("ana").await?;
    let buyer = returning_buyer(&app, "ben").await?;

    sqlx::raw_sql(
        "CREATE FUNCTION reject_safety_log() RETURNS trigger AS $$
        BEGIN
            RAISE EXCEPTION 'safety log storage unavailable';
        END;
        $$ LANGUAGE plpgsql;

        CREATE TRIGGER reject_safety_log
            BEFORE INSERT ON payout_safety_logs
            FOR EACH ROW EXECUTE FUNCTION reject_safety_log();",
    )
    .execute(&app.db_pool)
    .await?;

    let (order_id, created) = deliver_with(
        &app,
        &seller,
        &buyer,
        dec!(1000),
        &PayoutSettings::default(),
    )
    .await?;

    // the hold still applies even though nothing was logged
    assert_eq!(
        created.ready_date,
        app.time_source.now() + Span::new().hours(72)
    );
    assert!(created.notes.unwrap().contains("First sale"));
    assert_eq!(app.seller_payouts(&seller.seller_profile_id).await?.len(), 1);
    assert!(app.safety_checks_for_order(&order_id).await?.is_empty());
    Ok(())
}

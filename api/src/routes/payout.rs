use actix_web::{HttpResponse, post, web};
use payloads::requests;
use sqlx::PgPool;

use crate::{Services, store, time::TimeSource};

use super::APIError;

#[tracing::instrument(skip(pool, time_source), ret)]
#[post("/seller_balance")]
pub async fn seller_balance(
    details: web::Json<requests::SellerPayouts>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let balance = store::payout::get_seller_balance(
        &details.seller_profile_id,
        &pool,
        &time_source,
    )
    .await?;
    Ok(HttpResponse::Ok().json(balance))
}

#[tracing::instrument(skip(services, pool, time_source), ret)]
#[post("/withdraw_balance")]
pub async fn withdraw_balance(
    details: web::Json<requests::SellerPayouts>,
    services: web::Data<Services>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let withdrawal = store::payout::withdraw_balance(
        &details.seller_profile_id,
        &services,
        &pool,
        &time_source,
    )
    .await?;
    Ok(HttpResponse::Ok().json(withdrawal))
}

#[tracing::instrument(skip(services, pool, time_source), ret)]
#[post("/request_instant_payout")]
pub async fn request_instant_payout(
    details: web::Json<requests::SellerPayouts>,
    services: web::Data<Services>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let payout = store::payout::request_instant_payout(
        &details.seller_profile_id,
        &services,
        &pool,
        &time_source,
    )
    .await?;
    Ok(HttpResponse::Ok().json(payout))
}

#[tracing::instrument(skip(pool))]
#[post("/payout_history")]
pub async fn payout_history(
    details: web::Json<requests::PayoutHistory>,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, APIError> {
    let (limit, offset) = details.page();
    let history = store::payout::get_payout_history(
        &details.seller_profile_id,
        limit,
        offset,
        &pool,
    )
    .await?;
    Ok(HttpResponse::Ok().json(history))
}

#[tracing::instrument(skip(services, pool, time_source), ret)]
#[post("/mark_order_delivered")]
pub async fn mark_order_delivered(
    details: web::Json<requests::MarkOrderDelivered>,
    services: web::Data<Services>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let payout = store::payout::mark_order_delivered(
        &details.order_id,
        &services.payout_settings,
        &pool,
        &time_source,
    )
    .await?;
    Ok(HttpResponse::Ok().json(payout))
}

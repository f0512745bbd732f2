pub mod payout;

use actix_web::{
    HttpResponse, Responder, ResponseError, body::BoxBody,
    dev::HttpServiceFactory, get, web,
};

use crate::store::StoreError;

pub fn api_services() -> impl HttpServiceFactory {
    web::scope("/api")
        .service(health_check)
        .service(payout::seller_balance)
        .service(payout::withdraw_balance)
        .service(payout::request_instant_payout)
        .service(payout::payout_history)
        .service(payout::mark_order_delivered)
}

#[get("/health_check")]
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

#[derive(Debug, thiserror::Error)]
pub enum APIError {
    #[error("Bad request")]
    BadRequest(#[source] anyhow::Error),
    #[error("Not found")]
    NotFound(#[source] anyhow::Error),
    #[error("Conflict")]
    Conflict(#[source] anyhow::Error),
    #[error("Payment provider unavailable")]
    BadGateway(#[source] anyhow::Error),
    #[error("Something went wrong")]
    UnexpectedError(#[from] anyhow::Error),
}

impl ResponseError for APIError {
    fn error_response(&self) -> HttpResponse<BoxBody> {
        match self {
            Self::BadRequest(e) => {
                HttpResponse::BadRequest().body(format!("{self}: {e}"))
            }
            Self::NotFound(e) => {
                HttpResponse::NotFound().body(format!("{self}: {e}"))
            }
            Self::Conflict(e) => {
                HttpResponse::Conflict().body(format!("{self}: {e}"))
            }
            Self::BadGateway(e) => {
                HttpResponse::BadGateway().body(format!("{self}: {e}"))
            }
            Self::UnexpectedError(_) => {
                HttpResponse::InternalServerError().body(self.to_string())
            }
        }
    }
}

impl From<StoreError> for APIError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(_) | StoreError::UnexpectedError(_) => {
                APIError::UnexpectedError(e.into())
            }
            StoreError::OrderNotFound => APIError::NotFound(e.into()),
            StoreError::SellerProfileNotFound => APIError::NotFound(e.into()),
            StoreError::UserNotFound => APIError::NotFound(e.into()),
            StoreError::AuctionNotFound => APIError::NotFound(e.into()),
            StoreError::PayoutConflict => APIError::Conflict(e.into()),
            StoreError::NotUnique(_) => APIError::Conflict(e.into()),
            StoreError::GatewayError(_) => APIError::BadGateway(e.into()),
            StoreError::ExternalTimeout(_) => APIError::BadGateway(e.into()),
            _ => APIError::BadRequest(e.into()),
        }
    }
}

use crate::{requests, responses};
use serde::Serialize;

type ReqwestResult = Result<reqwest::Response, reqwest::Error>;

/// An API client for interfacing with the backend.
pub struct APIClient {
    pub address: String,
    pub inner_client: reqwest::Client,
}

/// Helper methods for http actions
impl APIClient {
    fn format_url(&self, path: &str) -> String {
        format!("{}/api/{path}", &self.address)
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> ReqwestResult {
        self.inner_client
            .post(self.format_url(path))
            .json(body)
            .send()
            .await
    }

    async fn empty_get(&self, path: &str) -> ReqwestResult {
        self.inner_client.get(self.format_url(path)).send().await
    }
}

/// Methods on the backend API
impl APIClient {
    pub async fn health_check(&self) -> Result<(), ClientError> {
        let response = self.empty_get("health_check").await?;
        ok_empty(response).await
    }

    /// Current available, pending and paid totals for a seller.
    pub async fn seller_balance(
        &self,
        details: &requests::SellerPayouts,
    ) -> Result<responses::SellerBalance, ClientError> {
        let response = self.post("seller_balance", details).await?;
        ok_body(response).await
    }

    /// Withdraw every ready payout for a seller.
    pub async fn withdraw_balance(
        &self,
        details: &requests::SellerPayouts,
    ) -> Result<responses::Withdrawal, ClientError> {
        let response = self.post("withdraw_balance", details).await?;
        ok_body(response).await
    }

    /// Withdraw pending payouts early, paying the instant fee.
    pub async fn request_instant_payout(
        &self,
        details: &requests::SellerPayouts,
    ) -> Result<responses::InstantPayout, ClientError> {
        let response = self.post("request_instant_payout", details).await?;
        ok_body(response).await
    }

    pub async fn payout_history(
        &self,
        details: &requests::PayoutHistory,
    ) -> Result<responses::PayoutHistory, ClientError> {
        let response = self.post("payout_history", details).await?;
        ok_body(response).await
    }

    /// Mark an order delivered, which opens its payout.
    pub async fn mark_order_delivered(
        &self,
        details: &requests::MarkOrderDelivered,
    ) -> Result<responses::SellerPayout, ClientError> {
        let response = self.post("mark_order_delivered", details).await?;
        ok_body(response).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An unhandled API error to display, containing response text.
    #[error("{1}")]
    APIError(reqwest::StatusCode, String),
    #[error("Network error. Please check your connection.")]
    Network(#[from] reqwest::Error),
}

/// Deserialize a successful request into the desired type, or return an
/// appropriate error.
pub async fn ok_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    if !response.status().is_success() {
        return Err(ClientError::APIError(
            response.status(),
            response.text().await?,
        ));
    }
    Ok(response.json::<T>().await?)
}

/// Check that an empty response is OK, returning a ClientError if not.
pub async fn ok_empty(response: reqwest::Response) -> Result<(), ClientError> {
    if !response.status().is_success() {
        return Err(ClientError::APIError(
            response.status(),
            response.text().await?,
        ));
    }
    Ok(())
}

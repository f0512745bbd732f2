//! Payment and payout gateway collaborators.
//!
//! Settlement needs payment links for winners; withdrawals need money sent
//! to sellers. Both are behind traits so the implementation is picked once at
//! startup from `PAYOUT_MODE`:
//!
//! - [`SimulatedGateway`] answers in-process after a short delay (demo mode,
//!   local development, tests).
//! - [`XenditGateway`] talks to the Xendit REST API (production).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use payloads::{OrderId, PayoutMode, SellerProfileId};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};

use crate::store::{Order, PayoutDestination, payout::round_money};

const XENDIT_API_BASE: &str = "https://api.xendit.co";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLink {
    pub payment_link_id: String,
    pub checkout_url: String,
}

#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub destination: PayoutDestination,
    pub amount: Decimal,
    pub seller_profile_id: SellerProfileId,
    pub seller_name: String,
    /// Locally generated reference, unique per attempt.
    pub payout_id: String,
    /// Stable for a given set of payouts, so a retry after an ambiguous
    /// failure cannot pay the same payouts twice.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutResult {
    pub success: bool,
    pub reference_id: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_link(
        &self,
        order: &Order,
    ) -> anyhow::Result<PaymentLink>;

    /// Must succeed for links that are already cancelled or expired.
    async fn cancel_payment_link(
        &self,
        payment_link_id: &str,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PayoutGateway: Send + Sync {
    fn mode(&self) -> PayoutMode;

    async fn process_payout(
        &self,
        request: &PayoutRequest,
    ) -> anyhow::Result<PayoutResult>;
}

/// In-process stand-in for the real gateway.
pub struct SimulatedGateway {
    delay: Duration,
    checkout_base_url: String,
}

impl SimulatedGateway {
    pub fn new(delay: Duration, checkout_base_url: String) -> Self {
        Self {
            delay,
            checkout_base_url,
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_payment_link(
        &self,
        order: &Order,
    ) -> anyhow::Result<PaymentLink> {
        Ok(PaymentLink {
            payment_link_id: format!("demo-link-{}", order.id),
            checkout_url: format!(
                "{}/demo-checkout/{}",
                self.checkout_base_url, order.id
            ),
        })
    }

    async fn cancel_payment_link(
        &self,
        payment_link_id: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(payment_link_id, "demo payment link cancelled");
        Ok(())
    }
}

#[async_trait]
impl PayoutGateway for SimulatedGateway {
    fn mode(&self) -> PayoutMode {
        PayoutMode::Demo
    }

    #[tracing::instrument(skip(self, request), fields(payout_id = %request.payout_id))]
    async fn process_payout(
        &self,
        request: &PayoutRequest,
    ) -> anyhow::Result<PayoutResult> {
        tokio::time::sleep(self.delay).await;
        tracing::info!(
            amount = %request.amount,
            method = %request.destination.method,
            "demo payout simulated"
        );
        Ok(PayoutResult {
            success: true,
            reference_id: format!("DEMO-{}", request.payout_id),
            status: "SUCCEEDED".into(),
        })
    }
}

/// Xendit invoices (payment links) and payouts.
pub struct XenditGateway {
    client: reqwest::Client,
    secret_key: SecretBox<String>,
    currency: String,
    base_url: String,
}

impl XenditGateway {
    pub fn new(secret_key: SecretBox<String>, currency: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key,
            currency,
            base_url: XENDIT_API_BASE.into(),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .basic_auth(self.secret_key.expose_secret(), Some(""))
    }
}

#[derive(Serialize)]
struct CreateInvoice<'a> {
    external_id: OrderId,
    amount: f64,
    currency: &'a str,
    description: String,
}

#[derive(Deserialize)]
struct Invoice {
    id: String,
    invoice_url: String,
}

#[derive(Serialize)]
struct CreatePayout<'a> {
    reference_id: &'a str,
    channel_code: &'a str,
    channel_properties: ChannelProperties<'a>,
    amount: f64,
    currency: &'a str,
    description: String,
}

#[derive(Serialize)]
struct ChannelProperties<'a> {
    account_holder_name: &'a str,
    account_number: &'a str,
}

#[derive(Deserialize)]
struct Payout {
    id: String,
    status: String,
}

fn to_gateway_amount(amount: Decimal) -> anyhow::Result<f64> {
    round_money(amount)
        .to_f64()
        .with_context(|| format!("amount {amount} is not representable"))
}

#[async_trait]
impl PaymentGateway for XenditGateway {
    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_payment_link(
        &self,
        order: &Order,
    ) -> anyhow::Result<PaymentLink> {
        let body = CreateInvoice {
            external_id: order.id,
            amount: to_gateway_amount(order.total_amount)?,
            currency: &self.currency,
            description: format!("Auction order {}", order.id),
        };
        let invoice = self
            .post("/v2/invoices")
            .json(&body)
            .send()
            .await
            .context("sending invoice request")?
            .error_for_status()
            .context("creating invoice")?
            .json::<Invoice>()
            .await
            .context("decoding invoice response")?;

        Ok(PaymentLink {
            payment_link_id: invoice.id,
            checkout_url: invoice.invoice_url,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_payment_link(
        &self,
        payment_link_id: &str,
    ) -> anyhow::Result<()> {
        let response = self
            .post(&format!("/invoices/{payment_link_id}/expire!"))
            .send()
            .await
            .context("sending invoice expiry request")?;

        // already expired, paid or unknown invoices are not errors here
        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            tracing::info!(
                status = %response.status(),
                "invoice was not open; treating as cancelled"
            );
            return Ok(());
        }
        response.error_for_status().context("expiring invoice")?;
        Ok(())
    }
}

#[async_trait]
impl PayoutGateway for XenditGateway {
    fn mode(&self) -> PayoutMode {
        PayoutMode::Production
    }

    #[tracing::instrument(skip(self, request), fields(payout_id = %request.payout_id))]
    async fn process_payout(
        &self,
        request: &PayoutRequest,
    ) -> anyhow::Result<PayoutResult> {
        let destination = &request.destination;
        let channel_code = destination
            .channel_code
            .as_deref()
            .unwrap_or(destination.method.as_str());
        let body = CreatePayout {
            reference_id: &request.payout_id,
            channel_code,
            channel_properties: ChannelProperties {
                account_holder_name: destination
                    .account_name
                    .as_deref()
                    .unwrap_or(request.seller_name.as_str()),
                account_number: destination
                    .account_number
                    .as_deref()
                    .context("payout destination has no account number")?,
            },
            amount: to_gateway_amount(request.amount)?,
            currency: &self.currency,
            description: format!(
                "Seller payout {} for {}",
                request.payout_id, request.seller_profile_id
            ),
        };

        let response = self
            .post("/v2/payouts")
            .header("Idempotency-key", &request.idempotency_key)
            .json(&body)
            .send()
            .await
            .context("sending payout request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Ok(PayoutResult {
                success: false,
                reference_id: request.payout_id.clone(),
                status: format!("{status}: {text}"),
            });
        }

        let payout = response
            .json::<Payout>()
            .await
            .context("decoding payout response")?;
        Ok(PayoutResult {
            success: !matches!(
                payout.status.as_str(),
                "FAILED" | "CANCELLED" | "REVERSED"
            ),
            reference_id: payout.id,
            status: payout.status,
        })
    }
}

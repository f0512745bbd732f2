use std::{sync::Arc, time::Duration};

use anyhow::Context;
use payloads::PayoutMode;
use secrecy::{ExposeSecret, SecretBox};
use sqlx::PgPool;

use crate::{
    Config,
    email::EmailService,
    gateway::{PaymentGateway, PayoutGateway, SimulatedGateway, XenditGateway},
    notifier::{DatabaseNotifier, Notifier},
    store::{auction::AuctionSettings, payout::PayoutSettings},
    time::TimeSource,
};

/// External collaborators and settings shared by the routes and the
/// scheduler.
///
/// The gateways are picked once from `PAYOUT_MODE` at startup; nothing
/// downstream branches on the mode.
#[derive(Clone)]
pub struct Services {
    pub payments: Arc<dyn PaymentGateway>,
    pub payouts: Arc<dyn PayoutGateway>,
    pub notifier: Arc<dyn Notifier>,
    /// Upper bound on every gateway and notifier call.
    pub external_timeout: Duration,
    pub payout_settings: PayoutSettings,
    pub auction_settings: AuctionSettings,
}

impl Services {
    pub fn from_config(
        config: &Config,
        pool: &PgPool,
        time_source: &TimeSource,
    ) -> anyhow::Result<Self> {
        let payments: Arc<dyn PaymentGateway>;
        let payouts: Arc<dyn PayoutGateway>;
        match config.payout_mode {
            PayoutMode::Demo => {
                let gateway = Arc::new(SimulatedGateway::new(
                    config.demo_payout_delay,
                    config.base_url.clone(),
                ));
                payments = gateway.clone();
                payouts = gateway;
            }
            PayoutMode::Production => {
                let key = config.xendit_secret_key.as_ref().context(
                    "XENDIT_SECRET_KEY is required in production mode",
                )?;
                let gateway = Arc::new(XenditGateway::new(
                    SecretBox::new(Box::new(key.expose_secret().clone())),
                    config.xendit_currency.clone(),
                ));
                payments = gateway.clone();
                payouts = gateway;
            }
        }

        let email = EmailService::new(
            SecretBox::new(Box::new(
                config.email_api_key.expose_secret().clone(),
            )),
            config.email_from_address.clone(),
        );
        let notifier = Arc::new(DatabaseNotifier::new(
            pool.clone(),
            email,
            time_source.clone(),
        ));

        tracing::info!(mode = %config.payout_mode, "payout gateway selected");
        Ok(Self {
            payments,
            payouts,
            notifier,
            external_timeout: config.external_timeout,
            payout_settings: config.payout_settings.clone(),
            auction_settings: config.auction_settings.clone(),
        })
    }
}

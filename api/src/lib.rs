pub mod email;
pub mod gateway;
pub mod notifier;
pub mod routes;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod telemetry;
pub mod time;

pub use services::Services;

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::{App, HttpServer, web};
use anyhow::Context;
use payloads::PayoutMode;
use secrecy::SecretBox;
use sqlx::PgPool;
use std::net::TcpListener;
use std::time::Duration;

use crate::store::{
    auction::{AuctionSettings, DEFAULT_PAYMENT_WINDOW_HOURS},
    payout::{DEFAULT_TEST_HOLD_MINUTES, PayoutSettings},
    safety::HoldPeriod,
};
use crate::time::TimeSource;

/// Build the server, but not await it.
///
/// Returns the port that the server has bound to by modifying the config.
pub async fn build(
    config: &mut Config,
    db_pool: PgPool,
    time_source: TimeSource,
    services: Services,
) -> std::io::Result<Server> {
    let db_pool = web::Data::new(db_pool);
    let time_source = web::Data::new(time_source);
    let services = web::Data::new(services);

    let allowed_origins = config.allowed_origins.clone();

    // OS assigns the port if binding to 0
    let listener = TcpListener::bind(format!("{}:{}", config.ip, config.port))?;
    config.port = listener.local_addr()?.port();
    let server = HttpServer::new(move || {
        let cors = if allowed_origins.iter().any(|o| o == "*") {
            Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
        } else {
            let mut cors = Cors::default().allow_any_method().allow_any_header();
            for origin in &allowed_origins {
                cors = cors.allowed_origin(origin);
            }
            cors
        };

        App::new()
            .wrap(cors)
            .service(routes::api_services())
            .app_data(db_pool.clone())
            .app_data(time_source.clone())
            .app_data(services.clone())
    })
    .listen(listener)?
    .run();
    Ok(server)
}

pub struct Config {
    pub database_url: String,
    /// set to "0.0.0.0" for public access, "127.0.0.1" for local dev
    pub ip: String,
    /// set to 0 to get an os-assigned port
    pub port: u16,
    /// List of allowed CORS origins. Use "*" to allow any origin (development only)
    pub allowed_origins: Vec<String>,
    /// Prefix for links in emails and demo checkout pages.
    pub base_url: String,
    pub email_api_key: SecretBox<String>,
    pub email_from_address: String,
    pub payout_mode: PayoutMode,
    /// Required when `payout_mode` is production.
    pub xendit_secret_key: Option<SecretBox<String>>,
    pub xendit_currency: String,
    pub payout_settings: PayoutSettings,
    pub auction_settings: AuctionSettings,
    pub auction_cron_interval: Duration,
    pub payout_cron_interval: Duration,
    pub external_timeout: Duration,
    pub demo_payout_delay: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse the configuration from any key/value source.
    pub fn from_lookup(
        var: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let required = |key: &str| {
            var(key).with_context(|| format!("{key} must be set"))
        };
        let parsed = |key: &str, default: i64| -> anyhow::Result<i64> {
            match var(key) {
                Some(value) => value
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} is not a number: {value}")),
                None => Ok(default),
            }
        };
        let positive = |key: &str, default: i64| -> anyhow::Result<i64> {
            let value = parsed(key, default)?;
            anyhow::ensure!(value > 0, "{key} must be positive, got {value}");
            Ok(value)
        };
        let seconds = |key: &str, default: i64| -> anyhow::Result<Duration> {
            let secs = parsed(key, default)?;
            Ok(Duration::from_secs(secs.max(0) as u64))
        };

        let allowed_origins = var("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let payout_mode = match var("PAYOUT_MODE") {
            Some(mode) => {
                mode.parse::<PayoutMode>().map_err(anyhow::Error::msg)?
            }
            None => PayoutMode::default(),
        };
        let xendit_secret_key = var("XENDIT_SECRET_KEY")
            .filter(|k| !k.trim().is_empty())
            .map(|k| SecretBox::new(Box::new(k)));
        if payout_mode == PayoutMode::Production && xendit_secret_key.is_none()
        {
            anyhow::bail!(
                "XENDIT_SECRET_KEY must be set when PAYOUT_MODE=production"
            );
        }

        let test_mode = var("PAYOUT_TEST_MODE")
            .is_some_and(|v| matches!(v.trim(), "true" | "1"));
        if test_mode && payout_mode == PayoutMode::Production {
            tracing::warn!("PAYOUT_TEST_MODE is enabled in production mode");
        }

        let payout_settings = PayoutSettings {
            test_mode,
            test_hold_minutes: positive(
                "PAYOUT_TEST_HOLD_MINUTES",
                DEFAULT_TEST_HOLD_MINUTES,
            )?,
            ..Default::default()
        };
        HoldPeriod::Test
            .span(&payout_settings)
            .context("PAYOUT_TEST_HOLD_MINUTES is out of range")?;
        let auction_settings = AuctionSettings {
            payment_window_hours: positive(
                "AUCTION_PAYMENT_WINDOW_HOURS",
                DEFAULT_PAYMENT_WINDOW_HOURS,
            )?,
        };
        auction_settings
            .payment_window()
            .context("AUCTION_PAYMENT_WINDOW_HOURS is out of range")?;

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            ip: required("IP_ADDRESS")?,
            port: required("PORT")?.parse().context("PORT is not a port")?,
            allowed_origins,
            base_url: var("BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            email_api_key: SecretBox::new(Box::new(required("EMAIL_API_KEY")?)),
            email_from_address: required("EMAIL_FROM_ADDRESS")?,
            payout_mode,
            xendit_secret_key,
            xendit_currency: var("XENDIT_CURRENCY")
                .unwrap_or_else(|| "PHP".to_string()),
            payout_settings,
            auction_settings,
            auction_cron_interval: seconds("AUCTION_CRON_INTERVAL_SECS", 300)?,
            payout_cron_interval: seconds("PAYOUT_CRON_INTERVAL_SECS", 3600)?,
            external_timeout: seconds("EXTERNAL_CALL_TIMEOUT_SECS", 10)?,
            demo_payout_delay: Duration::from_millis(
                parsed("DEMO_PAYOUT_DELAY_MS", 500)?.max(0) as u64,
            ),
        })
    }
}

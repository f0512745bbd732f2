//! In-process stand-ins for the payment gateway and the winner notifier.
//!
//! Both record every call so tests can assert on what would have been sent,
//! and both can be switched into failure modes to exercise rollback and
//! best-effort paths.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use museum_api::{
    gateway::{
        PaymentGateway, PaymentLink, PayoutGateway, PayoutRequest,
        PayoutResult,
    },
    notifier::{Notifier, WinnerNotification},
    store::Order,
};
use payloads::{OrderId, PayoutMode};

#[derive(Default)]
struct GatewayState {
    payouts: Vec<PayoutRequest>,
    links_created: Vec<OrderId>,
    links_cancelled: Vec<String>,
    fail_payouts: bool,
    fail_payment_links: bool,
    fail_cancellations: bool,
    payout_delay: Duration,
}

#[derive(Default)]
pub struct MockGateway {
    state: Mutex<GatewayState>,
}

impl MockGateway {
    /// Payout calls return an error until switched back.
    pub fn fail_payouts(&self, fail: bool) {
        self.state.lock().unwrap().fail_payouts = fail;
    }

    pub fn fail_payment_links(&self, fail: bool) {
        self.state.lock().unwrap().fail_payment_links = fail;
    }

    pub fn fail_cancellations(&self, fail: bool) {
        self.state.lock().unwrap().fail_cancellations = fail;
    }

    /// Make payout calls take this long, e.g. to trip the call timeout.
    pub fn set_payout_delay(&self, delay: Duration) {
        self.state.lock().unwrap().payout_delay = delay;
    }

    pub fn payouts(&self) -> Vec<PayoutRequest> {
        self.state.lock().unwrap().payouts.clone()
    }

    pub fn links_created(&self) -> Vec<OrderId> {
        self.state.lock().unwrap().links_created.clone()
    }

    pub fn links_cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().links_cancelled.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_payment_link(
        &self,
        order: &Order,
    ) -> anyhow::Result<PaymentLink> {
        let mut state = self.state.lock().unwrap();
        if state.fail_payment_links {
            anyhow::bail!("mock payment link failure");
        }
        state.links_created.push(order.id);
        Ok(PaymentLink {
            payment_link_id: format!("mock-link-{}", order.id),
            checkout_url: format!("https://pay.example.com/{}", order.id),
        })
    }

    async fn cancel_payment_link(
        &self,
        payment_link_id: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_cancellations {
            anyhow::bail!("mock cancellation failure");
        }
        state.links_cancelled.push(payment_link_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl PayoutGateway for MockGateway {
    fn mode(&self) -> PayoutMode {
        PayoutMode::Demo
    }

    async fn process_payout(
        &self,
        request: &PayoutRequest,
    ) -> anyhow::Result<PayoutResult> {
        let (fail, delay) = {
            let mut state = self.state.lock().unwrap();
            state.payouts.push(request.clone());
            (state.fail_payouts, state.payout_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            anyhow::bail!("mock payout failure");
        }
        Ok(PayoutResult {
            success: true,
            reference_id: format!("MOCK-{}", request.payout_id),
            status: "SUCCEEDED".into(),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<WinnerNotification>>,
    fail: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<WinnerNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_auction_winner(
        &self,
        notification: &WinnerNotification,
    ) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("mock notifier failure");
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

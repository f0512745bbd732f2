#[cfg(not(feature = "mock-email"))]
use anyhow::Context;
use anyhow::Result;
use jiff::Timestamp;
#[cfg(not(feature = "mock-email"))]
use resend_rs::{Resend, types::CreateEmailBaseOptions};
use rust_decimal::Decimal;
#[cfg(not(feature = "mock-email"))]
use secrecy::ExposeSecret;
use secrecy::SecretBox;

pub struct EmailService {
    #[cfg(not(feature = "mock-email"))]
    client: Resend,
    from_address: String,
}

#[derive(Debug)]
pub struct EmailTemplate {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

impl EmailService {
    #[cfg(not(feature = "mock-email"))]
    pub fn new(api_key: SecretBox<String>, from_address: String) -> Self {
        let client = Resend::new(api_key.expose_secret());
        Self {
            client,
            from_address,
        }
    }

    #[cfg(feature = "mock-email")]
    pub fn new(_api_key: SecretBox<String>, from_address: String) -> Self {
        Self { from_address }
    }

    #[tracing::instrument(skip(self, template), fields(to = %to_email))]
    #[cfg(not(feature = "mock-email"))]
    pub async fn send_email(
        &self,
        to_email: &str,
        template: EmailTemplate,
    ) -> Result<()> {
        let email = CreateEmailBaseOptions::new(
            &self.from_address,
            [to_email],
            &template.subject,
        )
        .with_html(&template.html_body)
        .with_text(&template.text_body);

        self.client
            .emails
            .send(email)
            .await
            .context("Failed to send email via Resend")?;

        tracing::info!("Email sent successfully");
        Ok(())
    }

    #[tracing::instrument(skip(self, template), fields(to = %to_email))]
    #[cfg(feature = "mock-email")]
    pub async fn send_email(
        &self,
        to_email: &str,
        template: EmailTemplate,
    ) -> Result<()> {
        tracing::info!(
            "Test mode: Mock email sent to: {} from: {} with subject: {}",
            to_email,
            self.from_address,
            template.subject
        );
        Ok(())
    }

    /// Tell an auction winner what they owe and where to pay.
    #[tracing::instrument(skip(self))]
    pub async fn send_auction_won_email(
        &self,
        to_email: &str,
        auction_title: &str,
        amount: Decimal,
        payment_link_url: &str,
        payment_due_at: Timestamp,
    ) -> Result<()> {
        let due = payment_due_at.strftime("%Y-%m-%d %H:%M UTC");
        let template = EmailTemplate {
            subject: format!("You won the auction for {auction_title}"),
            html_body: format!(
                r#"
                <h2>Congratulations!</h2>
                <p>Your bid of <strong>{amount:.2}</strong> won the auction for <strong>{auction_title}</strong>.</p>
                <p><a href="{payment_link_url}" style="background-color: #007bff; color: white; padding: 10px 20px; text-decoration: none; border-radius: 5px;">Complete payment</a></p>
                <p>Or copy and paste this link in your browser:</p>
                <p>{payment_link_url}</p>
                <p>Please pay before {due}. If payment is not received in time, the item will be offered to the next highest bidder.</p>
                "#
            ),
            text_body: format!(
                r#"
Congratulations!

Your bid of {amount:.2} won the auction for {auction_title}.

Complete your payment here:

{payment_link_url}

Please pay before {due}. If payment is not received in time, the item will be offered to the next highest bidder.
                "#
            ),
        };

        self.send_email(to_email, template).await
    }
}

use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::models::Decision;

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_verification_email(
        &self,
        to_email: &str,
        verification_token: &str,
        base_url: &str,
    ) -> Result<(), AppError>;

    async fn send_decision_email(
        &self,
        to_email: &str,
        login: &str,
        decision: Decision,
        notes: Option<&str>,
    ) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct EmailService {
    mailer: SmtpTransport,
    from_email: String,
}

impl EmailService {
    pub fn new(config: &crate::config::GmailConfig) -> Result<Self, AppError> {
        let creds = Credentials::new(config.user.clone(), config.app_password.clone());

        let mailer = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e.to_string())))?
            .credentials(creds)
            .port(587)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.smtp_host, "Email service initialized");

        Ok(Self {
            mailer,
            from_email: config.user.clone(),
        })
    }

    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        plain_body: &str,
        html_body: &str,
    ) -> Result<(), AppError> {
        let email = Message::builder()
            .from(
                self.from_email
                    .parse()
                    .map_err(|e: lettre::address::AddressError| AppError::EmailError(e.to_string()))?,
            )
            .to(to_email
                .parse()
                .map_err(|e: lettre::address::AddressError| AppError::EmailError(e.to_string()))?)
            .subject(subject)
            .multipart(
                lettre::message::MultiPart::alternative()
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body.to_string()),
                    )
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body.to_string()),
                    ),
            )
            .map_err(|e| AppError::EmailError(e.to_string()))?;

        // SMTP transport is blocking
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AppError::InternalError(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!(to = %to_email, subject = %subject, "Email sent successfully");
                Ok(())
            }
            Err(e) => Err(AppError::EmailError(e.to_string())),
        }
    }
}

#[async_trait]
impl EmailProvider for EmailService {
    async fn send_verification_email(
        &self,
        to_email: &str,
        verification_token: &str,
        base_url: &str,
    ) -> Result<(), AppError> {
        let link = format!("{}/verify-email?token={}", base_url, verification_token);

        let html_body = format!(
            r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Confirm your email address</h2>
        <p>Please confirm the address you registered with the records portal:</p>
        <p><a href="{link}">Verify email</a></p>
        <p style="color: #666; font-size: 12px;">
            Only the most recent link we sent you works. If you did not register, ignore this message.
        </p>
    </body>
</html>"###
        );

        let plain_body = format!(
            "Confirm your email address\n\nPlease open the following link to verify the address you registered with the records portal:\n\n{link}\n\nOnly the most recent link we sent you works. If you did not register, ignore this message."
        );

        self.send_email(to_email, "Verify your email address", &plain_body, &html_body)
            .await
    }

    async fn send_decision_email(
        &self,
        to_email: &str,
        login: &str,
        decision: Decision,
        notes: Option<&str>,
    ) -> Result<(), AppError> {
        let (subject, headline) = match decision {
            Decision::Approved => (
                "Your portal account was approved",
                "Your account has been approved. You can now sign in.",
            ),
            Decision::Rejected => (
                "Your portal registration was not approved",
                "Your account registration was not approved.",
            ),
        };
        let notes_line = notes
            .map(|n| format!("\n\nReviewer notes: {}", n))
            .unwrap_or_default();

        let plain_body = format!("Hello {login},\n\n{headline}{notes_line}");
        let html_body = format!(
            "<html><body style=\"font-family: Arial, sans-serif;\"><p>Hello {login},</p><p>{headline}</p>{}</body></html>",
            notes
                .map(|n| format!("<p>Reviewer notes: {}</p>", n))
                .unwrap_or_default()
        );

        self.send_email(to_email, subject, &plain_body, &html_body)
            .await
    }
}

/// Writes outgoing mail to the log. Used when no SMTP account is configured in dev.
pub struct LogOnlyEmailService;

#[async_trait]
impl EmailProvider for LogOnlyEmailService {
    async fn send_verification_email(
        &self,
        to_email: &str,
        verification_token: &str,
        base_url: &str,
    ) -> Result<(), AppError> {
        tracing::info!(
            to = %to_email,
            link = %format!("{}/verify-email?token={}", base_url, verification_token),
            "Verification email (not sent)"
        );
        Ok(())
    }

    async fn send_decision_email(
        &self,
        to_email: &str,
        login: &str,
        decision: Decision,
        _notes: Option<&str>,
    ) -> Result<(), AppError> {
        tracing::info!(to = %to_email, login, decision = decision.as_str(), "Decision email (not sent)");
        Ok(())
    }
}

/// What a mock delivery captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentEmail {
    Verification { to: String, token: String },
    Decision { to: String, decision: Decision },
}

/// Records messages instead of sending them. Can be switched into failure mode.
#[derive(Default)]
pub struct MockEmailService {
    sent: Mutex<Vec<SentEmail>>,
    failing: AtomicBool,
}

impl MockEmailService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Token from the most recent verification email sent to `to`.
    pub fn last_verification_token(&self, to: &str) -> Option<String> {
        self.sent().into_iter().rev().find_map(|m| match m {
            SentEmail::Verification { to: addr, token } if addr == to => Some(token),
            _ => None,
        })
    }

    fn record(&self, message: SentEmail) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::EmailError("mock delivery failure".to_string()));
        }
        self.sent
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mock mailbox poisoned: {}", e)))?
            .push(message);
        Ok(())
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_verification_email(
        &self,
        to_email: &str,
        verification_token: &str,
        _base_url: &str,
    ) -> Result<(), AppError> {
        self.record(SentEmail::Verification {
            to: to_email.to_string(),
            token: verification_token.to_string(),
        })
    }

    async fn send_decision_email(
        &self,
        to_email: &str,
        _login: &str,
        decision: Decision,
        _notes: Option<&str>,
    ) -> Result<(), AppError> {
        self.record(SentEmail::Decision {
            to: to_email.to_string(),
            decision,
        })
    }
}

//! Nudge message composition and delivery channels.
//!
//! In-app delivery is the notification row itself flipping to `sent`.
//! Email is best-effort through the [`Mailer`] trait: failures log and
//! never revert the sent state.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Compose the nudge text for a starting task.
pub fn compose_message(title: &str, is_critical: bool, is_urgent: bool) -> String {
    if is_critical {
        format!("🔴 CRITICAL: {title} is starting now")
    } else if is_urgent {
        format!("⚠️ URGENT: {title} is starting now")
    } else {
        format!("📋 {title} is starting now")
    }
}

/// Errors from email dispatch.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Address or message construction failed.
    #[error("mail build error: {0}")]
    Build(String),

    /// SMTP transport failure.
    #[error("mail send error: {0}")]
    Send(String),
}

/// Best-effort email dispatch.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns [`MailError`]; callers log and continue.
    async fn send(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        html: &str,
        text: &str,
    ) -> Result<(), MailError>;
}

/// SMTP relay mailer.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer").finish_non_exhaustive()
    }
}

impl SmtpMailer {
    /// Connect to an SMTP relay with STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::Build`] when the relay host is invalid.
    pub fn new(host: &str, port: u16) -> Result<Self, MailError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| MailError::Build(e.to_string()))?
            .port(port)
            .build();
        Ok(Self { transport })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        html: &str,
        text: &str,
    ) -> Result<(), MailError> {
        let from: Mailbox = from.parse().map_err(|e| MailError::Build(format!("{e}")))?;
        let to: Mailbox = to.parse().map_err(|e| MailError::Build(format!("{e}")))?;
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(
                text.to_owned(),
                html.to_owned(),
            ))
            .map_err(|e| MailError::Build(e.to_string()))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Send(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_wins_over_urgent() {
        let message = compose_message("Deploy fix", true, true);
        assert_eq!(message, "🔴 CRITICAL: Deploy fix is starting now");
    }

    #[test]
    fn test_urgent_variant() {
        let message = compose_message("Call bank", false, true);
        assert_eq!(message, "⚠️ URGENT: Call bank is starting now");
    }

    #[test]
    fn test_plain_variant() {
        let message = compose_message("Water plants", false, false);
        assert_eq!(message, "📋 Water plants is starting now");
    }
}

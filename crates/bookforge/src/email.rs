//! Narrow mail seam. Delivery itself lives outside this crate; terminal
//! job outcomes hand a rendered message to whatever implementation the
//! embedding application registered.

use thiserror::Error;

#[derive(Error, Debug)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Logs instead of delivering. Useful for development and as the default
/// when no real mailer is configured.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        log::info!("mail to {}: {} ({} chars)", to, subject, body.len());
        Ok(())
    }
}

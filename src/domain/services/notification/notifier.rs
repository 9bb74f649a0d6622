use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("No recipients configured")]
    NoRecipients,
    #[error("Failed to deliver email: {0}")]
    Transport(String),
}

/// Sends a notification to a list of recipients.
///
/// How the message is rendered and transported (SMTP, an HTTP mail API, ...) is up to the
/// implementation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    /// Local part of `from`, shown as the sender name
    pub from_name: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl Email {
    pub fn new(from: &str, to: &[String], subject: &str, body: &str) -> Self {
        Self {
            from: from.to_owned(),
            from_name: from.split('@').next().unwrap_or(from).to_owned(),
            to: to.to_vec(),
            subject: subject.to_owned(),
            body: body.to_owned(),
        }
    }
}

/// Notifier that writes emails to the log instead of sending them
pub struct LogNotifier {
    from: String,
    sent: Mutex<Vec<Email>>,
}

impl LogNotifier {
    pub fn new(from: &str) -> Self {
        Self {
            from: from.to_owned(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError> {
        if recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }

        let email = Email::new(&self.from, recipients, subject, body);
        info!(
            "email from {} <{}> to {}: {} | {}",
            email.from_name,
            email.from,
            email.to.join(", "),
            email.subject,
            email.body
        );
        self.sent.lock().push(email);
        Ok(())
    }
}

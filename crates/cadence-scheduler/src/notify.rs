use tracing::info;

use crate::error::NotifyError;

/// Delivers a finished run's output to a job's subscribers.
///
/// Recipients are mailbox-form addresses (`"Full Name" <email>`). The engine
/// logs a returned error and carries on; a failed delivery never undoes the
/// log write that preceded it.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Records each notification as a structured `tracing` event.
#[derive(Debug, Clone)]
pub struct TracingNotifier {
    sender: String,
}

impl TracingNotifier {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
        }
    }
}

impl Notifier for TracingNotifier {
    fn notify(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), NotifyError> {
        if let Some(bad) = recipients.iter().find(|r| !r.contains('@')) {
            return Err(NotifyError::InvalidRecipient(bad.clone()));
        }
        info!(
            sender = %self.sender,
            recipients = %recipients.join(", "),
            %subject,
            body_len = body.len(),
            "notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_notifier_accepts_mailboxes() {
        let notifier = TracingNotifier::new("cadence <cadence@localhost>");
        let recipients = vec!["\"Ada\" <ada@example.com>".to_string()];
        assert!(notifier.notify(&recipients, "s", "b").is_ok());
    }

    #[test]
    fn tracing_notifier_rejects_addresses_without_domain() {
        let notifier = TracingNotifier::new("cadence");
        let recipients = vec!["\"Nobody\" <>".to_string()];
        assert!(matches!(
            notifier.notify(&recipients, "s", "b"),
            Err(NotifyError::InvalidRecipient(_))
        ));
    }
}

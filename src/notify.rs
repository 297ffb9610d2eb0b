//! User-facing notifications.
//!
//! Desktop notification delivery lives outside this crate. The host only
//! reports through this trait, e.g. when an extension gets disabled.

/// Result type for notification delivery
pub type NotifyResult = Result<(), String>;

pub trait Notifier: Send + Sync {
    /// Show a notification to the user.
    fn show_notification(&self, title: &str, body: &str) -> NotifyResult;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show_notification(&self, title: &str, body: &str) -> NotifyResult {
        tracing::warn!(title, "{}", body);
        Ok(())
    }
}

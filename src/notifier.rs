//! Formats notifications for chat and delivers them with retries.
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::telegram::ChatApi;
use crate::validation::NewNotification;

pub const MAX_MESSAGE_LENGTH: usize = 4096;
const ELLIPSIS: &str = "...";
const INFO_MARKER: &str = "📢";
const ERROR_MARKER: &str = "❌";

#[derive(Clone)]
pub struct Notifier {
    chat: Arc<dyn ChatApi>,
    max_attempts: u32,
    backoff_unit: Duration,
}

impl Notifier {
    pub fn new(chat: Arc<dyn ChatApi>, max_attempts: u32) -> Self {
        Self {
            chat,
            max_attempts: max_attempts.max(1),
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// Scales every backoff delay; the nominal unit is one second.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Delivers `message`, retrying with exponential backoff. Never fails the
    /// caller: the result only says whether the chat service confirmed it.
    pub async fn send(&self, message: &str) -> bool {
        let text = truncate_message(message);
        if let Cow::Owned(_) = text {
            warn!(
                original_chars = message.chars().count(),
                max_chars = MAX_MESSAGE_LENGTH,
                "Message truncated before delivery"
            );
        }

        for attempt in 0..self.max_attempts {
            match self.chat.send_message(&text).await {
                Ok(()) => {
                    info!(attempt = attempt + 1, "Notification delivered");
                    return true;
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        "Notification delivery failed: {}",
                        e
                    );
                }
            }
            if attempt + 1 < self.max_attempts {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        warn!(attempts = self.max_attempts, "Giving up on notification delivery");
        false
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Builds the chat text for a stored notification.
pub fn format_message(notification: &NewNotification) -> String {
    let marker = if notification.error {
        ERROR_MARKER
    } else {
        INFO_MARKER
    };
    if notification.event.is_empty() {
        format!("{} {}: {}", marker, notification.service, notification.message)
    } else {
        format!(
            "{} {} [{}]: {}",
            marker, notification.service, notification.event, notification.message
        )
    }
}

/// Caps the message at `MAX_MESSAGE_LENGTH` characters, ellipsis included.
pub fn truncate_message(message: &str) -> Cow<'_, str> {
    if message.chars().count() <= MAX_MESSAGE_LENGTH {
        return Cow::Borrowed(message);
    }
    let keep = MAX_MESSAGE_LENGTH - ELLIPSIS.chars().count();
    let mut out: String = message.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::DeliveryError;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Fails the first `failures` calls, then succeeds. Records when each call happened.
    struct FlakyChat {
        failures: usize,
        calls: Mutex<Vec<(Instant, String)>>,
    }

    impl FlakyChat {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatApi for FlakyChat {
        async fn send_message(&self, text: &str) -> Result<(), DeliveryError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((Instant::now(), text.to_string()));
            if calls.len() <= self.failures {
                Err(DeliveryError::Status(StatusCode::BAD_GATEWAY))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff_until_success() {
        let chat = FlakyChat::new(2);
        let notifier = Notifier::new(chat.clone(), 3);
        let started = Instant::now();

        assert!(notifier.send("hello").await);

        let calls = chat.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0 - started, Duration::ZERO);
        assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(1));
        assert_eq!(calls[2].0 - calls[1].0, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_without_trailing_sleep() {
        let chat = FlakyChat::new(usize::MAX);
        let notifier = Notifier::new(chat.clone(), 3);
        let started = Instant::now();

        assert!(!notifier.send("hello").await);

        assert_eq!(chat.calls.lock().unwrap().len(), 3);
        assert_eq!(Instant::now() - started, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn first_success_makes_one_call() {
        let chat = FlakyChat::new(0);
        let notifier = Notifier::new(chat.clone(), 3);
        assert!(notifier.send("hello").await);
        assert_eq!(chat.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn long_messages_are_truncated_before_sending() {
        let chat = FlakyChat::new(0);
        let notifier = Notifier::new(chat.clone(), 1);
        assert!(notifier.send(&"a".repeat(5000)).await);

        let calls = chat.calls.lock().unwrap();
        let sent = &calls[0].1;
        assert_eq!(sent.chars().count(), MAX_MESSAGE_LENGTH);
        assert!(sent.ends_with("..."));
    }

    #[test]
    fn truncation_counts_characters() {
        let text = "ж".repeat(5000);
        let out = truncate_message(&text);
        assert_eq!(out.chars().count(), MAX_MESSAGE_LENGTH);
        assert!(out.starts_with("жжж"));
        assert!(out.ends_with("..."));

        let exact = "b".repeat(MAX_MESSAGE_LENGTH);
        assert!(matches!(truncate_message(&exact), Cow::Borrowed(s) if s == exact));
    }

    #[test]
    fn marker_reflects_error_flag() {
        let mut n = NewNotification {
            service: "billing".to_string(),
            event: String::new(),
            error: true,
            message: "payment failed".to_string(),
        };
        assert_eq!(format_message(&n), "❌ billing: payment failed");

        n.error = false;
        n.event = "charge".to_string();
        assert_eq!(format_message(&n), "📢 billing [charge]: payment failed");
    }
}

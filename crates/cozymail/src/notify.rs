use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

const SUBJECT_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct NewMailEvent {
    pub(crate) account_id: i64,
    pub(crate) subject: String,
    pub(crate) uid: u32,
}

impl NewMailEvent {
    pub(crate) fn new(account_id: i64, subject: &str, uid: u32) -> Self {
        Self {
            account_id,
            subject: subject.chars().take(SUBJECT_LIMIT).collect(),
            uid,
        }
    }
}

/// Fire-and-forget delivery of new-mail events. Implementations never
/// surface errors to the watcher.
#[async_trait]
pub(crate) trait NotificationSink: Send + Sync {
    async fn notify(&self, event: NewMailEvent);
}

pub(crate) struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn notify(&self, _event: NewMailEvent) {}
}

/// Posts each event as JSON to a fixed endpoint, one retry.
pub(crate) struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub(crate) fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("cozymail/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    async fn post(&self, event: &NewMailEvent) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for HttpNotifier {
    async fn notify(&self, event: NewMailEvent) {
        for attempt in 1..=2 {
            match self.post(&event).await {
                Ok(()) => return,
                Err(err) => tracing::debug!(
                    account_id = event.account_id,
                    uid = event.uid,
                    attempt,
                    error = %err,
                    "notification failed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{HttpNotifier, NewMailEvent, NotificationSink};

    #[test]
    fn subject_is_truncated_on_char_boundary() {
        let long = "é".repeat(150);
        let event = NewMailEvent::new(1, &long, 9);
        assert_eq!(event.subject.chars().count(), 100);
        assert_eq!(NewMailEvent::new(1, "short", 9).subject, "short");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_swallowed() -> anyhow::Result<()> {
        let notifier = HttpNotifier::new("http://127.0.0.1:9/notify", Duration::from_millis(200))?;
        notifier.notify(NewMailEvent::new(1, "hello", 2)).await;
        Ok(())
    }
}

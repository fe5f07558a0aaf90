use crate::models::Match;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(String),
}

/// Payload handed to the sink for each new match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchAlert {
    pub task_id: Uuid,
    pub item_id: String,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub melt_value: Option<f64>,
    pub margin: Option<f64>,
    pub item_url: Option<String>,
    /// Seconds between the listing going live and the match being found.
    pub latency_secs: Option<i64>,
}

impl MatchAlert {
    pub fn from_match(record: &Match) -> Self {
        Self {
            task_id: record.task_id,
            item_id: record.item_id.clone(),
            title: record.title.clone(),
            price: record.price,
            currency: record.currency.clone(),
            melt_value: record.melt_value,
            margin: record.margin,
            item_url: record.item_url.clone(),
            latency_secs: latency(record.listed_at, record.found_at),
        }
    }

    fn slack_text(&self) -> String {
        let mut text = format!("*{}*\n{:.2} {}", self.title, self.price, self.currency);
        if let (Some(melt), Some(margin)) = (self.melt_value, self.margin) {
            text.push_str(&format!(" | melt {melt:.2} | margin {margin:.2}"));
        }
        if let Some(secs) = self.latency_secs {
            text.push_str(&format!(" | found {secs}s after listing"));
        }
        if let Some(url) = &self.item_url {
            text.push_str(&format!("\n<{url}>"));
        }
        text
    }
}

fn latency(listed_at: Option<DateTime<Utc>>, found_at: DateTime<Utc>) -> Option<i64> {
    listed_at.map(|listed| (found_at - listed).num_seconds().max(0))
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, alert: &MatchAlert) -> Result<(), NotifyError>;
}

/// Posts Slack-compatible JSON to an incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    http: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, alert: &MatchAlert) -> Result<(), NotifyError> {
        let body = json!({
            "text": alert.slack_text(),
            "metadata": { "event_type": "scout_match", "event_payload": alert },
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| NotifyError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, alert: &MatchAlert) -> Result<(), NotifyError> {
        info!(
            target = "hermes.notify",
            task_id = %alert.task_id,
            item_id = %alert.item_id,
            price = alert.price,
            margin = ?alert.margin,
            latency_secs = ?alert.latency_secs,
            "match_alert"
        );
        Ok(())
    }
}

/// Fire-and-forget handle; delivery happens on a background task.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<MatchAlert>,
}

impl Notifier {
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<MatchAlert>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                if let Err(err) = sink.deliver(&alert).await {
                    warn!(
                        target = "hermes.notify",
                        item_id = %alert.item_id,
                        error = %err,
                        "notification_failed"
                    );
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Never blocks the cycle; a full or closed queue drops the alert.
    pub fn notify(&self, record: &Match) {
        match self.tx.try_send(MatchAlert::from_match(record)) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                warn!(target = "hermes.notify", item_id = %alert.item_id, "notification_queue_full");
            }
            Err(TrySendError::Closed(alert)) => {
                warn!(target = "hermes.notify", item_id = %alert.item_id, "notification_worker_gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemDetail, Task};
    use chrono::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<MatchAlert>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, alert: &MatchAlert) -> Result<(), NotifyError> {
            self.seen.lock().await.push(alert.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn deliver(&self, _: &MatchAlert) -> Result<(), NotifyError> {
            Err(NotifyError::Request("HTTP 500".into()))
        }
    }

    fn sample_match(listed_ago_secs: i64) -> Match {
        let task: Task = serde_json::from_value(json!({ "id": Uuid::new_v4() })).unwrap();
        let found_at = Utc::now();
        let detail = ItemDetail {
            item_id: "v1|9|0".into(),
            title: "14k Yellow Gold Chain 10.2g".into(),
            price: 210.0,
            currency: "USD".into(),
            condition: None,
            specs: Default::default(),
            seller: None,
            item_url: Some("https://www.ebay.com/itm/9".into()),
            image_url: None,
            listed_at: Some(found_at - Duration::seconds(listed_ago_secs)),
        };
        Match::new(&task, &detail, None, found_at)
    }

    #[tokio::test]
    async fn alerts_reach_the_sink_with_latency() {
        let sink = Arc::new(RecordingSink::default());
        let (notifier, handle) = Notifier::spawn(sink.clone(), 8);
        notifier.notify(&sample_match(42));
        drop(notifier);
        handle.await.unwrap();
        let seen = sink.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].latency_secs, Some(42));
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_worker() {
        let (notifier, handle) = Notifier::spawn(Arc::new(FailingSink), 4);
        notifier.notify(&sample_match(1));
        notifier.notify(&sample_match(2));
        drop(notifier);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let notifier = Notifier { tx };
        notifier.notify(&sample_match(1));
        notifier.notify(&sample_match(2));
    }

    #[test]
    fn slack_text_includes_economics() {
        let mut record = sample_match(5);
        record.melt_value = Some(480.0);
        record.margin = Some(260.0);
        let text = MatchAlert::from_match(&record).slack_text();
        assert!(text.contains("margin 260.00"));
        assert!(text.contains("<https://www.ebay.com/itm/9>"));
    }
}

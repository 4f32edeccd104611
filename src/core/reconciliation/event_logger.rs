//! Append-only audit trail for reconciliation runs and delivery events.
//!
//! Nothing here deduplicates. A caller that logs the same provider event twice
//! gets two rows; tasks gate writes on `last_reconciled_at` before calling in.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use super::types::ReconciliationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Reconciliation,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Webhook => "webhook",
            EventSource::Reconciliation => "reconciliation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Delivered,
    Bounced,
    Opened,
    Clicked,
    SpamComplaint,
}

impl EmailEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EmailEventType::Delivered => "email_delivered",
            EmailEventType::Bounced => "email_bounced",
            EmailEventType::Opened => "email_opened",
            EmailEventType::Clicked => "email_clicked",
            EmailEventType::SpamComplaint => "email_spam_complaint",
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EmailEventDetails {
    pub recipient: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub bounce_type: Option<String>,
    pub bounce_reason: Option<String>,
    pub url: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub client: Option<String>,
    pub external_message_id: Option<String>,
}

/// One row handed to the sink. `id` is generated by the logger.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: String,
    pub title: String,
    pub description: String,
    pub email_id: Option<i64>,
    pub task_id: Option<String>,
    pub source: EventSource,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<()>;
}

#[derive(Clone)]
pub struct EventLogger {
    sink: Arc<dyn EventSink>,
}

impl EventLogger {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        event_type: &str,
        title: String,
        description: String,
        email_id: Option<i64>,
        task_id: Option<&str>,
        source: EventSource,
        metadata: serde_json::Value,
    ) -> Result<String> {
        let event = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            title,
            description,
            email_id,
            task_id: task_id.map(str::to_string),
            source,
            metadata,
            created_at: Utc::now(),
        };
        self.sink.append(&event).await?;
        Ok(event.id)
    }

    pub async fn log_reconciliation_start(
        &self,
        task_id: &str,
        task_name: &str,
        window_hours: u32,
        triggered_by: Option<&str>,
    ) -> Result<String> {
        let actor = triggered_by.unwrap_or("system");
        self.write(
            "reconciliation_started",
            format!("Reconciliation started: {}", task_name),
            format!(
                "Checking the last {} hours (triggered by {})",
                window_hours, actor
            ),
            None,
            Some(task_id),
            EventSource::Reconciliation,
            json!({
                "task_id": task_id,
                "task_name": task_name,
                "window_hours": window_hours,
                "triggered_by": triggered_by,
            }),
        )
        .await
    }

    pub async fn log_reconciliation_complete(
        &self,
        task_id: &str,
        task_name: &str,
        result: &ReconciliationResult,
        start_event_id: Option<&str>,
    ) -> Result<String> {
        let s = &result.summary;
        let (event_type, title) = if result.success {
            (
                "reconciliation_completed",
                format!("Reconciliation completed: {}", task_name),
            )
        } else {
            (
                "reconciliation_failed",
                format!("Reconciliation failed: {}", task_name),
            )
        };
        let mut description = format!(
            "Fetched {}, new {}, updated {}, corrections {} in {}ms",
            s.items_fetched, s.items_new, s.items_updated, s.corrections, result.duration_ms
        );
        if !result.errors.is_empty() {
            description.push_str(&format!(" ({} error(s))", result.errors.len()));
        }
        self.write(
            event_type,
            title,
            description,
            None,
            Some(task_id),
            EventSource::Reconciliation,
            json!({
                "task_id": task_id,
                "task_name": task_name,
                "success": result.success,
                "summary": s,
                "errors": result.errors,
                "duration_ms": result.duration_ms,
                "start_event_id": start_event_id,
            }),
        )
        .await
    }

    pub async fn log_email_event(
        &self,
        email_id: i64,
        event_type: EmailEventType,
        details: &EmailEventDetails,
        source: EventSource,
    ) -> Result<String> {
        let recipient = details.recipient.as_deref().unwrap_or("recipient");
        let (title, description) = match event_type {
            EmailEventType::Delivered => (
                "Email delivered".to_string(),
                format!("Delivered to {}", recipient),
            ),
            EmailEventType::Bounced => (
                "Email bounced".to_string(),
                format!(
                    "{} bounce for {}: {}",
                    details.bounce_type.as_deref().unwrap_or("Unknown"),
                    recipient,
                    details.bounce_reason.as_deref().unwrap_or("no reason given")
                ),
            ),
            EmailEventType::Opened => {
                let mut description = format!("Opened by {}", recipient);
                if let Some(place) = geo_label(details) {
                    description.push_str(&format!(" in {}", place));
                }
                if let Some(client) = &details.client {
                    description.push_str(&format!(" using {}", client));
                }
                ("Email opened".to_string(), description)
            }
            EmailEventType::Clicked => (
                "Link clicked".to_string(),
                format!(
                    "{} clicked {}",
                    recipient,
                    details.url.as_deref().unwrap_or("a link")
                ),
            ),
            EmailEventType::SpamComplaint => (
                "Spam complaint".to_string(),
                format!("{} marked the email as spam", recipient),
            ),
        };

        let mut metadata = serde_json::to_value(details)?;
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("source".to_string(), json!(source.as_str()));
        }

        self.write(
            event_type.as_str(),
            title,
            description,
            Some(email_id),
            None,
            source,
            metadata,
        )
        .await
    }

    pub async fn log_reconciliation_note(
        &self,
        task_id: &str,
        task_name: &str,
        note: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<String> {
        self.write(
            "reconciliation_note",
            format!("Reconciliation note: {}", task_name),
            note.to_string(),
            None,
            Some(task_id),
            EventSource::Reconciliation,
            metadata.unwrap_or_else(|| json!({})),
        )
        .await
    }
}

fn geo_label(details: &EmailEventDetails) -> Option<String> {
    match (&details.city, &details.country) {
        (Some(city), Some(country)) => Some(format!("{}, {}", city, country)),
        (Some(city), None) => Some(city.clone()),
        (None, Some(country)) => Some(country.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reconciliation::types::ReconciliationSummary;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct VecSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl EventSink for VecSink {
        async fn append(&self, event: &AuditEvent) -> Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    fn logger() -> (Arc<VecSink>, EventLogger) {
        let sink = Arc::new(VecSink::default());
        (sink.clone(), EventLogger::new(sink))
    }

    #[tokio::test]
    async fn completion_references_start_event() {
        let (sink, logger) = logger();
        let start_id = logger
            .log_reconciliation_start("postmark", "Postmark", 72, Some("ops@example.com"))
            .await
            .unwrap();
        let result = ReconciliationResult {
            success: true,
            summary: ReconciliationSummary {
                items_fetched: 3,
                items_new: 1,
                items_updated: 1,
                corrections: 0,
            },
            errors: vec![],
            duration_ms: 40,
        };
        logger
            .log_reconciliation_complete("postmark", "Postmark", &result, Some(&start_id))
            .await
            .unwrap();

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, start_id);
        assert_eq!(events[0].event_type, "reconciliation_started");
        assert_eq!(events[1].event_type, "reconciliation_completed");
        assert_eq!(events[1].metadata["start_event_id"], json!(start_id));
        assert_eq!(events[1].metadata["summary"]["items_new"], json!(1));
    }

    #[tokio::test]
    async fn failed_result_logs_failed_event() {
        let (sink, logger) = logger();
        let result = ReconciliationResult::failure("API unreachable", 5);
        logger
            .log_reconciliation_complete("postmark", "Postmark", &result, None)
            .await
            .unwrap();
        let events = sink.events.lock().await;
        assert_eq!(events[0].event_type, "reconciliation_failed");
        assert_eq!(events[0].metadata["errors"][0], json!("API unreachable"));
    }

    #[tokio::test]
    async fn bounce_description_uses_reason_and_type() {
        let (sink, logger) = logger();
        let details = EmailEventDetails {
            recipient: Some("a@example.com".to_string()),
            bounce_type: Some("HardBounce".to_string()),
            bounce_reason: Some("mailbox full".to_string()),
            ..Default::default()
        };
        logger
            .log_email_event(7, EmailEventType::Bounced, &details, EventSource::Reconciliation)
            .await
            .unwrap();
        let events = sink.events.lock().await;
        assert_eq!(events[0].event_type, "email_bounced");
        assert_eq!(events[0].email_id, Some(7));
        assert_eq!(
            events[0].description,
            "HardBounce bounce for a@example.com: mailbox full"
        );
        assert_eq!(events[0].metadata["source"], json!("reconciliation"));
    }

    // Deduplication is the caller's job: the same event logged twice yields two rows.
    #[tokio::test]
    async fn logger_does_not_deduplicate() {
        let (sink, logger) = logger();
        let details = EmailEventDetails {
            recipient: Some("a@example.com".to_string()),
            ..Default::default()
        };
        for _ in 0..2 {
            logger
                .log_email_event(1, EmailEventType::Delivered, &details, EventSource::Webhook)
                .await
                .unwrap();
        }
        let events = sink.events.lock().await;
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].id, events[1].id);
    }

    #[tokio::test]
    async fn open_description_includes_geo() {
        let (sink, logger) = logger();
        let details = EmailEventDetails {
            recipient: Some("a@example.com".to_string()),
            city: Some("Lisbon".to_string()),
            country: Some("Portugal".to_string()),
            ..Default::default()
        };
        logger
            .log_email_event(2, EmailEventType::Opened, &details, EventSource::Webhook)
            .await
            .unwrap();
        let events = sink.events.lock().await;
        assert_eq!(events[0].description, "Opened by a@example.com in Lisbon, Portugal");
    }
}

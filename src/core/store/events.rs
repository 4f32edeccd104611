use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{Row, params};

use super::Store;
use crate::core::reconciliation::EventSink;
use crate::core::reconciliation::event_logger::AuditEvent;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EventLogRecord {
    pub id: String,
    pub event_type: String,
    pub title: String,
    pub description: String,
    pub email_id: Option<i64>,
    pub task_id: Option<String>,
    pub source: String,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

const EVENT_COLUMNS: &str =
    "id, event_type, title, description, email_id, task_id, source, metadata_json, created_at";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<(EventLogRecord, String)> {
    Ok((
        EventLogRecord {
            id: row.get(0)?,
            event_type: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            email_id: row.get(4)?,
            task_id: row.get(5)?,
            source: row.get(6)?,
            metadata: serde_json::Value::Null,
            created_at: row.get(8)?,
        },
        row.get(7)?,
    ))
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<(EventLogRecord, String)>>,
) -> Result<Vec<EventLogRecord>> {
    let mut out = Vec::new();
    for row in rows {
        let (mut record, metadata_json) = row?;
        record.metadata = serde_json::from_str(&metadata_json)?;
        out.push(record);
    }
    Ok(out)
}

impl Store {
    /// Newest first.
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<EventLogRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM event_log ORDER BY rowid DESC LIMIT ?1",
            EVENT_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], event_from_row)?;
        collect_events(rows)
    }

    #[cfg(test)]
    /// Oldest first.
    pub async fn events_for_email(&self, email_id: i64) -> Result<Vec<EventLogRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM event_log WHERE email_id = ?1 ORDER BY rowid ASC",
            EVENT_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![email_id], event_from_row)?;
        collect_events(rows)
    }

    pub async fn count_events(&self, event_type: Option<&str>) -> Result<i64> {
        let db = self.db.lock().await;
        let count = match event_type {
            Some(kind) => db.query_row(
                "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
                params![kind],
                |row| row.get(0),
            )?,
            None => db.query_row("SELECT COUNT(*) FROM event_log", [], |row| row.get(0))?,
        };
        Ok(count)
    }
}

#[async_trait]
impl EventSink for Store {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        let metadata_json = serde_json::to_string(&event.metadata)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO event_log (id, event_type, title, description, email_id, task_id, source, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id,
                event.event_type,
                event.title,
                event.description,
                event.email_id,
                event.task_id,
                event.source.as_str(),
                metadata_json,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::reconciliation::event_logger::{
        EmailEventDetails, EmailEventType, EventLogger, EventSource,
    };
    use crate::core::store::test_store;
    use std::sync::Arc;

    #[tokio::test]
    async fn logged_events_are_persisted_with_metadata() {
        let store = test_store();
        let logger = EventLogger::new(Arc::new(store.clone()));
        let start = logger
            .log_reconciliation_start("postmark", "Postmark", 24, None)
            .await
            .unwrap();
        logger
            .log_email_event(
                3,
                EmailEventType::Clicked,
                &EmailEventDetails {
                    recipient: Some("a@example.com".to_string()),
                    url: Some("https://example.com/q/1".to_string()),
                    ..Default::default()
                },
                EventSource::Reconciliation,
            )
            .await
            .unwrap();

        let recent = store.recent_events(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].id, start);
        assert_eq!(recent[1].metadata["window_hours"], 24);

        let for_email = store.events_for_email(3).await.unwrap();
        assert_eq!(for_email.len(), 1);
        assert_eq!(for_email[0].event_type, "email_clicked");
        assert_eq!(for_email[0].source, "reconciliation");
        assert_eq!(
            for_email[0].description,
            "a@example.com clicked https://example.com/q/1"
        );
        assert_eq!(store.count_events(Some("email_clicked")).await.unwrap(), 1);
        assert_eq!(store.count_events(None).await.unwrap(), 2);
    }
}

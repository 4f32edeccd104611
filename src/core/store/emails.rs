use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::Store;
use crate::core::reconciliation::EmailRepository;
use crate::core::reconciliation::repository::{
    Direction, EmailRecord, EmailStatus, EmailUpdate, EntityRefs, NewEmail, StateSource,
};

const EMAIL_COLUMNS: &str = "id, postmark_message_id, direction, status, from_address, to_address, \
     subject, thread_id, in_reply_to, quote_id, order_id, customer_id, vendor_id, sent_at, \
     delivered_at, bounced_at, last_reconciled_at, state_source, reconciliation_notes";

fn email_from_row(row: &Row<'_>) -> rusqlite::Result<EmailRecord> {
    let direction: String = row.get(2)?;
    let status: String = row.get(3)?;
    let state_source: String = row.get(17)?;
    Ok(EmailRecord {
        id: row.get(0)?,
        postmark_message_id: row.get(1)?,
        direction: Direction::from_str_opt(&direction).unwrap_or(Direction::Outbound),
        status: EmailStatus::from_status(&status).unwrap_or(EmailStatus::Sent),
        from_address: row.get(4)?,
        to_address: row.get(5)?,
        subject: row.get(6)?,
        thread_id: row.get(7)?,
        in_reply_to: row.get(8)?,
        refs: EntityRefs {
            quote_id: row.get(9)?,
            order_id: row.get(10)?,
            customer_id: row.get(11)?,
            vendor_id: row.get(12)?,
        },
        sent_at: row.get(13)?,
        delivered_at: row.get(14)?,
        bounced_at: row.get(15)?,
        last_reconciled_at: row.get(16)?,
        state_source: StateSource::from_str_opt(&state_source).unwrap_or(StateSource::Webhook),
        reconciliation_notes: row.get(18)?,
    })
}

/// `<abc-123@mtasv.net>` and `abc-123` both identify provider message `abc-123`.
pub(crate) fn normalize_message_ref(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>');
    trimmed.split('@').next().unwrap_or(trimmed).to_string()
}

impl Store {
    #[cfg(test)]
    pub async fn get_email(&self, id: i64) -> Result<Option<EmailRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM emails WHERE id = ?1", EMAIL_COLUMNS);
        let email = db
            .query_row(&sql, params![id], email_from_row)
            .optional()?;
        Ok(email)
    }

    pub async fn count_emails(&self) -> Result<i64> {
        let db = self.db.lock().await;
        let count = db.query_row("SELECT COUNT(*) FROM emails", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[async_trait]
impl EmailRepository for Store {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<EmailRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM emails WHERE postmark_message_id = ?1",
            EMAIL_COLUMNS
        );
        let email = db
            .query_row(&sql, params![external_id], email_from_row)
            .optional()?;
        Ok(email)
    }

    async fn insert_email(&self, email: &NewEmail) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO emails (
                postmark_message_id, direction, status, from_address, to_address, subject,
                thread_id, in_reply_to, quote_id, order_id, customer_id, vendor_id,
                sent_at, delivered_at, last_reconciled_at, state_source, reconciliation_notes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                email.postmark_message_id,
                email.direction.as_str(),
                email.status.as_str(),
                email.from_address,
                email.to_address,
                email.subject,
                email.thread_id,
                email.in_reply_to,
                email.refs.quote_id,
                email.refs.order_id,
                email.refs.customer_id,
                email.refs.vendor_id,
                email.sent_at,
                email.delivered_at,
                email.last_reconciled_at,
                email.state_source.as_str(),
                email.reconciliation_notes,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    async fn update_email(&self, id: i64, update: &EmailUpdate) -> Result<()> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE emails SET
                status = COALESCE(?2, status),
                delivered_at = COALESCE(?3, delivered_at),
                bounced_at = COALESCE(?4, bounced_at),
                last_reconciled_at = COALESCE(?5, last_reconciled_at),
                state_source = COALESCE(?6, state_source),
                reconciliation_notes = COALESCE(?7, reconciliation_notes)
             WHERE id = ?1",
            params![
                id,
                update.status.map(EmailStatus::as_str),
                update.delivered_at,
                update.bounced_at,
                update.last_reconciled_at,
                update.state_source.map(StateSource::as_str),
                update.reconciliation_notes,
            ],
        )?;
        if rows == 0 {
            return Err(anyhow!("email {} not found", id));
        }
        Ok(())
    }

    async fn outbound_sent_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EmailRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM emails
             WHERE direction = 'outbound'
               AND postmark_message_id IS NOT NULL
               AND sent_at >= ?1 AND sent_at <= ?2
             ORDER BY sent_at ASC, id ASC",
            EMAIL_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![from, to], email_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn resolve_thread(&self, in_reply_to: Option<&str>, message_id: &str) -> Result<String> {
        let db = self.db.lock().await;

        if let Some(parent_ref) = in_reply_to.map(normalize_message_ref)
            && !parent_ref.is_empty()
        {
            let parent_thread: Option<Option<String>> = db
                .query_row(
                    "SELECT thread_id FROM emails WHERE postmark_message_id = ?1",
                    params![parent_ref],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(Some(thread_id)) = parent_thread {
                return Ok(thread_id);
            }

            // A sibling reply to the same parent may already have opened the thread.
            let sibling_thread: Option<String> = db
                .query_row(
                    "SELECT thread_id FROM emails
                     WHERE in_reply_to = ?1 AND thread_id IS NOT NULL
                     ORDER BY id ASC LIMIT 1",
                    params![parent_ref],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(thread_id) = sibling_thread {
                return Ok(thread_id);
            }
        }

        // Replies to this message that arrived before it.
        let child_thread: Option<String> = db
            .query_row(
                "SELECT thread_id FROM emails
                 WHERE in_reply_to = ?1 AND thread_id IS NOT NULL
                 ORDER BY id ASC LIMIT 1",
                params![normalize_message_ref(message_id)],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(thread_id) = child_thread {
            return Ok(thread_id);
        }

        Ok(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use chrono::Duration;

    fn outbound(id: &str, sent_at: DateTime<Utc>) -> NewEmail {
        NewEmail {
            postmark_message_id: id.to_string(),
            direction: Direction::Outbound,
            status: EmailStatus::Sent,
            from_address: "sales@example.com".to_string(),
            to_address: "client@example.com".to_string(),
            subject: "Quote".to_string(),
            thread_id: Some(format!("thread-{}", id)),
            in_reply_to: None,
            refs: EntityRefs {
                quote_id: Some("q-1".to_string()),
                ..Default::default()
            },
            sent_at: Some(sent_at),
            delivered_at: None,
            last_reconciled_at: None,
            state_source: StateSource::Webhook,
            reconciliation_notes: None,
        }
    }

    #[test]
    fn normalizes_angle_bracket_message_ids() {
        assert_eq!(normalize_message_ref("<abc-123@mtasv.net>"), "abc-123");
        assert_eq!(normalize_message_ref(" abc-123 "), "abc-123");
    }

    #[tokio::test]
    async fn insert_then_find_by_external_id() {
        let store = test_store();
        let sent = Utc::now() - Duration::hours(1);
        let id = store.insert_email(&outbound("msg-1", sent)).await.unwrap();
        let found = store.find_by_external_id("msg-1").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, EmailStatus::Sent);
        assert_eq!(found.refs.quote_id.as_deref(), Some("q-1"));
        assert_eq!(found.sent_at, Some(sent));
        assert!(store.find_by_external_id("msg-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_only_touches_given_columns() {
        let store = test_store();
        let id = store
            .insert_email(&outbound("msg-1", Utc::now()))
            .await
            .unwrap();
        let bounced = Utc::now();
        store
            .update_email(
                id,
                &EmailUpdate {
                    status: Some(EmailStatus::Bounced),
                    bounced_at: Some(bounced),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let email = store.get_email(id).await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::Bounced);
        assert_eq!(email.bounced_at, Some(bounced));
        assert_eq!(email.subject, "Quote");
        assert_eq!(email.state_source, StateSource::Webhook);
        assert!(email.last_reconciled_at.is_none());
    }

    #[tokio::test]
    async fn update_missing_email_errors() {
        let store = test_store();
        assert!(store.update_email(99, &EmailUpdate::default()).await.is_err());
    }

    #[tokio::test]
    async fn outbound_window_excludes_old_and_inbound() {
        let store = test_store();
        let now = Utc::now();
        store
            .insert_email(&outbound("recent", now - Duration::hours(2)))
            .await
            .unwrap();
        store
            .insert_email(&outbound("ancient", now - Duration::hours(200)))
            .await
            .unwrap();
        let mut inbound = outbound("reply", now - Duration::hours(1));
        inbound.direction = Direction::Inbound;
        store.insert_email(&inbound).await.unwrap();

        let found = store
            .outbound_sent_between(now - Duration::hours(72), now)
            .await
            .unwrap();
        let ids: Vec<_> = found
            .iter()
            .map(|e| e.postmark_message_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["recent".to_string()]);
    }

    #[tokio::test]
    async fn resolve_thread_follows_parent_reference() {
        let store = test_store();
        store
            .insert_email(&outbound("parent-1", Utc::now()))
            .await
            .unwrap();
        let thread = store
            .resolve_thread(Some("<parent-1@mtasv.net>"), "reply-1")
            .await
            .unwrap();
        assert_eq!(thread, "thread-parent-1");
    }

    #[tokio::test]
    async fn resolve_thread_creates_new_thread_for_unknown_parent() {
        let store = test_store();
        let a = store
            .resolve_thread(Some("nobody"), "reply-1")
            .await
            .unwrap();
        let b = store.resolve_thread(None, "reply-2").await.unwrap();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}

mod emails;
mod events;
mod locks;
mod settings;

use anyhow::{Result, anyhow};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::config::MAX_LEASE_SECS;
use crate::platform::{NativePlatform, Platform};

pub(crate) use emails::normalize_message_ref;

/// SQLite-backed implementation of every storage-facing collaborator the
/// reconciler talks to: settings, email records, the audit log and advisory locks.
///
/// Several processes may open the same database file; the lock table is what
/// keeps their schedulers from running the same task at once.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
    instance_id: String,
    lease: chrono::Duration,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(path: P, lease_secs: u64) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
            NativePlatform::restrict_dir_permissions(parent);
        }

        let db = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        db.busy_timeout(Duration::from_secs(10))?;
        let _mode: String =
            db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        let store = Self::from_connection(db, lease_secs)?;
        info!(
            "Opened reconciliation store at {} (instance {})",
            path.display(),
            store.instance_id
        );
        Ok(store)
    }

    pub fn from_connection(db: Connection, lease_secs: u64) -> Result<Self> {
        init_schema(&db)?;
        let lease = i64::try_from(lease_secs.min(MAX_LEASE_SECS))
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .ok_or_else(|| anyhow!("invalid lock lease of {}s", lease_secs))?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            instance_id: format!(
                "{}-{}",
                std::process::id(),
                uuid::Uuid::new_v4().simple()
            ),
            lease,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            postmark_message_id TEXT UNIQUE,
            direction TEXT NOT NULL,
            status TEXT NOT NULL,
            from_address TEXT NOT NULL DEFAULT '',
            to_address TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL DEFAULT '',
            thread_id TEXT,
            in_reply_to TEXT,
            quote_id TEXT,
            order_id TEXT,
            customer_id TEXT,
            vendor_id TEXT,
            sent_at TEXT,
            delivered_at TEXT,
            bounced_at TEXT,
            last_reconciled_at TEXT,
            state_source TEXT NOT NULL DEFAULT 'webhook',
            reconciliation_notes TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_emails_direction_sent_at ON emails(direction, sent_at)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_emails_in_reply_to ON emails(in_reply_to)",
        [],
    )?;

    // No unique constraint beyond the id: deduplication is the caller's job.
    db.execute(
        "CREATE TABLE IF NOT EXISTS event_log (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            email_id INTEGER,
            task_id TEXT,
            source TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_event_log_email_id ON event_log(email_id)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS advisory_locks (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            token TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// Create an in-memory store for testing. Avoids filesystem side-effects.
#[cfg(test)]
pub fn test_store() -> Store {
    let db = Connection::open_in_memory().expect("in-memory db");
    Store::from_connection(db, 3600).expect("init schema")
}

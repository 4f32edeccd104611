use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use tracing::{debug, warn};

use super::Store;
use crate::core::reconciliation::{LockLease, LockProvider};

#[derive(Debug, Clone, serde::Serialize)]
pub struct LockHolder {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Store {
    fn lease_expiry(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        from.checked_add_signed(self.lease)
            .ok_or_else(|| anyhow!("lock lease of {}s overflows the clock", self.lease.num_seconds()))
    }

    pub async fn lock_holder(&self, name: &str) -> Result<Option<LockHolder>> {
        let db = self.db.lock().await;
        let holder = db
            .query_row(
                "SELECT name, holder, acquired_at, expires_at FROM advisory_locks WHERE name = ?1",
                params![name],
                |row| {
                    Ok(LockHolder {
                        name: row.get(0)?,
                        holder: row.get(1)?,
                        acquired_at: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(holder)
    }
}

#[async_trait]
impl LockProvider for Store {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockLease>> {
        let now = Utc::now();
        let lease = LockLease {
            name: name.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            holder: self.instance_id.clone(),
            expires_at: self.lease_expiry(now)?,
        };

        let mut db = self.db.lock().await;
        // IMMEDIATE takes the write lock up front so the expiry sweep and the
        // insert are atomic with respect to other processes on the same file.
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let expired = tx.execute(
            "DELETE FROM advisory_locks WHERE name = ?1 AND expires_at <= ?2",
            params![name, now],
        )?;
        if expired > 0 {
            warn!("Took over expired lease on lock '{}'", name);
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO advisory_locks (name, holder, token, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lease.name, lease.holder, lease.token, now, lease.expires_at],
        )?;
        tx.commit()?;

        if inserted == 1 {
            debug!("Acquired lock '{}' as {}", name, lease.holder);
            Ok(Some(lease))
        } else {
            Ok(None)
        }
    }

    async fn renew(&self, lease: &LockLease) -> Result<bool> {
        let expires_at = self.lease_expiry(Utc::now())?;
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE advisory_locks SET expires_at = ?1 WHERE name = ?2 AND token = ?3",
            params![expires_at, lease.name, lease.token],
        )?;
        Ok(updated > 0)
    }

    async fn release(&self, lease: &LockLease) -> Result<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            "DELETE FROM advisory_locks WHERE name = ?1 AND token = ?2",
            params![lease.name, lease.token],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let store = test_store();
        let lease = store.try_acquire("reconciliation_postmark").await.unwrap();
        let lease = lease.expect("first acquire wins");
        assert!(
            store
                .try_acquire("reconciliation_postmark")
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.release(&lease).await.unwrap());
        assert!(
            store
                .try_acquire("reconciliation_postmark")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn locks_are_independent_by_name() {
        let store = test_store();
        assert!(store.try_acquire("a").await.unwrap().is_some());
        assert!(store.try_acquire("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_new_holder() {
        let store = test_store();
        let first = store.try_acquire("job").await.unwrap().unwrap();
        assert!(store.release(&first).await.unwrap());
        let _second = store.try_acquire("job").await.unwrap().unwrap();
        assert!(!store.release(&first).await.unwrap());
        assert!(store.lock_holder("job").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let db = rusqlite::Connection::open_in_memory().unwrap();
        let store = Store::from_connection(db, 0).unwrap();
        let first = store.try_acquire("job").await.unwrap().unwrap();
        let second = store.try_acquire("job").await.unwrap();
        let second = second.expect("zero-length lease is immediately stale");
        assert_ne!(first.token, second.token);
        assert!(!store.release(&first).await.unwrap());
    }

    #[tokio::test]
    async fn processes_sharing_a_file_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let instance_a = Store::open(&path, 3600).await.unwrap();
        let instance_b = Store::open(&path, 3600).await.unwrap();
        assert_ne!(instance_a.instance_id(), instance_b.instance_id());

        let lease = instance_a.try_acquire("job").await.unwrap().unwrap();
        assert!(instance_b.try_acquire("job").await.unwrap().is_none());
        let holder = instance_b.lock_holder("job").await.unwrap().unwrap();
        assert_eq!(holder.holder, instance_a.instance_id());

        instance_a.release(&lease).await.unwrap();
        assert!(instance_b.try_acquire("job").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn renew_extends_only_the_current_holder() {
        let db = rusqlite::Connection::open_in_memory().unwrap();
        let store = Store::from_connection(db, 60).unwrap();
        let lease = store.try_acquire("job").await.unwrap().unwrap();
        let before = store.lock_holder("job").await.unwrap().unwrap().expires_at;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(store.renew(&lease).await.unwrap());
        let after = store.lock_holder("job").await.unwrap().unwrap().expires_at;
        assert!(after > before);

        assert!(store.release(&lease).await.unwrap());
        assert!(!store.renew(&lease).await.unwrap());
        assert!(store.lock_holder("job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn huge_lease_is_capped_instead_of_overflowing() {
        let db = rusqlite::Connection::open_in_memory().unwrap();
        let store = Store::from_connection(db, 10_000_000_000_000).unwrap();
        let lease = store.try_acquire("job").await.unwrap().unwrap();
        let cap = chrono::Duration::seconds(crate::core::config::MAX_LEASE_SECS as i64);
        assert!(lease.expires_at <= Utc::now() + cap);
        assert!(store.renew(&lease).await.unwrap());
        assert!(store.release(&lease).await.unwrap());
    }
}

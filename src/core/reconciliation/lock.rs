//! Named advisory locks shared by every instance of the deployment.
//!
//! A lock is acquired with a non-blocking attempt. Losing the race is an
//! expected outcome (another instance is already doing the work), so callers
//! see it as [`LockOutcome::Contended`] rather than as an error.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

/// Floor for the renewal period so a near-zero lease cannot spin the heartbeat.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(50);

/// Proof of a held lock. Must be handed back to [`LockProvider::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub token: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Returns `None` when the lock is currently held by someone else.
    async fn try_acquire(&self, name: &str) -> Result<Option<LockLease>>;

    /// Pushes the expiry of a held lease forward by the provider's lease length.
    /// Returns `false` when the lease was already taken over.
    async fn renew(&self, lease: &LockLease) -> Result<bool>;

    /// Returns `false` when the lease had already expired or was taken over.
    async fn release(&self, lease: &LockLease) -> Result<bool>;
}

#[derive(Debug)]
pub enum LockOutcome<T> {
    /// The body ran to completion while the lock was held.
    Completed(T),
    /// Another holder owns the lock; the body never started.
    Contended,
    /// Acquisition failed, or the body panicked.
    Failed(anyhow::Error),
}

fn renew_interval(lease: &LockLease) -> Duration {
    let remaining = (lease.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    (remaining / 3).max(MIN_RENEW_INTERVAL)
}

/// Runs `body` while holding the named lock and releases it on every exit path.
///
/// The body runs on its own tokio task so a panic inside it surfaces as a
/// `JoinError` here instead of unwinding past the release. While it runs, the
/// lease is renewed every third of its length so a long body never outlives it.
pub async fn with_lock<P, F, T>(provider: &P, name: &str, body: F) -> LockOutcome<T>
where
    P: LockProvider + ?Sized,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let lease = match provider.try_acquire(name).await {
        Ok(Some(lease)) => lease,
        Ok(None) => return LockOutcome::Contended,
        Err(e) => return LockOutcome::Failed(e.context(format!("acquiring lock '{}'", name))),
    };

    let period = renew_interval(&lease);
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut handle = tokio::spawn(body);
    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            _ = heartbeat.tick() => match provider.renew(&lease).await {
                Ok(true) => debug!("Renewed lock '{}'", name),
                Ok(false) => warn!("Lock '{}' was taken over while its holder was still running", name),
                Err(e) => warn!("Failed to renew lock '{}': {:#}", name, e),
            },
        }
    };

    match provider.release(&lease).await {
        Ok(true) => {}
        Ok(false) => warn!(
            "Lock '{}' was no longer held at release time (lease expired or taken over)",
            name
        ),
        Err(e) => error!("Failed to release lock '{}': {}", name, e),
    }

    match joined {
        Ok(value) => LockOutcome::Completed(value),
        Err(e) => LockOutcome::Failed(anyhow::anyhow!("body under lock '{}' aborted: {}", name, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct MemoryLocks {
        lease: chrono::Duration,
        held: Mutex<HashSet<String>>,
        releases: Mutex<Vec<String>>,
        renewals: Mutex<u32>,
    }

    impl MemoryLocks {
        fn new(lease: chrono::Duration) -> Self {
            Self {
                lease,
                held: Mutex::new(HashSet::new()),
                releases: Mutex::new(Vec::new()),
                renewals: Mutex::new(0),
            }
        }
    }

    impl Default for MemoryLocks {
        fn default() -> Self {
            Self::new(chrono::Duration::hours(1))
        }
    }

    #[async_trait]
    impl LockProvider for MemoryLocks {
        async fn try_acquire(&self, name: &str) -> Result<Option<LockLease>> {
            let mut held = self.held.lock().unwrap();
            if !held.insert(name.to_string()) {
                return Ok(None);
            }
            Ok(Some(LockLease {
                name: name.to_string(),
                token: uuid::Uuid::new_v4().to_string(),
                holder: "test".to_string(),
                expires_at: Utc::now() + self.lease,
            }))
        }

        async fn renew(&self, lease: &LockLease) -> Result<bool> {
            *self.renewals.lock().unwrap() += 1;
            Ok(self.held.lock().unwrap().contains(&lease.name))
        }

        async fn release(&self, lease: &LockLease) -> Result<bool> {
            self.releases.lock().unwrap().push(lease.name.clone());
            Ok(self.held.lock().unwrap().remove(&lease.name))
        }
    }

    struct BrokenLocks;

    #[async_trait]
    impl LockProvider for BrokenLocks {
        async fn try_acquire(&self, _name: &str) -> Result<Option<LockLease>> {
            Err(anyhow::anyhow!("database is locked"))
        }

        async fn renew(&self, _lease: &LockLease) -> Result<bool> {
            Ok(false)
        }

        async fn release(&self, _lease: &LockLease) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn completed_body_releases_lock() {
        let locks = MemoryLocks::default();
        let outcome = with_lock(&locks, "job", async { 41 + 1 }).await;
        assert!(matches!(outcome, LockOutcome::Completed(42)));
        assert!(locks.held.lock().unwrap().is_empty());
        assert_eq!(*locks.releases.lock().unwrap(), vec!["job".to_string()]);
    }

    #[tokio::test]
    async fn held_lock_is_contended_and_body_never_runs() {
        let locks = MemoryLocks::default();
        locks.held.lock().unwrap().insert("job".to_string());
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let outcome = with_lock(&locks, "job", async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await;
        assert!(matches!(outcome, LockOutcome::Contended));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(locks.releases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_body_still_releases_lock() {
        let locks = MemoryLocks::default();
        let outcome: LockOutcome<()> =
            with_lock(&locks, "job", async { panic!("task blew up") }).await;
        assert!(matches!(outcome, LockOutcome::Failed(_)));
        assert!(locks.held.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn acquisition_error_is_failure_not_contention() {
        let outcome = with_lock(&BrokenLocks, "job", async { 1 }).await;
        match outcome {
            LockOutcome::Failed(e) => assert!(format!("{:#}", e).contains("database is locked")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn long_body_keeps_renewing_its_lease() {
        let locks = MemoryLocks::new(chrono::Duration::milliseconds(300));
        let outcome = with_lock(&locks, "job", async {
            tokio::time::sleep(Duration::from_millis(450)).await;
        })
        .await;
        assert!(matches!(outcome, LockOutcome::Completed(())));
        assert!(*locks.renewals.lock().unwrap() >= 2);
        assert!(locks.held.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn quick_body_is_not_renewed() {
        let locks = MemoryLocks::default();
        let outcome = with_lock(&locks, "job", async { 7 }).await;
        assert!(matches!(outcome, LockOutcome::Completed(7)));
        assert_eq!(*locks.renewals.lock().unwrap(), 0);
    }
}

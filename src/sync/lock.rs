//! Per-account sync lease backed by the store.
//!
//! Processes race for a row in `sync_locks`; the holder string identifies
//! this process so a crashed holder's lease simply times out and can be
//! taken over. The lease protects folder cursors from concurrent writers
//! when the scheduler and a webhook-triggered resync collide.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::MailStore;

/// Handle for taking and releasing the per-account sync lease.
#[derive(Clone)]
pub struct SyncLock {
    store: Arc<dyn MailStore>,
    holder: String,
    ttl: chrono::Duration,
}

impl SyncLock {
    /// Create a lock handle with a fresh process-unique holder identity.
    pub fn new(store: Arc<dyn MailStore>, ttl: Duration) -> Self {
        let holder = format!("{}-{}", std::process::id(), Uuid::new_v4());
        Self {
            store,
            holder,
            ttl: chrono::Duration::seconds(ttl.as_secs() as i64),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to take the lease for `account_id`. Returns `false` when another
    /// live holder owns it.
    pub async fn acquire(&self, account_id: Uuid) -> Result<bool, DatabaseError> {
        self.store
            .try_acquire_sync_lock(account_id, &self.holder, self.ttl)
            .await
    }

    /// Extend a held lease mid-sync so long pulls don't lapse.
    pub async fn renew(&self, account_id: Uuid) -> Result<bool, DatabaseError> {
        self.store
            .renew_sync_lock(account_id, &self.holder, self.ttl)
            .await
    }

    /// Give the lease back. A lease taken over by someone else is left alone.
    pub async fn release(&self, account_id: Uuid) -> Result<(), DatabaseError> {
        self.store.release_sync_lock(account_id, &self.holder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionType, EmailAccount};
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn two_handles_contend_for_one_account() {
        let store: Arc<dyn MailStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let account = EmailAccount::new("a", ConnectionType::Imap);
        store.insert_account(&account).await.unwrap();

        let a = SyncLock::new(Arc::clone(&store), Duration::from_secs(60));
        let b = SyncLock::new(Arc::clone(&store), Duration::from_secs(60));
        assert_ne!(a.holder(), b.holder());

        assert!(a.acquire(account.id).await.unwrap());
        assert!(!b.acquire(account.id).await.unwrap());
        assert!(a.renew(account.id).await.unwrap());

        a.release(account.id).await.unwrap();
        assert!(b.acquire(account.id).await.unwrap());
    }
}

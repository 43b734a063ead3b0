//! Background sync scheduler — sweeps ACTIVE accounts on a timer.
//!
//! Timer-based loop:
//! 1. `list_syncable_accounts()` from the store
//! 2. `engine.sync_account()` per account
//! 3. Lease contention and disabled accounts are skipped quietly; provider
//!    failures are already counted by the engine

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::MailError;
use crate::store::MailStore;
use crate::sync::engine::SyncEngine;

/// Spawn a background task that syncs every ACTIVE account on an interval.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_sync_scheduler(
    store: Arc<dyn MailStore>,
    engine: Arc<SyncEngine>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Sync scheduler started — sweeping every {}s", interval.as_secs());

        let mut tick = tokio::time::interval(interval);

        // Run immediately on first tick
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Sync scheduler shutting down");
                return;
            }

            sweep(&store, &engine).await;
        }
    });

    (handle, shutdown_flag)
}

/// One pass over the ACTIVE account set.
async fn sweep(store: &Arc<dyn MailStore>, engine: &Arc<SyncEngine>) {
    let accounts = match store.list_syncable_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            error!("Failed to load syncable accounts: {e}");
            return;
        }
    };

    if accounts.is_empty() {
        return;
    }

    debug!("Sweeping {} account(s)", accounts.len());

    for account in accounts {
        match engine.sync_account(account.id).await {
            Ok(outcome) => {
                debug!(
                    account_id = %account.id,
                    messages = outcome.messages_upserted,
                    "Scheduled sync done"
                );
            }
            // Another process (or a push-triggered resync) holds the lease.
            Err(MailError::SyncInProgress { .. }) => {
                debug!(account_id = %account.id, "Skipped, sync already running");
            }
            // State changed since the account list was loaded.
            Err(MailError::SyncDisabled { .. }) => {}
            Err(e) => {
                error!(account_id = %account.id, error = %e, "Scheduled sync failed");
            }
        }
    }
}

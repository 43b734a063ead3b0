//! Incremental sync engine.
//!
//! One pass over an account:
//! 1. Take the per-account lease (single-flight across processes).
//! 2. Discover remote folders and upsert the local mirror.
//! 3. For each syncable folder, pull pages from the last committed cursor,
//!    upsert messages, and persist the new cursor only after the page has
//!    landed. A crash or cancellation therefore resumes exactly where the
//!    last committed page ended.
//! 4. Feed the outcome into the account's failure-streak state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{MailClient, RemoteMessage};
use crate::error::{DatabaseError, MailError};
use crate::model::{EmailAccount, EmailAccountFolder, EmailAccountMessage, Synchronization};
use crate::store::MailStore;
use crate::sync::lock::SyncLock;

/// Upper bound on pages pulled per folder per pass. A folder with more
/// backlog continues from its cursor on the next pass.
const MAX_PAGES_PER_PASS: usize = 20;

/// Builds a provider client for an account. Credential lookup lives behind
/// this seam so the engine stays testable with stub clients.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, account: &EmailAccount) -> Result<Arc<dyn MailClient>, MailError>;
}

/// Counters from one sync pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncOutcome {
    pub folders_seen: usize,
    pub messages_upserted: usize,
    /// True when the pass ended early because of a cancellation request.
    pub cancelled: bool,
}

/// Pulls mail for accounts and drives their sync state machine.
pub struct SyncEngine {
    store: Arc<dyn MailStore>,
    clients: Arc<dyn ClientFactory>,
    lock: SyncLock,
    failure_threshold: u32,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn MailStore>,
        clients: Arc<dyn ClientFactory>,
        lock: SyncLock,
        failure_threshold: u32,
    ) -> Self {
        Self {
            store,
            clients,
            lock,
            failure_threshold,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between provider calls; set it to wind a pass down at
    /// the next page boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run one sync pass for `account_id`.
    ///
    /// Fails fast with `SyncDisabled` for non-ACTIVE accounts and
    /// `SyncInProgress` when another holder owns the lease. Provider errors
    /// count toward the failure streak; at the threshold the account
    /// transitions to STOPPED.
    pub async fn sync_account(&self, account_id: Uuid) -> Result<SyncOutcome, MailError> {
        self.sync_scoped(account_id, None).await
    }

    /// Scoped variant for folder-level push notifications: pulls one
    /// folder under the same lease and failure accounting.
    pub async fn sync_account_folder(
        &self,
        account_id: Uuid,
        folder_id: Uuid,
    ) -> Result<SyncOutcome, MailError> {
        self.sync_scoped(account_id, Some(folder_id)).await
    }

    async fn sync_scoped(
        &self,
        account_id: Uuid,
        scope: Option<Uuid>,
    ) -> Result<SyncOutcome, MailError> {
        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(MailError::Database(DatabaseError::NotFound {
                entity: "email_account".into(),
                id: account_id.to_string(),
            }))?;

        if !account.can_sync() {
            return Err(MailError::SyncDisabled {
                account_id,
                state: account.sync_state.as_str().to_string(),
            });
        }

        if !self.lock.acquire(account_id).await? {
            return Err(MailError::SyncInProgress { account_id });
        }

        let result = self.pull(&account, scope).await;
        self.lock.release(account_id).await?;

        match result {
            Ok(outcome) => {
                account.record_success();
                self.store.update_account(&account).await?;
                info!(
                    account_id = %account_id,
                    folders = outcome.folders_seen,
                    messages = outcome.messages_upserted,
                    "Sync pass complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                let stopped = account.record_failure(&e.to_string(), self.failure_threshold);
                self.store.update_account(&account).await?;
                if stopped {
                    warn!(
                        account_id = %account_id,
                        streak = account.failure_streak,
                        "Account stopped after repeated provider failures"
                    );
                } else {
                    warn!(
                        account_id = %account_id,
                        streak = account.failure_streak,
                        error = %e,
                        "Sync pass failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn pull(
        &self,
        account: &EmailAccount,
        scope: Option<Uuid>,
    ) -> Result<SyncOutcome, MailError> {
        let client = self.clients.client_for(account)?;
        let mut outcome = SyncOutcome::default();

        // A folder-scoped pass skips discovery and pulls the one folder
        // the notification named.
        if let Some(folder_id) = scope {
            let folder = self.store.get_folder(folder_id).await?.ok_or(
                MailError::Database(DatabaseError::NotFound {
                    entity: "email_account_folder".into(),
                    id: folder_id.to_string(),
                }),
            )?;
            if folder.syncable {
                outcome.folders_seen = 1;
                outcome.messages_upserted = self.pull_folder(account, &client, &folder).await?;
            }
            return Ok(outcome);
        }

        let remote_folders = client.fetch_folders().await?;
        let mut folders = Vec::with_capacity(remote_folders.len());
        for remote in &remote_folders {
            let mut candidate = EmailAccountFolder::new(
                account.id,
                remote.identifier.as_remote_id(),
                &remote.name,
            );
            candidate.support_move = remote.support_move;
            folders.push(self.store.upsert_folder(&candidate).await?);
        }
        outcome.folders_seen = folders.len();

        for folder in folders.iter().filter(|f| f.syncable) {
            if self.cancelled.load(Ordering::Relaxed) {
                outcome.cancelled = true;
                info!(account_id = %account.id, "Sync pass cancelled");
                return Ok(outcome);
            }
            outcome.messages_upserted += self.pull_folder(account, &client, folder).await?;
        }

        Ok(outcome)
    }

    async fn pull_folder(
        &self,
        account: &EmailAccount,
        client: &Arc<dyn MailClient>,
        folder: &EmailAccountFolder,
    ) -> Result<usize, MailError> {
        let identifier = folder.identifier(account.connection_type);
        let mut cursor = folder.last_cursor.clone();
        let mut upserted = 0;

        for _ in 0..MAX_PAGES_PER_PASS {
            if self.cancelled.load(Ordering::Relaxed) {
                break;
            }

            let page = client.fetch_messages(&identifier, cursor.as_deref()).await?;

            for remote in &page.messages {
                // The account's lower watermark bounds the mirror; clients
                // already filter server-side where the protocol allows it.
                if remote.date < account.initial_sync_from {
                    continue;
                }
                let message = remote_to_message(account.id, remote);
                self.store.upsert_message(&message, folder.id).await?;
                upserted += 1;
            }

            // Cursor moves only after the page is committed.
            if let Some(next) = &page.next_cursor {
                self.store
                    .update_folder_cursor(folder.id, Some(next))
                    .await?;
            }

            let caught_up = page.messages.is_empty() || page.next_cursor.is_none();
            cursor = page.next_cursor;
            if caught_up {
                break;
            }

            // Long pulls renew the lease per page so it cannot lapse
            // mid-pass.
            if !self.lock.renew(account.id).await? {
                debug!(account_id = %account.id, "Lost sync lease mid-pass");
                break;
            }
        }

        Ok(upserted)
    }
}

fn remote_to_message(account_id: Uuid, remote: &RemoteMessage) -> EmailAccountMessage {
    let mut message = EmailAccountMessage::new(account_id, &remote.remote_id);
    message.message_id = remote.message_id.clone();
    message.subject = remote.subject.clone();
    message.html_body = remote.html_body.clone();
    message.text_body = remote.text_body.clone();
    message.is_read = remote.is_read;
    message.is_draft = remote.is_draft;
    message.date = remote.date;
    message
}

// ── Resync trigger ──────────────────────────────────────────────────

/// Hook the webhook handler calls when a push notification matches a known
/// subscription.
#[async_trait]
pub trait ResyncTrigger: Send + Sync {
    async fn ping(&self, sync: &Synchronization) -> Result<(), MailError>;
}

/// `ResyncTrigger` that kicks the engine in the background. A subscription
/// scoped to a folder pulls just that folder; an account-wide one runs a
/// full pass. At-least-once delivery makes overlapping pings safe: a pass
/// already holding the lease simply wins, and the `(account_id,
/// remote_id)` uniqueness absorbs duplicate fetches.
pub struct EngineTrigger(pub Arc<SyncEngine>);

#[async_trait]
impl ResyncTrigger for EngineTrigger {
    async fn ping(&self, sync: &Synchronization) -> Result<(), MailError> {
        let engine = Arc::clone(&self.0);
        let account_id = sync.account_id;
        let folder_id = sync.folder_id;
        tokio::spawn(async move {
            let result = match folder_id {
                Some(folder_id) => engine.sync_account_folder(account_id, folder_id).await,
                None => engine.sync_account(account_id).await,
            };
            match result {
                Ok(_) => {}
                Err(MailError::SyncInProgress { .. }) => {
                    debug!(account_id = %account_id, "Push resync skipped, sync already running");
                }
                Err(MailError::SyncDisabled { .. }) => {
                    debug!(account_id = %account_id, "Push resync skipped, account not active");
                }
                Err(e) => {
                    warn!(account_id = %account_id, error = %e, "Push-triggered resync failed");
                }
            }
        });
        Ok(())
    }
}

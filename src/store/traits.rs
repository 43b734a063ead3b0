//! Backend-agnostic `MailStore` trait — single async interface for all
//! mailbox persistence: accounts, folders, messages, push subscriptions,
//! and the cross-process sync lock.

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{EmailAccount, EmailAccountFolder, EmailAccountMessage, Synchronization};

/// Backend-agnostic store trait covering every table the mailbox core owns.
///
/// Batch operations (`mark_messages_read`, `move_messages_locally`) run in a
/// single transaction inside the backend: either every row is updated or
/// none are.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    /// Insert a new account.
    async fn insert_account(&self, account: &EmailAccount) -> Result<(), DatabaseError>;

    /// Get an account by ID.
    async fn get_account(&self, id: Uuid) -> Result<Option<EmailAccount>, DatabaseError>;

    /// Get all accounts.
    async fn list_accounts(&self) -> Result<Vec<EmailAccount>, DatabaseError>;

    /// Get accounts in the ACTIVE sync state, i.e. the scheduler's work set.
    async fn list_syncable_accounts(&self) -> Result<Vec<EmailAccount>, DatabaseError>;

    /// Persist an account's mutable fields (sync state, stop reason,
    /// failure streak, sent folder, updated_at).
    async fn update_account(&self, account: &EmailAccount) -> Result<(), DatabaseError>;

    // ── Folders ─────────────────────────────────────────────────────

    /// Insert a folder, or refresh `name` and `support_move` if a row with
    /// the same `(account_id, remote_id)` already exists. Returns the
    /// stored folder (existing ID and cursor preserved on conflict).
    async fn upsert_folder(
        &self,
        folder: &EmailAccountFolder,
    ) -> Result<EmailAccountFolder, DatabaseError>;

    /// Get a folder by ID.
    async fn get_folder(&self, id: Uuid) -> Result<Option<EmailAccountFolder>, DatabaseError>;

    /// Get all folders for an account.
    async fn list_folders(&self, account_id: Uuid)
    -> Result<Vec<EmailAccountFolder>, DatabaseError>;

    /// Persist a folder's incremental-sync cursor after a committed page.
    async fn update_folder_cursor(
        &self,
        folder_id: Uuid,
        cursor: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Toggle whether the sync engine pulls from this folder.
    async fn set_folder_syncable(&self, folder_id: Uuid, syncable: bool)
    -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message, or update the mirrored flags if a row with the
    /// same `(account_id, remote_id)` already exists, and record membership
    /// in `folder_id`. Returns the stored message's ID. This is the dedupe
    /// point for at-least-once push delivery and overlapping sync pages.
    async fn upsert_message(
        &self,
        message: &EmailAccountMessage,
        folder_id: Uuid,
    ) -> Result<Uuid, DatabaseError>;

    /// Get a message by ID.
    async fn get_message(&self, id: Uuid)
    -> Result<Option<EmailAccountMessage>, DatabaseError>;

    /// Look up a message by its provider-native ID within an account.
    async fn get_message_by_remote_id(
        &self,
        account_id: Uuid,
        remote_id: &str,
    ) -> Result<Option<EmailAccountMessage>, DatabaseError>;

    /// Get messages belonging to a folder, newest first, up to `limit`.
    async fn list_messages_in_folder(
        &self,
        folder_id: Uuid,
        limit: usize,
    ) -> Result<Vec<EmailAccountMessage>, DatabaseError>;

    /// Count unread, non-draft messages for an account.
    async fn count_unread(&self, account_id: Uuid) -> Result<u64, DatabaseError>;

    /// Mark the given messages read. All rows must belong to `account_id`;
    /// runs in one transaction.
    async fn mark_messages_read(
        &self,
        account_id: Uuid,
        message_ids: &[Uuid],
    ) -> Result<(), DatabaseError>;

    /// Re-home the given messages into `to_folder` in the local mirror.
    /// With `from_folder` set, only that membership is replaced; with
    /// `None`, every existing membership is dropped. Runs in one
    /// transaction.
    async fn move_messages_locally(
        &self,
        message_ids: &[Uuid],
        from_folder: Option<Uuid>,
        to_folder: Uuid,
    ) -> Result<(), DatabaseError>;

    /// IDs of the folders a message currently belongs to.
    async fn folders_of_message(&self, message_id: Uuid) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Push subscriptions ──────────────────────────────────────────

    /// Record a webhook subscription issued by a push provider.
    async fn insert_synchronization(&self, sync: &Synchronization)
    -> Result<(), DatabaseError>;

    /// Look up a subscription by the composite `(resource_id, channel_id)`
    /// pair. Either field alone is ambiguous across re-subscriptions.
    async fn find_synchronization(
        &self,
        resource_id: &str,
        channel_id: &str,
    ) -> Result<Option<Synchronization>, DatabaseError>;

    /// Delete a subscription by ID.
    async fn delete_synchronization(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Sync lock ───────────────────────────────────────────────────

    /// Try to take the per-account sync lease. Succeeds if no lease exists
    /// or the existing one has expired. Returns `false` when another holder
    /// currently owns the lease.
    async fn try_acquire_sync_lock(
        &self,
        account_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Extend a held lease. Returns `false` if the lease is no longer owned
    /// by `holder`.
    async fn renew_sync_lock(
        &self,
        account_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Release a held lease. A lease owned by someone else is left alone.
    async fn release_sync_lock(&self, account_id: Uuid, holder: &str)
    -> Result<(), DatabaseError>;
}

//! Domain types for mirrored mailboxes: accounts, folders, messages, and
//! push subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Connection type ─────────────────────────────────────────────────

/// Which provider protocol an account speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Imap,
    Gmail,
    Outlook,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imap => "imap",
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "imap" => Some(Self::Imap),
            "gmail" => Some(Self::Gmail),
            "outlook" => Some(Self::Outlook),
            _ => None,
        }
    }
}

// ── Sync state ──────────────────────────────────────────────────────

/// Account sync lifecycle. ACTIVE accounts participate in scheduled and
/// push-triggered sync; DISABLED (user toggle) and STOPPED (persistent
/// provider failure) accounts are excluded from both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Active,
    Disabled,
    Stopped,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

// ── Folder identifier ───────────────────────────────────────────────

/// Provider-agnostic address of a remote folder.
///
/// IMAP addresses folders by mailbox path ("INBOX.Archive"); Gmail and
/// Outlook hand out opaque ids. Carrying the distinction in the type keeps
/// raw strings out of every client signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FolderIdentifier {
    /// Hierarchical mailbox path (IMAP).
    Path(String),
    /// Opaque provider-issued id (Gmail labels, Outlook folder ids).
    Opaque(String),
}

impl FolderIdentifier {
    pub fn path(p: impl Into<String>) -> Self {
        Self::Path(p.into())
    }

    pub fn opaque(id: impl Into<String>) -> Self {
        Self::Opaque(id.into())
    }

    /// The raw remote identifier, as stored in `email_account_folders.remote_id`.
    pub fn as_remote_id(&self) -> &str {
        match self {
            Self::Path(p) => p,
            Self::Opaque(id) => id,
        }
    }
}

impl std::fmt::Display for FolderIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_remote_id())
    }
}

// ── Account ─────────────────────────────────────────────────────────

/// A configured mailbox mirrored into the CRM.
///
/// Credentials are opaque to this core; clients receive them via the
/// token-provider / transport config injected at construction.
#[derive(Debug, Clone)]
pub struct EmailAccount {
    pub id: Uuid,
    pub display_name: String,
    pub connection_type: ConnectionType,
    pub sync_state: SyncState,
    /// Reason recorded by the last transition to STOPPED.
    pub stop_reason: Option<String>,
    /// Consecutive provider failures since the last success.
    pub failure_streak: u32,
    /// Lower bound for the first pull; older messages are never fetched.
    pub initial_sync_from: DateTime<Utc>,
    /// Owning user for personal accounts; `None` for shared accounts.
    pub owner_user_id: Option<String>,
    /// Remote id of the resolved sent folder, if configured.
    pub sent_folder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailAccount {
    pub fn new(display_name: &str, connection_type: ConnectionType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            connection_type,
            sync_state: SyncState::Active,
            stop_reason: None,
            failure_streak: 0,
            initial_sync_from: now,
            owner_user_id: None,
            sent_folder: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_owner(mut self, user_id: &str) -> Self {
        self.owner_user_id = Some(user_id.to_string());
        self
    }

    pub fn with_initial_sync_from(mut self, from: DateTime<Utc>) -> Self {
        self.initial_sync_from = from;
        self
    }

    // ── Sync state machine ──────────────────────────────────────────

    /// Whether the account participates in scheduled and push-triggered sync.
    pub fn can_sync(&self) -> bool {
        self.sync_state == SyncState::Active
    }

    /// User toggle: pause syncing. Only meaningful from ACTIVE.
    pub fn disable(&mut self) {
        if self.sync_state == SyncState::Active {
            self.sync_state = SyncState::Disabled;
            self.updated_at = Utc::now();
        }
    }

    /// User toggle / re-authentication: resume syncing from DISABLED or
    /// STOPPED. Clears the failure streak and stop reason.
    pub fn enable(&mut self) {
        self.sync_state = SyncState::Active;
        self.stop_reason = None;
        self.failure_streak = 0;
        self.updated_at = Utc::now();
    }

    /// Record a transient provider failure. Once the streak reaches
    /// `threshold` the account transitions to STOPPED with the given reason.
    /// Returns `true` if this call caused the transition.
    pub fn record_failure(&mut self, reason: &str, threshold: u32) -> bool {
        self.failure_streak = self.failure_streak.saturating_add(1);
        self.updated_at = Utc::now();
        if self.sync_state == SyncState::Active && self.failure_streak >= threshold {
            self.mark_stopped(reason);
            return true;
        }
        false
    }

    /// System-triggered transition after persistent provider failure.
    pub fn mark_stopped(&mut self, reason: &str) {
        self.sync_state = SyncState::Stopped;
        self.stop_reason = Some(reason.to_string());
        self.updated_at = Utc::now();
    }

    /// Record a successful provider interaction, clearing the streak.
    pub fn record_success(&mut self) {
        if self.failure_streak != 0 {
            self.failure_streak = 0;
            self.updated_at = Utc::now();
        }
    }
}

// ── Folder ──────────────────────────────────────────────────────────

/// A remote folder mirrored locally. Belongs to exactly one account.
#[derive(Debug, Clone)]
pub struct EmailAccountFolder {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Provider folder identifier (IMAP path or opaque id).
    pub remote_id: String,
    pub name: String,
    /// Whether the sync engine pulls messages from this folder.
    pub syncable: bool,
    /// Whether the provider allows moving messages into this folder.
    pub support_move: bool,
    /// Provider cursor of the last committed incremental batch.
    pub last_cursor: Option<String>,
}

impl EmailAccountFolder {
    pub fn new(account_id: Uuid, remote_id: &str, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            remote_id: remote_id.to_string(),
            name: name.to_string(),
            syncable: true,
            support_move: true,
            last_cursor: None,
        }
    }

    pub fn identifier(&self, connection_type: ConnectionType) -> FolderIdentifier {
        match connection_type {
            ConnectionType::Imap => FolderIdentifier::path(&self.remote_id),
            ConnectionType::Gmail | ConnectionType::Outlook => {
                FolderIdentifier::opaque(&self.remote_id)
            }
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// A synced message. May belong to one or more folders simultaneously
/// (label-style providers) via the `folder_memberships` join table.
#[derive(Debug, Clone)]
pub struct EmailAccountMessage {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Provider-native id; `(account_id, remote_id)` is unique and is the
    /// dedupe key for at-least-once webhook delivery.
    pub remote_id: String,
    /// RFC 5322 Message-Id header, when present.
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub is_read: bool,
    pub is_draft: bool,
    /// Whether this application composed and sent the message itself.
    pub is_sent_via_app: bool,
    pub date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl EmailAccountMessage {
    pub fn new(account_id: Uuid, remote_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            remote_id: remote_id.to_string(),
            message_id: None,
            subject: None,
            html_body: None,
            text_body: None,
            is_read: false,
            is_draft: false,
            is_sent_via_app: false,
            date: now,
            created_at: now,
        }
    }

    /// Heuristic reply detection from the subject prefix. Messages the app
    /// sent itself also carry `is_sent_via_app`.
    pub fn is_reply(&self) -> bool {
        self.subject
            .as_deref()
            .is_some_and(|s| s.trim_start().to_lowercase().starts_with("re:"))
    }
}

// ── Push subscription ───────────────────────────────────────────────

/// A webhook subscription issued by a push-capable provider, binding a
/// `(resource_id, channel_id)` pair to a local account/folder scope.
///
/// The composite pair, not either field alone, identifies a subscription.
#[derive(Debug, Clone)]
pub struct Synchronization {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Folder scope; `None` means the whole account.
    pub folder_id: Option<Uuid>,
    pub resource_id: String,
    pub channel_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Summaries ───────────────────────────────────────────────────────

/// Compact account projection returned to notification/badge collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub id: Uuid,
    pub display_name: String,
    pub connection_type: ConnectionType,
    pub sync_state: SyncState,
}

impl From<&EmailAccount> for AccountSummary {
    fn from(account: &EmailAccount) -> Self {
        Self {
            id: account.id,
            display_name: account.display_name.clone(),
            connection_type: account.connection_type,
            sync_state: account.sync_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_is_active() {
        let account = EmailAccount::new("Sales inbox", ConnectionType::Imap);
        assert_eq!(account.sync_state, SyncState::Active);
        assert!(account.can_sync());
    }

    #[test]
    fn disable_enable_toggle() {
        let mut account = EmailAccount::new("a", ConnectionType::Gmail);
        account.disable();
        assert_eq!(account.sync_state, SyncState::Disabled);
        assert!(!account.can_sync());
        account.enable();
        assert!(account.can_sync());
    }

    #[test]
    fn failure_streak_stops_account_at_threshold() {
        let mut account = EmailAccount::new("a", ConnectionType::Outlook);
        for _ in 0..2 {
            assert!(!account.record_failure("auth expired", 3));
        }
        assert!(account.can_sync());
        assert!(account.record_failure("auth expired", 3));
        assert_eq!(account.sync_state, SyncState::Stopped);
        assert_eq!(account.stop_reason.as_deref(), Some("auth expired"));
        assert!(!account.can_sync());
    }

    #[test]
    fn success_resets_streak() {
        let mut account = EmailAccount::new("a", ConnectionType::Imap);
        account.record_failure("timeout", 5);
        account.record_failure("timeout", 5);
        account.record_success();
        assert_eq!(account.failure_streak, 0);
        assert!(account.can_sync());
    }

    #[test]
    fn enable_after_stop_clears_reason() {
        let mut account = EmailAccount::new("a", ConnectionType::Gmail);
        account.mark_stopped("credentials revoked");
        assert!(!account.can_sync());
        account.enable();
        assert!(account.can_sync());
        assert!(account.stop_reason.is_none());
        assert_eq!(account.failure_streak, 0);
    }

    #[test]
    fn disable_is_noop_from_stopped() {
        let mut account = EmailAccount::new("a", ConnectionType::Imap);
        account.mark_stopped("gone");
        account.disable();
        assert_eq!(account.sync_state, SyncState::Stopped);
    }

    #[test]
    fn folder_identifier_kinds() {
        let imap = FolderIdentifier::path("INBOX.Archive");
        let gmail = FolderIdentifier::opaque("Label_42");
        assert_eq!(imap.as_remote_id(), "INBOX.Archive");
        assert_eq!(gmail.as_remote_id(), "Label_42");
        assert_ne!(imap, FolderIdentifier::opaque("INBOX.Archive"));
    }

    #[test]
    fn reply_detection_from_subject() {
        let mut msg = EmailAccountMessage::new(Uuid::new_v4(), "r1");
        msg.subject = Some("Re: quarterly numbers".into());
        assert!(msg.is_reply());
        msg.subject = Some("quarterly numbers".into());
        assert!(!msg.is_reply());
        msg.subject = None;
        assert!(!msg.is_reply());
    }
}

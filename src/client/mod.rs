//! Provider-agnostic mail client abstraction.
//!
//! One trait, three variants: raw IMAP (`ImapClient`), Gmail REST
//! (`GmailClient`), and Outlook/Graph REST (`OutlookClient`). All folder
//! addressing goes through [`FolderIdentifier`]; providers disagree on
//! whether folders are paths or opaque ids and no raw strings cross this
//! boundary.

pub mod gmail;
pub mod imap;
pub mod outlook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::MailError;
use crate::model::FolderIdentifier;

pub use gmail::GmailClient;
pub use imap::{ImapClient, ImapConfig};
pub use outlook::OutlookClient;

// ── Wire types ──────────────────────────────────────────────────────

/// A folder as reported by the provider.
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub identifier: FolderIdentifier,
    pub name: String,
    /// Whether the provider allows moving messages into this folder.
    pub support_move: bool,
}

/// A message as fetched from the provider, before persistence.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub remote_id: String,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub is_read: bool,
    pub is_draft: bool,
    pub date: DateTime<Utc>,
}

/// One page of an incremental fetch. `next_cursor` is the provider cursor
/// to persist once the page has been committed locally; `None` means the
/// folder is caught up.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub messages: Vec<RemoteMessage>,
    pub next_cursor: Option<String>,
}

/// An outgoing message draft handed to `send`/`reply`/`forward`.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMail {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
}

impl OutgoingMail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Body preferred for the wire: HTML when present, plain text otherwise.
    pub fn effective_body(&self) -> &str {
        self.html_body
            .as_deref()
            .or(self.text_body.as_deref())
            .unwrap_or("")
    }
}

// ── Token provider ──────────────────────────────────────────────────

/// Supplies a currently-valid OAuth access token. Token refresh is the
/// collaborator's concern; clients just ask before each call.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<SecretString, MailError>;
}

// ── Client trait ────────────────────────────────────────────────────

/// Capability set every provider variant implements.
#[async_trait]
pub trait MailClient: Send + Sync {
    /// Provider label used in logs and transient errors.
    fn provider(&self) -> &'static str;

    /// Enumerate remote folders.
    async fn fetch_folders(&self) -> Result<Vec<RemoteFolder>, MailError>;

    /// Fetch one page of messages from `folder`, starting at `cursor`
    /// (provider-native: UID watermark, history id, delta link).
    async fn fetch_messages(
        &self,
        folder: &FolderIdentifier,
        cursor: Option<&str>,
    ) -> Result<FetchPage, MailError>;

    /// Send a new message.
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;

    /// Reply to the remote message `remote_id` living in `folder`.
    async fn reply(
        &self,
        remote_id: &str,
        folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError>;

    /// Forward the remote message `remote_id` living in `folder`.
    async fn forward(
        &self,
        remote_id: &str,
        folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError>;

    /// File a copy of a just-sent message into `folder`. Providers whose
    /// send API already lands the message in the sent mailbox (Gmail,
    /// Outlook) keep the default no-op; SMTP-based sends override this
    /// with an IMAP APPEND.
    async fn append_sent(
        &self,
        _folder: &FolderIdentifier,
        _mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        Ok(())
    }

    /// Mark the given remote messages read.
    async fn mark_read(
        &self,
        folder: &FolderIdentifier,
        remote_ids: &[String],
    ) -> Result<(), MailError>;

    /// Move messages between folders.
    async fn move_messages(
        &self,
        remote_ids: &[String],
        from: &FolderIdentifier,
        to: &FolderIdentifier,
    ) -> Result<(), MailError>;
}

/// Assemble a minimal RFC 2822 message: used for Gmail `messages.send`
/// payloads and IMAP APPEND literals.
pub(crate) fn render_rfc2822(
    mail: &OutgoingMail,
    in_reply_to: Option<&str>,
    references: Option<&str>,
) -> String {
    let mut headers = String::new();
    if !mail.to.is_empty() {
        headers.push_str(&format!("To: {}\r\n", mail.to.join(", ")));
    }
    if !mail.cc.is_empty() {
        headers.push_str(&format!("Cc: {}\r\n", mail.cc.join(", ")));
    }
    if !mail.bcc.is_empty() {
        headers.push_str(&format!("Bcc: {}\r\n", mail.bcc.join(", ")));
    }
    headers.push_str(&format!(
        "Subject: {}\r\n",
        mail.subject.as_deref().unwrap_or("")
    ));
    if let Some(msg_id) = in_reply_to {
        headers.push_str(&format!("In-Reply-To: {msg_id}\r\n"));
        let refs = match references {
            Some(r) => format!("{r} {msg_id}"),
            None => msg_id.to_string(),
        };
        headers.push_str(&format!("References: {refs}\r\n"));
    }
    let content_type = if mail.html_body.is_some() {
        "text/html"
    } else {
        "text/plain"
    };
    headers.push_str("MIME-Version: 1.0\r\n");
    headers.push_str(&format!(
        "Content-Type: {content_type}; charset=\"UTF-8\"\r\n"
    ));
    format!("{headers}\r\n{}", mail.effective_body())
}

/// Resolve a configured sent-folder name against the account's
/// currently-synced folder set.
pub fn resolve_sent_folder(
    folders: &[RemoteFolder],
    name: &str,
) -> Result<FolderIdentifier, MailError> {
    folders
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(name) || f.identifier.as_remote_id() == name)
        .map(|f| f.identifier.clone())
        .ok_or_else(|| MailError::FolderNotFound(name.to_string()))
}

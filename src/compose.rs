//! Message composition: binds a mail client and a target message/folder to
//! produce an outgoing send, applying the outbound body pipeline.

use std::sync::Arc;

use tracing::warn;

use crate::body::outbound;
use crate::client::{MailClient, OutgoingMail, RemoteFolder, resolve_sent_folder};
use crate::collab::{MediaResolver, PlaceholderResolver};
use crate::error::MailError;
use crate::model::{EmailAccount, FolderIdentifier};

/// What `send()` dispatches to on the underlying client.
#[derive(Debug, Clone)]
pub enum ComposeMode {
    New,
    Reply {
        remote_id: String,
        folder: FolderIdentifier,
    },
    Forward {
        remote_id: String,
        folder: FolderIdentifier,
    },
}

/// Transient composer wrapping a client, an optional sent-folder, and the
/// draft under construction. Every setter passes straight through to the
/// draft except [`MessageComposer::set_html_body`], which runs the
/// outbound body pipeline first.
pub struct MessageComposer {
    client: Arc<dyn MailClient>,
    mode: ComposeMode,
    sent_folder: Option<FolderIdentifier>,
    media: Arc<dyn MediaResolver>,
    placeholders: Arc<dyn PlaceholderResolver>,
    media_path_prefix: String,
    tracker_snippet: Option<String>,
    draft: OutgoingMail,
}

impl MessageComposer {
    pub fn new(
        client: Arc<dyn MailClient>,
        mode: ComposeMode,
        media: Arc<dyn MediaResolver>,
        placeholders: Arc<dyn PlaceholderResolver>,
        media_path_prefix: &str,
    ) -> Self {
        Self {
            client,
            mode,
            sent_folder: None,
            media,
            placeholders,
            media_path_prefix: media_path_prefix.to_string(),
            tracker_snippet: None,
            draft: OutgoingMail::new(),
        }
    }

    /// Resolve and pin the sent folder against the account's
    /// currently-synced folder set.
    pub fn set_sent_folder(
        &mut self,
        name: &str,
        synced_folders: &[RemoteFolder],
    ) -> Result<(), MailError> {
        self.sent_folder = Some(resolve_sent_folder(synced_folders, name)?);
        Ok(())
    }

    /// Pin the sent folder from the account's configured name. Accounts
    /// without one rely on the provider filing sent mail itself.
    pub fn set_sent_folder_from_account(
        &mut self,
        account: &EmailAccount,
        synced_folders: &[RemoteFolder],
    ) -> Result<(), MailError> {
        if let Some(name) = &account.sent_folder {
            self.set_sent_folder(name, synced_folders)?;
        }
        Ok(())
    }

    pub fn sent_folder(&self) -> Option<&FolderIdentifier> {
        self.sent_folder.as_ref()
    }

    /// Enable tracker injection. Idempotent: the snippet is guarded by a
    /// marker and never injected twice.
    pub fn with_trackers(&mut self, snippet: &str) -> &mut Self {
        self.tracker_snippet = Some(snippet.to_string());
        self
    }

    // ── Pass-through setters ────────────────────────────────────────

    pub fn set_to(&mut self, to: Vec<String>) -> &mut Self {
        self.draft.to = to;
        self
    }

    pub fn set_cc(&mut self, cc: Vec<String>) -> &mut Self {
        self.draft.cc = cc;
        self
    }

    pub fn set_bcc(&mut self, bcc: Vec<String>) -> &mut Self {
        self.draft.bcc = bcc;
        self
    }

    pub fn set_subject(&mut self, subject: &str) -> &mut Self {
        self.draft.subject = Some(subject.to_string());
        self
    }

    pub fn set_text_body(&mut self, text: &str) -> &mut Self {
        self.draft.text_body = Some(text.to_string());
        self
    }

    // ── Intercepted setter ──────────────────────────────────────────

    /// Set the HTML body, running the outbound pipeline: editor-residue
    /// normalization, merge-field resolution, and inline-image embedding.
    pub async fn set_html_body(&mut self, html: &str) -> Result<&mut Self, MailError> {
        let normalized = outbound::normalize_editor_paragraphs(html);
        let resolved = outbound::resolve_placeholders(&normalized, self.placeholders.as_ref());
        let embedded = outbound::embed_inline_images(
            &resolved,
            &self.media_path_prefix,
            self.media.as_ref(),
        )
        .await?;
        self.draft.html_body = Some(embedded);
        Ok(self)
    }

    /// Dispatch the draft: Reply and Forward delegate to the client's
    /// corresponding operation, New goes out as a fresh send. A resolved
    /// sent folder gets a copy filed after dispatch; the copy is
    /// best-effort, the send has already happened.
    pub async fn send(mut self) -> Result<(), MailError> {
        if let (Some(snippet), Some(html)) = (&self.tracker_snippet, &self.draft.html_body) {
            self.draft.html_body = Some(outbound::inject_trackers(html, snippet));
        }
        match &self.mode {
            ComposeMode::New => self.client.send(&self.draft).await?,
            ComposeMode::Reply { remote_id, folder } => {
                self.client.reply(remote_id, folder, &self.draft).await?
            }
            ComposeMode::Forward { remote_id, folder } => {
                self.client.forward(remote_id, folder, &self.draft).await?
            }
        }
        if let Some(folder) = &self.sent_folder {
            if let Err(error) = self.client.append_sent(folder, &self.draft).await {
                warn!(%error, "Failed to file copy into the sent folder");
            }
        }
        Ok(())
    }

    /// The draft as it stands; what `send()` would dispatch.
    pub fn draft(&self) -> &OutgoingMail {
        &self.draft
    }
}

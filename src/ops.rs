//! Batch message operations: mark-as-read and move.
//!
//! Both operations are all-or-nothing. Authorization is checked for the
//! owning account before anything is touched; a single denial rejects the
//! whole batch. The local mirror commits in one store transaction and is
//! authoritative — the provider is mirrored afterwards, and a mirroring
//! failure is logged without rolling the local state back.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collab::Authorizer;
use crate::error::{DatabaseError, MailError};
use crate::model::{AccountSummary, EmailAccount, EmailAccountMessage};
use crate::store::MailStore;
use crate::sync::ClientFactory;

/// Result of a committed batch operation, shaped for API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// Unread count for the account after the batch.
    pub unread_count: u64,
    pub account: AccountSummary,
    /// Target folder, set by move operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_to_folder_id: Option<Uuid>,
}

/// Authorized, transactional batch operations over synced messages.
pub struct BatchMessageOperations {
    store: Arc<dyn MailStore>,
    authorizer: Arc<dyn Authorizer>,
    clients: Arc<dyn ClientFactory>,
}

impl BatchMessageOperations {
    pub fn new(
        store: Arc<dyn MailStore>,
        authorizer: Arc<dyn Authorizer>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            store,
            authorizer,
            clients,
        }
    }

    /// Mark a batch of messages read.
    ///
    /// Every target must belong to `account_id` and the user must be allowed
    /// to view the account; otherwise the batch is rejected with zero
    /// mutation. Returns the recomputed unread count.
    pub async fn mark_as_read(
        &self,
        user_id: &str,
        account_id: Uuid,
        message_ids: &[Uuid],
    ) -> Result<BatchOutcome, MailError> {
        let account = self.load_authorized_account(user_id, account_id).await?;
        let messages = self.load_account_messages(&account, message_ids).await?;

        self.store
            .mark_messages_read(account_id, message_ids)
            .await?;

        self.mirror_mark_read(&account, &messages).await;

        Ok(BatchOutcome {
            unread_count: self.store.count_unread(account_id).await?,
            account: AccountSummary::from(&account),
            moved_to_folder_id: None,
        })
    }

    /// Move a batch of messages into `target_folder_id`.
    ///
    /// The target must belong to the account and support moves. With
    /// `source_folder_id` set only that membership is replaced; without it
    /// the messages end up exclusively in the target folder.
    pub async fn move_messages(
        &self,
        user_id: &str,
        account_id: Uuid,
        message_ids: &[Uuid],
        target_folder_id: Uuid,
        source_folder_id: Option<Uuid>,
    ) -> Result<BatchOutcome, MailError> {
        let account = self.load_authorized_account(user_id, account_id).await?;

        let target = self
            .store
            .get_folder(target_folder_id)
            .await?
            .filter(|f| f.account_id == account_id)
            .ok_or_else(|| MailError::FolderNotFound(target_folder_id.to_string()))?;
        if !target.support_move {
            return Err(MailError::UnsupportedMoveTarget {
                folder_id: target_folder_id,
            });
        }

        let messages = self.load_account_messages(&account, message_ids).await?;

        // Source identifiers for provider mirroring, captured before the
        // local rewrite discards the old memberships.
        let sources = self.current_folders(message_ids, source_folder_id).await?;

        self.store
            .move_messages_locally(message_ids, source_folder_id, target_folder_id)
            .await?;

        self.mirror_move(&account, &messages, &sources, &target).await;

        Ok(BatchOutcome {
            unread_count: self.store.count_unread(account_id).await?,
            account: AccountSummary::from(&account),
            moved_to_folder_id: Some(target_folder_id),
        })
    }

    async fn load_authorized_account(
        &self,
        user_id: &str,
        account_id: Uuid,
    ) -> Result<EmailAccount, MailError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(MailError::Database(DatabaseError::NotFound {
                entity: "email_account".into(),
                id: account_id.to_string(),
            }))?;

        if !self.authorizer.can_view(user_id, &account).await {
            return Err(MailError::UnauthorizedAccountAccess {
                user_id: user_id.to_string(),
                account_id,
            });
        }
        Ok(account)
    }

    /// Load every target message and verify it belongs to the account.
    async fn load_account_messages(
        &self,
        account: &EmailAccount,
        message_ids: &[Uuid],
    ) -> Result<Vec<EmailAccountMessage>, MailError> {
        let mut messages = Vec::with_capacity(message_ids.len());
        for id in message_ids {
            let message = self
                .store
                .get_message(*id)
                .await?
                .filter(|m| m.account_id == account.id)
                .ok_or(MailError::Database(DatabaseError::NotFound {
                    entity: "email_account_message".into(),
                    id: id.to_string(),
                }))?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Map each message to the folder it is mirrored from, preferring the
    /// explicit source folder when given.
    async fn current_folders(
        &self,
        message_ids: &[Uuid],
        source_folder_id: Option<Uuid>,
    ) -> Result<HashMap<Uuid, Uuid>, MailError> {
        let mut sources = HashMap::new();
        for id in message_ids {
            let folder = match source_folder_id {
                Some(folder) => Some(folder),
                None => self.store.folders_of_message(*id).await?.into_iter().next(),
            };
            if let Some(folder) = folder {
                sources.insert(*id, folder);
            }
        }
        Ok(sources)
    }

    /// Mirror a committed mark-read to the provider. Best effort only.
    async fn mirror_mark_read(&self, account: &EmailAccount, messages: &[EmailAccountMessage]) {
        let client = match self.clients.client_for(account) {
            Ok(client) => client,
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "No client for read mirroring");
                return;
            }
        };

        // Group by folder; the IMAP variant needs a selected mailbox.
        let mut by_folder: HashMap<Uuid, Vec<String>> = HashMap::new();
        for message in messages {
            let folder = match self.store.folders_of_message(message.id).await {
                Ok(folders) => folders.into_iter().next(),
                Err(_) => None,
            };
            if let Some(folder) = folder {
                by_folder
                    .entry(folder)
                    .or_default()
                    .push(message.remote_id.clone());
            }
        }

        for (folder_id, remote_ids) in by_folder {
            let Ok(Some(folder)) = self.store.get_folder(folder_id).await else {
                continue;
            };
            let identifier = folder.identifier(account.connection_type);
            if let Err(e) = client.mark_read(&identifier, &remote_ids).await {
                warn!(
                    account_id = %account.id,
                    folder = %identifier,
                    error = %e,
                    "Provider read mirroring failed"
                );
            }
        }
    }

    /// Mirror a committed move to the provider. Best effort only.
    async fn mirror_move(
        &self,
        account: &EmailAccount,
        messages: &[EmailAccountMessage],
        sources: &HashMap<Uuid, Uuid>,
        target: &crate::model::EmailAccountFolder,
    ) {
        let client = match self.clients.client_for(account) {
            Ok(client) => client,
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "No client for move mirroring");
                return;
            }
        };

        let to = target.identifier(account.connection_type);

        // Group by source folder so each provider call has one origin.
        let mut by_source: HashMap<Uuid, Vec<String>> = HashMap::new();
        for message in messages {
            if let Some(source) = sources.get(&message.id) {
                by_source
                    .entry(*source)
                    .or_default()
                    .push(message.remote_id.clone());
            }
        }

        for (source_id, remote_ids) in by_source {
            let Ok(Some(source)) = self.store.get_folder(source_id).await else {
                continue;
            };
            let from = source.identifier(account.connection_type);
            match client.move_messages(&remote_ids, &from, &to).await {
                Ok(()) => {
                    debug!(
                        account_id = %account.id,
                        from = %from,
                        to = %to,
                        count = remote_ids.len(),
                        "Mirrored move to provider"
                    );
                }
                Err(e) => {
                    warn!(
                        account_id = %account.id,
                        from = %from,
                        error = %e,
                        "Provider move mirroring failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::client::{FetchPage, MailClient, OutgoingMail, RemoteFolder};
    use crate::model::{ConnectionType, EmailAccountFolder, EmailAccountMessage, FolderIdentifier};
    use crate::store::LibSqlBackend;

    /// Allows exactly one user.
    struct OwnerOnly(&'static str);

    #[async_trait]
    impl Authorizer for OwnerOnly {
        async fn can_view(&self, user_id: &str, _account: &EmailAccount) -> bool {
            user_id == self.0
        }
    }

    /// Client that records mirroring calls.
    #[derive(Default)]
    struct RecordingClient {
        marked: Mutex<Vec<String>>,
        moved: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MailClient for RecordingClient {
        fn provider(&self) -> &'static str {
            "recording"
        }
        async fn fetch_folders(&self) -> Result<Vec<RemoteFolder>, MailError> {
            Ok(vec![])
        }
        async fn fetch_messages(
            &self,
            _folder: &FolderIdentifier,
            _cursor: Option<&str>,
        ) -> Result<FetchPage, MailError> {
            Ok(FetchPage::default())
        }
        async fn send(&self, _mail: &OutgoingMail) -> Result<(), MailError> {
            Ok(())
        }
        async fn reply(
            &self,
            _remote_id: &str,
            _folder: &FolderIdentifier,
            _mail: &OutgoingMail,
        ) -> Result<(), MailError> {
            Ok(())
        }
        async fn forward(
            &self,
            _remote_id: &str,
            _folder: &FolderIdentifier,
            _mail: &OutgoingMail,
        ) -> Result<(), MailError> {
            Ok(())
        }
        async fn mark_read(
            &self,
            _folder: &FolderIdentifier,
            remote_ids: &[String],
        ) -> Result<(), MailError> {
            self.marked.lock().unwrap().extend_from_slice(remote_ids);
            Ok(())
        }
        async fn move_messages(
            &self,
            remote_ids: &[String],
            _from: &FolderIdentifier,
            to: &FolderIdentifier,
        ) -> Result<(), MailError> {
            let mut moved = self.moved.lock().unwrap();
            for id in remote_ids {
                moved.push((id.clone(), to.as_remote_id().to_string()));
            }
            Ok(())
        }
    }

    struct StubFactory(Arc<RecordingClient>);

    impl ClientFactory for StubFactory {
        fn client_for(&self, _account: &EmailAccount) -> Result<Arc<dyn MailClient>, MailError> {
            Ok(Arc::clone(&self.0) as Arc<dyn MailClient>)
        }
    }

    struct Fixture {
        ops: BatchMessageOperations,
        store: Arc<dyn MailStore>,
        client: Arc<RecordingClient>,
        account: EmailAccount,
        inbox: EmailAccountFolder,
        archive: EmailAccountFolder,
        messages: Vec<Uuid>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn MailStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let account = EmailAccount::new("Shared inbox", ConnectionType::Gmail);
        store.insert_account(&account).await.unwrap();

        let inbox = store
            .upsert_folder(&EmailAccountFolder::new(account.id, "INBOX", "Inbox"))
            .await
            .unwrap();
        let mut archive_candidate = EmailAccountFolder::new(account.id, "ARCHIVE", "Archive");
        archive_candidate.support_move = true;
        let archive = store.upsert_folder(&archive_candidate).await.unwrap();

        let mut messages = Vec::new();
        for n in 0..3 {
            let msg = EmailAccountMessage::new(account.id, &format!("remote-{n}"));
            messages.push(store.upsert_message(&msg, inbox.id).await.unwrap());
        }

        let client = Arc::new(RecordingClient::default());
        let ops = BatchMessageOperations::new(
            Arc::clone(&store),
            Arc::new(OwnerOnly("carol")),
            Arc::new(StubFactory(Arc::clone(&client))),
        );

        Fixture {
            ops,
            store,
            client,
            account,
            inbox,
            archive,
            messages,
        }
    }

    #[tokio::test]
    async fn mark_as_read_updates_count_and_mirrors() {
        let f = fixture().await;

        let outcome = f
            .ops
            .mark_as_read("carol", f.account.id, &f.messages)
            .await
            .unwrap();

        assert_eq!(outcome.unread_count, 0);
        assert_eq!(outcome.account.id, f.account.id);
        assert!(outcome.moved_to_folder_id.is_none());
        assert_eq!(f.client.marked.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unauthorized_user_mutates_nothing() {
        let f = fixture().await;

        let err = f
            .ops
            .mark_as_read("mallory", f.account.id, &f.messages)
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::UnauthorizedAccountAccess { .. }));

        assert_eq!(f.store.count_unread(f.account.id).await.unwrap(), 3);
        assert!(f.client.marked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_message_rejects_whole_batch() {
        let f = fixture().await;

        let other = EmailAccount::new("Other", ConnectionType::Imap);
        f.store.insert_account(&other).await.unwrap();
        let other_folder = f
            .store
            .upsert_folder(&EmailAccountFolder::new(other.id, "INBOX", "Inbox"))
            .await
            .unwrap();
        let foreign = f
            .store
            .upsert_message(
                &EmailAccountMessage::new(other.id, "foreign-1"),
                other_folder.id,
            )
            .await
            .unwrap();

        let mut ids = f.messages.clone();
        ids.push(foreign);
        assert!(f.ops.mark_as_read("carol", f.account.id, &ids).await.is_err());
        assert_eq!(f.store.count_unread(f.account.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn move_rehomes_and_mirrors() {
        let f = fixture().await;

        let outcome = f
            .ops
            .move_messages(
                "carol",
                f.account.id,
                &f.messages,
                f.archive.id,
                Some(f.inbox.id),
            )
            .await
            .unwrap();

        assert_eq!(outcome.moved_to_folder_id, Some(f.archive.id));
        assert!(
            f.store
                .list_messages_in_folder(f.inbox.id, 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            f.store
                .list_messages_in_folder(f.archive.id, 10)
                .await
                .unwrap()
                .len(),
            3
        );

        let moved = f.client.moved.lock().unwrap();
        assert_eq!(moved.len(), 3);
        assert!(moved.iter().all(|(_, to)| to == "ARCHIVE"));
    }

    #[tokio::test]
    async fn move_to_unmovable_folder_is_rejected() {
        let f = fixture().await;

        let mut no_move = EmailAccountFolder::new(f.account.id, "SENT", "Sent");
        no_move.support_move = false;
        let sent = f.store.upsert_folder(&no_move).await.unwrap();

        let err = f
            .ops
            .move_messages("carol", f.account.id, &f.messages, sent.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::UnsupportedMoveTarget { folder_id } if folder_id == sent.id));

        // Messages stay where they were.
        assert_eq!(
            f.store
                .list_messages_in_folder(f.inbox.id, 10)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn move_to_foreign_folder_is_folder_not_found() {
        let f = fixture().await;

        let other = EmailAccount::new("Other", ConnectionType::Imap);
        f.store.insert_account(&other).await.unwrap();
        let foreign_folder = f
            .store
            .upsert_folder(&EmailAccountFolder::new(other.id, "X", "X"))
            .await
            .unwrap();

        let err = f
            .ops
            .move_messages("carol", f.account.id, &f.messages, foreign_folder.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::FolderNotFound(_)));
    }
}

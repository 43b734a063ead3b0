//! libSQL backend — async `MailStore` implementation.
//!
//! Supports local file and in-memory databases. Batch message operations
//! run inside a libsql transaction so partial application cannot leak out.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    ConnectionType, EmailAccount, EmailAccountFolder, EmailAccountMessage, SyncState,
    Synchronization,
};
use crate::store::migrations;
use crate::store::traits::MailStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("Invalid UUID in row: {e}")))
}

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

/// Map a libsql Row to an EmailAccount.
///
/// Column order: 0:id, 1:display_name, 2:connection_type, 3:sync_state,
/// 4:stop_reason, 5:failure_streak, 6:initial_sync_from, 7:owner_user_id,
/// 8:sent_folder, 9:created_at, 10:updated_at
fn row_to_account(row: &libsql::Row) -> Result<EmailAccount, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let display_name: String = row.get(1).map_err(query_err)?;
    let connection_str: String = row.get(2).map_err(query_err)?;
    let state_str: String = row.get(3).map_err(query_err)?;
    let stop_reason: Option<String> = row.get(4).ok();
    let failure_streak: i64 = row.get(5).map_err(query_err)?;
    let initial_str: String = row.get(6).map_err(query_err)?;
    let owner_user_id: Option<String> = row.get(7).ok();
    let sent_folder: Option<String> = row.get(8).ok();
    let created_str: String = row.get(9).map_err(query_err)?;
    let updated_str: String = row.get(10).map_err(query_err)?;

    let connection_type = ConnectionType::parse(&connection_str).ok_or_else(|| {
        DatabaseError::Query(format!("Unknown connection type: {connection_str}"))
    })?;

    Ok(EmailAccount {
        id: parse_uuid(&id)?,
        display_name,
        connection_type,
        sync_state: SyncState::parse(&state_str).unwrap_or(SyncState::Stopped),
        stop_reason: stop_reason.filter(|s| !s.is_empty()),
        failure_streak: failure_streak.max(0) as u32,
        initial_sync_from: parse_datetime(&initial_str),
        owner_user_id,
        sent_folder,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const ACCOUNT_COLUMNS: &str = "id, display_name, connection_type, sync_state, stop_reason, \
     failure_streak, initial_sync_from, owner_user_id, sent_folder, created_at, updated_at";

/// Map a libsql Row to an EmailAccountFolder.
///
/// Column order: 0:id, 1:account_id, 2:remote_id, 3:name, 4:syncable,
/// 5:support_move, 6:last_cursor
fn row_to_folder(row: &libsql::Row) -> Result<EmailAccountFolder, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let account_id: String = row.get(1).map_err(query_err)?;
    let syncable: i64 = row.get(4).map_err(query_err)?;
    let support_move: i64 = row.get(5).map_err(query_err)?;
    let last_cursor: Option<String> = row.get(6).ok();

    Ok(EmailAccountFolder {
        id: parse_uuid(&id)?,
        account_id: parse_uuid(&account_id)?,
        remote_id: row.get(2).map_err(query_err)?,
        name: row.get(3).map_err(query_err)?,
        syncable: syncable != 0,
        support_move: support_move != 0,
        last_cursor,
    })
}

const FOLDER_COLUMNS: &str = "id, account_id, remote_id, name, syncable, support_move, last_cursor";

/// Map a libsql Row to an EmailAccountMessage.
///
/// Column order: 0:id, 1:account_id, 2:remote_id, 3:message_id, 4:subject,
/// 5:html_body, 6:text_body, 7:is_read, 8:is_draft, 9:is_sent_via_app,
/// 10:date, 11:created_at
fn row_to_message(row: &libsql::Row) -> Result<EmailAccountMessage, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let account_id: String = row.get(1).map_err(query_err)?;
    let is_read: i64 = row.get(7).map_err(query_err)?;
    let is_draft: i64 = row.get(8).map_err(query_err)?;
    let is_sent_via_app: i64 = row.get(9).map_err(query_err)?;
    let date_str: String = row.get(10).map_err(query_err)?;
    let created_str: String = row.get(11).map_err(query_err)?;

    Ok(EmailAccountMessage {
        id: parse_uuid(&id)?,
        account_id: parse_uuid(&account_id)?,
        remote_id: row.get(2).map_err(query_err)?,
        message_id: row.get(3).ok(),
        subject: row.get(4).ok(),
        html_body: row.get(5).ok(),
        text_body: row.get(6).ok(),
        is_read: is_read != 0,
        is_draft: is_draft != 0,
        is_sent_via_app: is_sent_via_app != 0,
        date: parse_datetime(&date_str),
        created_at: parse_datetime(&created_str),
    })
}

const MESSAGE_COLUMNS: &str = "id, account_id, remote_id, message_id, subject, html_body, \
     text_body, is_read, is_draft, is_sent_via_app, date, created_at";

// Qualified for joins against folder_memberships, which also carries a
// message_id column.
const MESSAGE_COLUMNS_M: &str = "m.id, m.account_id, m.remote_id, m.message_id, m.subject, \
     m.html_body, m.text_body, m.is_read, m.is_draft, m.is_sent_via_app, m.date, m.created_at";

/// Map a libsql Row to a Synchronization.
fn row_to_synchronization(row: &libsql::Row) -> Result<Synchronization, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let account_id: String = row.get(1).map_err(query_err)?;
    let folder_id: Option<String> = row.get(2).ok();
    let expires_str: Option<String> = row.get(5).ok();
    let created_str: String = row.get(6).map_err(query_err)?;

    Ok(Synchronization {
        id: parse_uuid(&id)?,
        account_id: parse_uuid(&account_id)?,
        folder_id: match folder_id {
            Some(f) => Some(parse_uuid(&f)?),
            None => None,
        },
        resource_id: row.get(3).map_err(query_err)?,
        channel_id: row.get(4).map_err(query_err)?,
        expires_at: expires_str.map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&created_str),
    })
}

const SYNC_COLUMNS: &str =
    "id, account_id, folder_id, resource_id, channel_id, expires_at, created_at";

#[async_trait]
impl MailStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &EmailAccount) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO email_accounts
                 (id, display_name, connection_type, sync_state, stop_reason,
                  failure_streak, initial_sync_from, owner_user_id, sent_folder,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    account.id.to_string(),
                    account.display_name.as_str(),
                    account.connection_type.as_str(),
                    account.sync_state.as_str(),
                    account.stop_reason.as_deref(),
                    account.failure_streak as i64,
                    account.initial_sync_from.to_rfc3339(),
                    account.owner_user_id.as_deref(),
                    account.sent_folder.as_deref(),
                    account.created_at.to_rfc3339(),
                    account.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<EmailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_accounts(&self) -> Result<Vec<EmailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM email_accounts ORDER BY created_at"),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn list_syncable_accounts(&self) -> Result<Vec<EmailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM email_accounts
                     WHERE sync_state = 'active' ORDER BY created_at"
                ),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn update_account(&self, account: &EmailAccount) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE email_accounts
                 SET display_name = ?2, sync_state = ?3, stop_reason = ?4,
                     failure_streak = ?5, sent_folder = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    account.id.to_string(),
                    account.display_name.as_str(),
                    account.sync_state.as_str(),
                    account.stop_reason.as_deref(),
                    account.failure_streak as i64,
                    account.sent_folder.as_deref(),
                    account.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "email_account".into(),
                id: account.id.to_string(),
            });
        }
        Ok(())
    }

    // ── Folders ─────────────────────────────────────────────────────

    async fn upsert_folder(
        &self,
        folder: &EmailAccountFolder,
    ) -> Result<EmailAccountFolder, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO email_account_folders
                 (id, account_id, remote_id, name, syncable, support_move, last_cursor)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (account_id, remote_id) DO UPDATE SET
                     name = excluded.name,
                     support_move = excluded.support_move",
                params![
                    folder.id.to_string(),
                    folder.account_id.to_string(),
                    folder.remote_id.as_str(),
                    folder.name.as_str(),
                    folder.syncable as i64,
                    folder.support_move as i64,
                    folder.last_cursor.as_deref(),
                ],
            )
            .await
            .map_err(query_err)?;

        // Re-read: on conflict the stored row keeps its original ID and cursor.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FOLDER_COLUMNS} FROM email_account_folders
                     WHERE account_id = ?1 AND remote_id = ?2"
                ),
                params![folder.account_id.to_string(), folder.remote_id.as_str()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_folder(&row),
            None => Err(DatabaseError::NotFound {
                entity: "email_account_folder".into(),
                id: folder.remote_id.clone(),
            }),
        }
    }

    async fn get_folder(&self, id: Uuid) -> Result<Option<EmailAccountFolder>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FOLDER_COLUMNS} FROM email_account_folders WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_folder(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_folders(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<EmailAccountFolder>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FOLDER_COLUMNS} FROM email_account_folders
                     WHERE account_id = ?1 ORDER BY name"
                ),
                params![account_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut folders = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            folders.push(row_to_folder(&row)?);
        }
        Ok(folders)
    }

    async fn update_folder_cursor(
        &self,
        folder_id: Uuid,
        cursor: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE email_account_folders SET last_cursor = ?2 WHERE id = ?1",
                params![folder_id.to_string(), cursor],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_folder_syncable(
        &self,
        folder_id: Uuid,
        syncable: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE email_account_folders SET syncable = ?2 WHERE id = ?1",
                params![folder_id.to_string(), syncable as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn upsert_message(
        &self,
        message: &EmailAccountMessage,
        folder_id: Uuid,
    ) -> Result<Uuid, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err)?;

        tx.execute(
            "INSERT INTO email_account_messages
             (id, account_id, remote_id, message_id, subject, html_body, text_body,
              is_read, is_draft, is_sent_via_app, date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (account_id, remote_id) DO UPDATE SET
                 message_id = excluded.message_id,
                 subject = excluded.subject,
                 html_body = excluded.html_body,
                 text_body = excluded.text_body,
                 is_read = excluded.is_read,
                 is_draft = excluded.is_draft",
            params![
                message.id.to_string(),
                message.account_id.to_string(),
                message.remote_id.as_str(),
                message.message_id.as_deref(),
                message.subject.as_deref(),
                message.html_body.as_deref(),
                message.text_body.as_deref(),
                message.is_read as i64,
                message.is_draft as i64,
                message.is_sent_via_app as i64,
                message.date.to_rfc3339(),
                message.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(query_err)?;

        // The stored row keeps its original ID when the insert hit the
        // (account_id, remote_id) conflict path.
        let mut rows = tx
            .query(
                "SELECT id FROM email_account_messages
                 WHERE account_id = ?1 AND remote_id = ?2",
                params![message.account_id.to_string(), message.remote_id.as_str()],
            )
            .await
            .map_err(query_err)?;

        let stored_id = match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(query_err)?;
                parse_uuid(&id)?
            }
            None => {
                return Err(DatabaseError::NotFound {
                    entity: "email_account_message".into(),
                    id: message.remote_id.clone(),
                });
            }
        };

        tx.execute(
            "INSERT OR IGNORE INTO folder_memberships (message_id, folder_id) VALUES (?1, ?2)",
            params![stored_id.to_string(), folder_id.to_string()],
        )
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(stored_id)
    }

    async fn get_message(
        &self,
        id: Uuid,
    ) -> Result<Option<EmailAccountMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM email_account_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_message_by_remote_id(
        &self,
        account_id: Uuid,
        remote_id: &str,
    ) -> Result<Option<EmailAccountMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM email_account_messages
                     WHERE account_id = ?1 AND remote_id = ?2"
                ),
                params![account_id.to_string(), remote_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_messages_in_folder(
        &self,
        folder_id: Uuid,
        limit: usize,
    ) -> Result<Vec<EmailAccountMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS_M} FROM email_account_messages m
                     JOIN folder_memberships fm ON fm.message_id = m.id
                     WHERE fm.folder_id = ?1
                     ORDER BY m.date DESC LIMIT ?2"
                ),
                params![folder_id.to_string(), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn count_unread(&self, account_id: Uuid) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM email_account_messages
                 WHERE account_id = ?1 AND is_read = 0 AND is_draft = 0",
                params![account_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let count: i64 = row.get(0).map_err(query_err)?;
                Ok(count.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    async fn mark_messages_read(
        &self,
        account_id: Uuid,
        message_ids: &[Uuid],
    ) -> Result<(), DatabaseError> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let tx = self.conn().transaction().await.map_err(query_err)?;
        for id in message_ids {
            let affected = tx
                .execute(
                    "UPDATE email_account_messages SET is_read = 1
                     WHERE id = ?1 AND account_id = ?2",
                    params![id.to_string(), account_id.to_string()],
                )
                .await
                .map_err(query_err)?;
            if affected == 0 {
                tx.rollback().await.map_err(query_err)?;
                return Err(DatabaseError::NotFound {
                    entity: "email_account_message".into(),
                    id: id.to_string(),
                });
            }
        }
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn move_messages_locally(
        &self,
        message_ids: &[Uuid],
        from_folder: Option<Uuid>,
        to_folder: Uuid,
    ) -> Result<(), DatabaseError> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let tx = self.conn().transaction().await.map_err(query_err)?;
        for id in message_ids {
            match from_folder {
                Some(from) => {
                    tx.execute(
                        "DELETE FROM folder_memberships
                         WHERE message_id = ?1 AND folder_id = ?2",
                        params![id.to_string(), from.to_string()],
                    )
                    .await
                    .map_err(query_err)?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM folder_memberships WHERE message_id = ?1",
                        params![id.to_string()],
                    )
                    .await
                    .map_err(query_err)?;
                }
            }
            tx.execute(
                "INSERT OR IGNORE INTO folder_memberships (message_id, folder_id)
                 VALUES (?1, ?2)",
                params![id.to_string(), to_folder.to_string()],
            )
            .await
            .map_err(query_err)?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn folders_of_message(&self, message_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT folder_id FROM folder_memberships WHERE message_id = ?1",
                params![message_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut folders = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id: String = row.get(0).map_err(query_err)?;
            folders.push(parse_uuid(&id)?);
        }
        Ok(folders)
    }

    // ── Push subscriptions ──────────────────────────────────────────

    async fn insert_synchronization(&self, sync: &Synchronization) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO synchronizations
                 (id, account_id, folder_id, resource_id, channel_id, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sync.id.to_string(),
                    sync.account_id.to_string(),
                    sync.folder_id.map(|f| f.to_string()),
                    sync.resource_id.as_str(),
                    sync.channel_id.as_str(),
                    sync.expires_at.map(|t| t.to_rfc3339()),
                    sync.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!(
                        "Subscription ({}, {}) already exists",
                        sync.resource_id, sync.channel_id
                    ))
                } else {
                    DatabaseError::Query(msg)
                }
            })?;
        Ok(())
    }

    async fn find_synchronization(
        &self,
        resource_id: &str,
        channel_id: &str,
    ) -> Result<Option<Synchronization>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SYNC_COLUMNS} FROM synchronizations
                     WHERE resource_id = ?1 AND channel_id = ?2"
                ),
                params![resource_id, channel_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_synchronization(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete_synchronization(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM synchronizations WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Sync lock ───────────────────────────────────────────────────

    async fn try_acquire_sync_lock(
        &self,
        account_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let expires_at = now + ttl;

        // Takes the lease when none exists or the current one has lapsed.
        // The WHERE clause on the conflict path makes a live foreign lease
        // a no-op, which we detect through the affected-row count.
        let affected = self
            .conn()
            .execute(
                "INSERT INTO sync_locks (account_id, holder, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (account_id) DO UPDATE SET
                     holder = excluded.holder,
                     expires_at = excluded.expires_at
                 WHERE sync_locks.expires_at <= ?4 OR sync_locks.holder = excluded.holder",
                params![
                    account_id.to_string(),
                    holder,
                    expires_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;

        Ok(affected > 0)
    }

    async fn renew_sync_lock(
        &self,
        account_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let expires_at = Utc::now() + ttl;
        let affected = self
            .conn()
            .execute(
                "UPDATE sync_locks SET expires_at = ?3
                 WHERE account_id = ?1 AND holder = ?2",
                params![account_id.to_string(), holder, expires_at.to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn release_sync_lock(
        &self,
        account_id: Uuid,
        holder: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM sync_locks WHERE account_id = ?1 AND holder = ?2",
                params![account_id.to_string(), holder],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionType;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn seeded_account(store: &LibSqlBackend) -> EmailAccount {
        let account = EmailAccount::new("Sales inbox", ConnectionType::Gmail);
        store.insert_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn local_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.db");

        let account = {
            let store = LibSqlBackend::new_local(&path).await.unwrap();
            seeded_account(&store).await
        };

        let store = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = store.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(loaded.display_name, "Sales inbox");
    }

    #[tokio::test]
    async fn account_round_trip() {
        let store = backend().await;
        let account = seeded_account(&store).await;

        let loaded = store.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(loaded.display_name, "Sales inbox");
        assert_eq!(loaded.connection_type, ConnectionType::Gmail);
        assert_eq!(loaded.sync_state, SyncState::Active);
        assert_eq!(loaded.failure_streak, 0);
    }

    #[tokio::test]
    async fn stopped_accounts_excluded_from_syncable_list() {
        let store = backend().await;
        let active = seeded_account(&store).await;
        let mut stopped = EmailAccount::new("Dead inbox", ConnectionType::Imap);
        stopped.mark_stopped("credentials revoked");
        store.insert_account(&stopped).await.unwrap();

        let syncable = store.list_syncable_accounts().await.unwrap();
        assert_eq!(syncable.len(), 1);
        assert_eq!(syncable[0].id, active.id);

        let loaded = store.get_account(stopped.id).await.unwrap().unwrap();
        assert_eq!(loaded.stop_reason.as_deref(), Some("credentials revoked"));
    }

    #[tokio::test]
    async fn folder_upsert_preserves_id_and_cursor() {
        let store = backend().await;
        let account = seeded_account(&store).await;

        let folder = EmailAccountFolder::new(account.id, "INBOX", "Inbox");
        let stored = store.upsert_folder(&folder).await.unwrap();
        store
            .update_folder_cursor(stored.id, Some("4711"))
            .await
            .unwrap();

        // Same remote folder discovered again, provider renamed it.
        let mut rediscovered = EmailAccountFolder::new(account.id, "INBOX", "Posteingang");
        rediscovered.support_move = false;
        let after = store.upsert_folder(&rediscovered).await.unwrap();

        assert_eq!(after.id, stored.id);
        assert_eq!(after.name, "Posteingang");
        assert!(!after.support_move);
        assert_eq!(after.last_cursor.as_deref(), Some("4711"));
    }

    #[tokio::test]
    async fn message_upsert_dedupes_on_remote_id() {
        let store = backend().await;
        let account = seeded_account(&store).await;
        let folder = store
            .upsert_folder(&EmailAccountFolder::new(account.id, "INBOX", "Inbox"))
            .await
            .unwrap();

        let mut msg = EmailAccountMessage::new(account.id, "remote-1");
        msg.subject = Some("hello".into());
        let first_id = store.upsert_message(&msg, folder.id).await.unwrap();

        // Second delivery of the same remote message (new local UUID).
        let mut dup = EmailAccountMessage::new(account.id, "remote-1");
        dup.subject = Some("hello".into());
        dup.is_read = true;
        let second_id = store.upsert_message(&dup, folder.id).await.unwrap();

        assert_eq!(first_id, second_id);
        let stored = store.get_message(first_id).await.unwrap().unwrap();
        assert!(stored.is_read);
        assert_eq!(store.count_unread(account.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn folder_listing_joins_memberships() {
        let store = backend().await;
        let account = seeded_account(&store).await;
        let inbox = store
            .upsert_folder(&EmailAccountFolder::new(account.id, "INBOX", "Inbox"))
            .await
            .unwrap();
        let archive = store
            .upsert_folder(&EmailAccountFolder::new(account.id, "ARCHIVE", "Archive"))
            .await
            .unwrap();

        let kept = EmailAccountMessage::new(account.id, "remote-1");
        store.upsert_message(&kept, inbox.id).await.unwrap();
        let filed = EmailAccountMessage::new(account.id, "remote-2");
        store.upsert_message(&filed, archive.id).await.unwrap();

        let listed = store.list_messages_in_folder(inbox.id, 50).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].remote_id, "remote-1");
    }

    #[tokio::test]
    async fn mark_read_is_all_or_nothing() {
        let store = backend().await;
        let account = seeded_account(&store).await;
        let folder = store
            .upsert_folder(&EmailAccountFolder::new(account.id, "INBOX", "Inbox"))
            .await
            .unwrap();

        let msg = EmailAccountMessage::new(account.id, "remote-1");
        let id = store.upsert_message(&msg, folder.id).await.unwrap();

        let bogus = Uuid::new_v4();
        let result = store.mark_messages_read(account.id, &[id, bogus]).await;
        assert!(result.is_err());

        // The valid row must not have been updated.
        assert_eq!(store.count_unread(account.id).await.unwrap(), 1);

        store.mark_messages_read(account.id, &[id]).await.unwrap();
        assert_eq!(store.count_unread(account.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn move_rehomes_folder_membership() {
        let store = backend().await;
        let account = seeded_account(&store).await;
        let inbox = store
            .upsert_folder(&EmailAccountFolder::new(account.id, "INBOX", "Inbox"))
            .await
            .unwrap();
        let archive = store
            .upsert_folder(&EmailAccountFolder::new(account.id, "ARCHIVE", "Archive"))
            .await
            .unwrap();

        let msg = EmailAccountMessage::new(account.id, "remote-1");
        let id = store.upsert_message(&msg, inbox.id).await.unwrap();

        store
            .move_messages_locally(&[id], Some(inbox.id), archive.id)
            .await
            .unwrap();

        assert!(
            store
                .list_messages_in_folder(inbox.id, 10)
                .await
                .unwrap()
                .is_empty()
        );
        let archived = store.list_messages_in_folder(archive.id, 10).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, id);
        assert_eq!(store.folders_of_message(id).await.unwrap(), vec![archive.id]);
    }

    #[tokio::test]
    async fn synchronization_lookup_is_composite() {
        let store = backend().await;
        let account = seeded_account(&store).await;

        let sync = Synchronization {
            id: Uuid::new_v4(),
            account_id: account.id,
            folder_id: None,
            resource_id: "res-1".into(),
            channel_id: "chan-1".into(),
            expires_at: None,
            created_at: Utc::now(),
        };
        store.insert_synchronization(&sync).await.unwrap();

        assert!(
            store
                .find_synchronization("res-1", "chan-1")
                .await
                .unwrap()
                .is_some()
        );
        // Matching resource under a different channel is a different
        // subscription and must not resolve.
        assert!(
            store
                .find_synchronization("res-1", "chan-2")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .find_synchronization("res-2", "chan-1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn sync_lock_excludes_second_holder() {
        let store = backend().await;
        let account = seeded_account(&store).await;
        let ttl = Duration::minutes(5);

        assert!(
            store
                .try_acquire_sync_lock(account.id, "worker-a", ttl)
                .await
                .unwrap()
        );
        assert!(
            !store
                .try_acquire_sync_lock(account.id, "worker-b", ttl)
                .await
                .unwrap()
        );
        // Re-entry by the same holder refreshes the lease.
        assert!(
            store
                .try_acquire_sync_lock(account.id, "worker-a", ttl)
                .await
                .unwrap()
        );

        store
            .release_sync_lock(account.id, "worker-a")
            .await
            .unwrap();
        assert!(
            store
                .try_acquire_sync_lock(account.id, "worker-b", ttl)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn expired_lock_can_be_stolen() {
        let store = backend().await;
        let account = seeded_account(&store).await;

        assert!(
            store
                .try_acquire_sync_lock(account.id, "worker-a", Duration::seconds(-1))
                .await
                .unwrap()
        );
        assert!(
            store
                .try_acquire_sync_lock(account.id, "worker-b", Duration::minutes(5))
                .await
                .unwrap()
        );
        assert!(
            !store
                .renew_sync_lock(account.id, "worker-a", Duration::minutes(5))
                .await
                .unwrap()
        );
    }
}

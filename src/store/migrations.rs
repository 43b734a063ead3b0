//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS email_accounts (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                connection_type TEXT NOT NULL,
                sync_state TEXT NOT NULL DEFAULT 'active',
                stop_reason TEXT,
                failure_streak INTEGER NOT NULL DEFAULT 0,
                initial_sync_from TEXT NOT NULL,
                owner_user_id TEXT,
                sent_folder TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_email_accounts_sync_state
                ON email_accounts(sync_state);

            CREATE TABLE IF NOT EXISTS email_account_folders (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES email_accounts(id) ON DELETE CASCADE,
                remote_id TEXT NOT NULL,
                name TEXT NOT NULL,
                syncable INTEGER NOT NULL DEFAULT 1,
                support_move INTEGER NOT NULL DEFAULT 1,
                last_cursor TEXT,
                UNIQUE (account_id, remote_id)
            );
            CREATE INDEX IF NOT EXISTS idx_folders_account
                ON email_account_folders(account_id);

            CREATE TABLE IF NOT EXISTS email_account_messages (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES email_accounts(id) ON DELETE CASCADE,
                remote_id TEXT NOT NULL,
                message_id TEXT,
                subject TEXT,
                html_body TEXT,
                text_body TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                is_draft INTEGER NOT NULL DEFAULT 0,
                is_sent_via_app INTEGER NOT NULL DEFAULT 0,
                date TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (account_id, remote_id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_account
                ON email_account_messages(account_id);
            CREATE INDEX IF NOT EXISTS idx_messages_unread
                ON email_account_messages(account_id, is_read);

            CREATE TABLE IF NOT EXISTS folder_memberships (
                message_id TEXT NOT NULL REFERENCES email_account_messages(id) ON DELETE CASCADE,
                folder_id TEXT NOT NULL REFERENCES email_account_folders(id) ON DELETE CASCADE,
                PRIMARY KEY (message_id, folder_id)
            );
            CREATE INDEX IF NOT EXISTS idx_memberships_folder
                ON folder_memberships(folder_id);

            CREATE TABLE IF NOT EXISTS synchronizations (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES email_accounts(id) ON DELETE CASCADE,
                folder_id TEXT REFERENCES email_account_folders(id) ON DELETE CASCADE,
                resource_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                expires_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (resource_id, channel_id)
            );
            CREATE INDEX IF NOT EXISTS idx_synchronizations_account
                ON synchronizations(account_id);

            CREATE TABLE IF NOT EXISTS sync_locks (
                account_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!("Database migrations complete (at V{})", {
        get_current_version(conn).await?
    });

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                (),
            )
            .await
            .unwrap();

        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            tables.push(row.get::<String>(0).unwrap());
        }

        for expected in [
            "email_accounts",
            "email_account_folders",
            "email_account_messages",
            "folder_memberships",
            "synchronizations",
            "sync_locks",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(
            get_current_version(&conn).await.unwrap(),
            MIGRATIONS.last().unwrap().version
        );
    }

    #[tokio::test]
    async fn duplicate_remote_message_id_rejected() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO email_accounts (id, display_name, connection_type, initial_sync_from)
             VALUES ('a1', 'test', 'imap', datetime('now'))",
            (),
        )
        .await
        .unwrap();

        conn.execute(
            "INSERT INTO email_account_messages (id, account_id, remote_id, date)
             VALUES ('m1', 'a1', 'r1', datetime('now'))",
            (),
        )
        .await
        .unwrap();

        let dup = conn
            .execute(
                "INSERT INTO email_account_messages (id, account_id, remote_id, date)
                 VALUES ('m2', 'a1', 'r1', datetime('now'))",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}

//! Error types for the mailbox integration core.

use uuid::Uuid;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox domain errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// The referenced folder is not part of the account's synced folder set.
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// The target folder's capabilities disallow moving messages into it.
    #[error("Folder {folder_id} does not support move")]
    UnsupportedMoveTarget { folder_id: Uuid },

    /// Batch-wide rejection; no partial effect has taken place.
    #[error("User {user_id} may not access account {account_id}")]
    UnauthorizedAccountAccess { user_id: String, account_id: Uuid },

    /// No subscription matches the (resource_id, channel_id) pair.
    #[error("Unknown webhook subscription: resource {resource_id}, channel {channel_id}")]
    UnknownWebhookSubscription {
        resource_id: String,
        channel_id: String,
    },

    /// A single provider call failed; the caller logs it and counts it
    /// toward the account's failure streak.
    #[error("Provider {provider} call failed: {reason}")]
    TransientProvider { provider: String, reason: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Account {account_id} cannot sync in state {state}")]
    SyncDisabled { account_id: Uuid, state: String },

    #[error("Sync already running for account {account_id}")]
    SyncInProgress { account_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl MailError {
    /// Shorthand for a transient provider failure.
    pub fn transient(provider: &str, reason: impl std::fmt::Display) -> Self {
        Self::TransientProvider {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

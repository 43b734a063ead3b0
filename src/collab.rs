//! Narrow contracts for external collaborators.
//!
//! The CRM's permission system, media storage, and merge-field engine live
//! outside this core; batch operations and the compose pipeline only ever
//! see these traits.

use async_trait::async_trait;

use crate::error::MailError;
use crate::model::EmailAccount;

/// Authorization collaborator, consulted before any batch read/move.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `user_id` may view messages of `account`. A single denial
    /// aborts the whole batch.
    async fn can_view(&self, user_id: &str, account: &EmailAccount) -> bool;
}

/// Media collaborator resolving embedded media tokens during composition.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Resolve a media token to its binary content and MIME type.
    async fn resolve_by_token(&self, token: &str) -> Result<(Vec<u8>, String), MailError>;
}

/// Resolves merge-field placeholders in outgoing bodies.
pub trait PlaceholderResolver: Send + Sync {
    /// Resolve a placeholder key ("first_name") to its value, or `None` to
    /// leave the placeholder text untouched.
    fn resolve(&self, key: &str) -> Option<String>;
}

/// Resolver that leaves every placeholder untouched.
pub struct NoopPlaceholders;

impl PlaceholderResolver for NoopPlaceholders {
    fn resolve(&self, _key: &str) -> Option<String> {
        None
    }
}

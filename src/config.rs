//! Configuration types, built from environment variables.

use std::time::Duration;

/// Core configuration for the mailbox integration service.
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Path to the local libSQL database file.
    pub db_path: String,
    /// Port for the webhook HTTP server.
    pub webhook_port: u16,
    /// Interval between scheduled sync passes over ACTIVE accounts.
    pub sync_interval: Duration,
    /// Consecutive provider failures before an account is marked STOPPED.
    pub failure_threshold: u32,
    /// Lease TTL for the per-account sync lock.
    pub sync_lock_ttl: Duration,
    /// Base path prefix of the application's own media-serving URLs.
    /// Inline images under this prefix are embedded as data URIs on send.
    pub media_path_prefix: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/mailcrm.db".to_string(),
            webhook_port: 8080,
            sync_interval: Duration::from_secs(300),
            failure_threshold: 5,
            sync_lock_ttl: Duration::from_secs(120),
            media_path_prefix: "/files/".to_string(),
        }
    }
}

impl MailConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let db_path = std::env::var("MAILCRM_DB_PATH").unwrap_or(defaults.db_path);

        let webhook_port: u16 = std::env::var("MAILCRM_WEBHOOK_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.webhook_port);

        let sync_interval = std::env::var("MAILCRM_SYNC_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_interval);

        let failure_threshold: u32 = std::env::var("MAILCRM_FAILURE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.failure_threshold);

        let sync_lock_ttl = std::env::var("MAILCRM_SYNC_LOCK_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_lock_ttl);

        let media_path_prefix =
            std::env::var("MAILCRM_MEDIA_PATH_PREFIX").unwrap_or(defaults.media_path_prefix);

        Self {
            db_path,
            webhook_port,
            sync_interval,
            failure_threshold,
            sync_lock_ttl,
            media_path_prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = MailConfig::default();
        assert_eq!(cfg.failure_threshold, 5);
        assert!(cfg.sync_lock_ttl < cfg.sync_interval + Duration::from_secs(60));
    }
}

use std::sync::Arc;

use mailcrm::client::{GmailClient, ImapClient, ImapConfig, MailClient, OutlookClient, TokenProvider};
use mailcrm::config::MailConfig;
use mailcrm::error::MailError;
use mailcrm::model::{ConnectionType, EmailAccount};
use mailcrm::store::{LibSqlBackend, MailStore};
use mailcrm::sync::{ClientFactory, EngineTrigger, SyncEngine, SyncLock, spawn_sync_scheduler};
use mailcrm::webhook::webhook_routes;
use secrecy::SecretString;

/// Access-token provider reading a static token from the environment.
///
/// The real CRM injects one backed by its OAuth token service; this binary
/// only needs something valid for the session it is run in.
struct EnvToken(String);

#[async_trait::async_trait]
impl TokenProvider for EnvToken {
    async fn access_token(&self) -> Result<SecretString, MailError> {
        std::env::var(&self.0)
            .map(SecretString::from)
            .map_err(|_| MailError::transient("token", format!("{} not set", self.0)))
    }
}

/// Builds provider clients from environment credentials.
struct EnvClientFactory;

impl ClientFactory for EnvClientFactory {
    fn client_for(&self, account: &EmailAccount) -> Result<Arc<dyn MailClient>, MailError> {
        match account.connection_type {
            ConnectionType::Imap => {
                let config = ImapConfig::from_env()
                    .ok_or_else(|| MailError::transient("imap", "MAILCRM_IMAP_HOST not set"))?;
                Ok(Arc::new(ImapClient::new(config)))
            }
            ConnectionType::Gmail => Ok(Arc::new(GmailClient::new(Arc::new(EnvToken(
                "MAILCRM_GMAIL_TOKEN".into(),
            ))))),
            ConnectionType::Outlook => Ok(Arc::new(OutlookClient::new(Arc::new(EnvToken(
                "MAILCRM_OUTLOOK_TOKEN".into(),
            ))))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = MailConfig::from_env();

    eprintln!("📬 mailcrm v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!(
        "   Webhook: http://0.0.0.0:{}/webhooks/mail",
        config.webhook_port
    );
    eprintln!("   Sync: every {}s\n", config.sync_interval.as_secs());

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let store: Arc<dyn MailStore> = Arc::new(
        LibSqlBackend::new_local(db_path).await.unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
            std::process::exit(1);
        }),
    );

    // ── Sync engine ──────────────────────────────────────────────────────
    let lock = SyncLock::new(Arc::clone(&store), config.sync_lock_ttl);
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::new(EnvClientFactory),
        lock,
        config.failure_threshold,
    ));

    // ── Webhook server ───────────────────────────────────────────────────
    let trigger = Arc::new(EngineTrigger(Arc::clone(&engine)));
    let app = webhook_routes(Arc::clone(&store), trigger);
    let webhook_port = config.webhook_port;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{webhook_port}"))
            .await
            .expect("Failed to bind webhook port");
        tracing::info!(port = webhook_port, "Webhook server started");
        axum::serve(listener, app).await.ok();
    });

    // ── Scheduler ────────────────────────────────────────────────────────
    let (scheduler_handle, shutdown) =
        spawn_sync_scheduler(Arc::clone(&store), engine, config.sync_interval);

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down…");
    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    scheduler_handle.abort();

    Ok(())
}

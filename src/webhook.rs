//! Webhook endpoint for provider push notifications.
//!
//! Push-capable providers (Gmail watch, Graph subscriptions) POST here when
//! a watched mailbox changes. The notification itself carries no mail; it
//! only says "something happened to resource X on channel Y". The handler
//! resolves the `(resource_id, channel_id)` pair to a stored subscription
//! and asks the [`ResyncTrigger`] for an incremental resync. Delivery is
//! at-least-once, so the whole path must tolerate duplicates; the message
//! upsert dedupe makes that free.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use tracing::{debug, info, warn};

use crate::store::MailStore;
use crate::sync::ResyncTrigger;

/// Axum handler state (cloneable).
#[derive(Clone)]
pub struct WebhookState {
    store: Arc<dyn MailStore>,
    trigger: Arc<dyn ResyncTrigger>,
}

/// Build the webhook router.
///
/// Call this once and merge with the main app router.
pub fn webhook_routes(store: Arc<dyn MailStore>, trigger: Arc<dyn ResyncTrigger>) -> Router {
    Router::new()
        .route("/webhooks/mail", post(handle_mail_notification))
        .with_state(WebhookState { store, trigger })
}

/// `POST /webhooks/mail`
///
/// Headers:
/// - `resource-state` — provider change kind; only `exists` carries work
/// - `resource-id` / `channel-id` — composite subscription key
///
/// Responses: 200 empty on accepted or ignorable notifications, 400 on a
/// malformed request, 404 when no subscription matches the composite pair
/// (stale subscriptions on the provider side die off this way).
async fn handle_mail_notification(
    State(state): State<WebhookState>,
    headers: HeaderMap,
) -> StatusCode {
    let resource_state = header_str(&headers, "resource-state").unwrap_or("");
    if resource_state != "exists" {
        debug!(resource_state, "Ignoring non-exists notification");
        return StatusCode::OK;
    }

    let (Some(resource_id), Some(channel_id)) = (
        header_str(&headers, "resource-id"),
        header_str(&headers, "channel-id"),
    ) else {
        warn!("Notification missing resource-id/channel-id headers");
        return StatusCode::BAD_REQUEST;
    };

    let sync = match state.store.find_synchronization(resource_id, channel_id).await {
        Ok(Some(sync)) => sync,
        Ok(None) => {
            info!(resource_id, channel_id, "Unknown webhook subscription");
            return StatusCode::NOT_FOUND;
        }
        Err(e) => {
            warn!(error = %e, "Subscription lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    debug!(
        account_id = %sync.account_id,
        resource_id,
        channel_id,
        "Push notification matched, triggering resync"
    );

    match state.trigger.ping(&sync).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(account_id = %sync.account_id, error = %e, "Resync trigger failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

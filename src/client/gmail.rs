//! Gmail variant — label-style provider over the Gmail REST surface.
//!
//! Folders are Gmail labels (opaque ids); incremental pulls ride the
//! `history.list` API keyed by a durable history id; mark-read and move
//! go through `messages.batchModify` label operations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::client::{
    FetchPage, MailClient, OutgoingMail, RemoteFolder, RemoteMessage, TokenProvider,
    render_rfc2822,
};
use crate::error::MailError;
use crate::model::FolderIdentifier;

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";
const PAGE_SIZE: usize = 50;
const MAX_RATE_LIMIT_RETRIES: usize = 3;

// Durable cursor forms. `messages.list` page tokens do not outlive the
// listing session that issued them, so the persisted cursor is a history
// id: snapshotted before the initial listing starts and carried through
// its page cursors, then advanced by `history.list` once caught up.
const HISTORY_CURSOR: &str = "history:";
const PAGE_CURSOR: &str = "page:";

/// Gmail mail client.
pub struct GmailClient {
    http: reqwest::Client,
    token: Arc<dyn TokenProvider>,
    base_url: String,
}

impl GmailClient {
    pub fn new(token: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different base URL (tests, proxies).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn bearer(&self) -> Result<String, MailError> {
        Ok(self.token.access_token().await?.expose_secret().to_string())
    }

    /// GET with bounded retry on 429, honoring `Retry-After`. Other
    /// non-success statuses come back in the inner `Err` so callers can
    /// react to expired cursors without string matching.
    async fn get_json_status<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Result<T, (StatusCode, String)>, MailError> {
        let token = self.bearer().await?;
        let mut backoff = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .http
                .get(url)
                .bearer_auth(&token)
                .header("accept", "application/json")
                .send()
                .await
                .map_err(|e| MailError::transient("gmail", e))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    return Err(MailError::transient("gmail", "rate limit retries exhausted"));
                }
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(backoff);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                backoff = (backoff * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| MailError::transient("gmail", e))?;
            if !status.is_success() {
                return Ok(Err((status, body)));
            }
            return serde_json::from_str(&body)
                .map(Ok)
                .map_err(|e| MailError::transient("gmail", format!("decode: {e}")));
        }

        Err(MailError::transient("gmail", "request failed without response"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, MailError> {
        match self.get_json_status(url).await? {
            Ok(value) => Ok(value),
            Err((status, body)) => Err(MailError::transient(
                "gmail",
                format!("status {status}: {body}"),
            )),
        }
    }

    async fn post_json(&self, url: &str, payload: &serde_json::Value) -> Result<String, MailError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&token)
            .json(payload)
            .send()
            .await
            .map_err(|e| MailError::transient("gmail", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MailError::transient("gmail", e))?;
        if !status.is_success() {
            return Err(MailError::transient(
                "gmail",
                format!("status {status}: {body}"),
            ));
        }
        Ok(body)
    }

    async fn get_message(&self, id: &str) -> Result<GmailMessage, MailError> {
        let url = format!("{}/users/me/messages/{id}?format=full", self.base_url);
        self.get_json(&url).await
    }

    /// Fetch one message, `None` when it was deleted in the meantime.
    /// History entries can reference messages that no longer exist.
    async fn get_message_opt(&self, id: &str) -> Result<Option<GmailMessage>, MailError> {
        let url = format!("{}/users/me/messages/{id}?format=full", self.base_url);
        match self.get_json_status(&url).await? {
            Ok(msg) => Ok(Some(msg)),
            Err((StatusCode::NOT_FOUND, _)) => Ok(None),
            Err((status, body)) => Err(MailError::transient(
                "gmail",
                format!("status {status}: {body}"),
            )),
        }
    }

    async fn profile_history_id(&self) -> Result<String, MailError> {
        let url = format!("{}/users/me/profile", self.base_url);
        let profile: GmailProfile = self.get_json(&url).await?;
        Ok(profile.history_id)
    }

    /// One page of the initial `messages.list` walk. `snapshot` is the
    /// history id captured before the walk began; it becomes the durable
    /// cursor once the walk drains, so anything arriving mid-walk is
    /// covered by the first incremental pull.
    async fn fetch_listing(
        &self,
        label: &str,
        snapshot: Option<String>,
        page_token: Option<&str>,
    ) -> Result<FetchPage, MailError> {
        let snapshot = match snapshot {
            Some(id) => id,
            None => self.profile_history_id().await?,
        };

        let mut url = format!(
            "{}/users/me/messages?maxResults={PAGE_SIZE}&labelIds={label}",
            self.base_url
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={token}"));
        }

        let list: GmailMessageList = match self.get_json_status(&url).await? {
            Ok(list) => list,
            // A page token persisted by an interrupted walk has expired;
            // restart the walk, duplicates collapse on upsert.
            Err((StatusCode::BAD_REQUEST, _)) if page_token.is_some() => {
                return Box::pin(self.fetch_listing(label, None, None)).await;
            }
            Err((status, body)) => {
                return Err(MailError::transient(
                    "gmail",
                    format!("status {status}: {body}"),
                ));
            }
        };

        let mut messages = Vec::new();
        for stub in list.messages.unwrap_or_default() {
            if let Some(full) = self.get_message_opt(&stub.id).await? {
                messages.push(to_remote_message(full));
            }
        }

        let next_cursor = match list.next_page_token {
            Some(token) => Some(format!("{PAGE_CURSOR}{snapshot}:{token}")),
            None => Some(format!("{HISTORY_CURSOR}{snapshot}")),
        };
        Ok(FetchPage {
            messages,
            next_cursor,
        })
    }

    /// Incremental pull: everything added to `label` since `start`.
    async fn fetch_history(&self, label: &str, start: &str) -> Result<FetchPage, MailError> {
        let mut ids: Vec<String> = Vec::new();
        let mut latest = start.to_string();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/users/me/history?startHistoryId={start}&historyTypes=messageAdded\
                 &labelId={label}&maxResults={PAGE_SIZE}",
                self.base_url
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }

            let page: GmailHistoryList = match self.get_json_status(&url).await? {
                Ok(page) => page,
                // The start id aged out of Gmail's history window; fall
                // back to a fresh walk.
                Err((StatusCode::NOT_FOUND, _)) => {
                    return Box::pin(self.fetch_listing(label, None, None)).await;
                }
                Err((status, body)) => {
                    return Err(MailError::transient(
                        "gmail",
                        format!("status {status}: {body}"),
                    ));
                }
            };

            if let Some(id) = page.history_id {
                latest = id;
            }
            for entry in page.history.unwrap_or_default() {
                for added in entry.messages_added.unwrap_or_default() {
                    ids.push(added.message.id);
                }
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        ids.sort();
        ids.dedup();
        let mut messages = Vec::new();
        for id in &ids {
            if let Some(full) = self.get_message_opt(id).await? {
                messages.push(to_remote_message(full));
            }
        }

        Ok(FetchPage {
            messages,
            next_cursor: Some(format!("{HISTORY_CURSOR}{latest}")),
        })
    }

    /// Send a raw RFC 2822 payload, optionally pinned to a thread.
    async fn send_raw(&self, rfc2822: String, thread_id: Option<&str>) -> Result<(), MailError> {
        let raw = URL_SAFE_NO_PAD.encode(rfc2822.as_bytes());
        let mut payload = serde_json::json!({ "raw": raw });
        if let Some(thread_id) = thread_id {
            payload["threadId"] = serde_json::json!(thread_id);
        }
        let url = format!("{}/users/me/messages/send", self.base_url);
        self.post_json(&url, &payload).await?;
        Ok(())
    }
}

#[async_trait]
impl MailClient for GmailClient {
    fn provider(&self) -> &'static str {
        "gmail"
    }

    async fn fetch_folders(&self) -> Result<Vec<RemoteFolder>, MailError> {
        let url = format!("{}/users/me/labels", self.base_url);
        let list: GmailLabelList = self.get_json(&url).await?;
        Ok(list
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| {
                // SENT and DRAFT are maintained by Gmail; messages cannot
                // be moved into them by label surgery.
                let support_move = label.id != "SENT" && label.id != "DRAFT";
                RemoteFolder {
                    identifier: FolderIdentifier::opaque(&label.id),
                    name: label.name,
                    support_move,
                }
            })
            .collect())
    }

    async fn fetch_messages(
        &self,
        folder: &FolderIdentifier,
        cursor: Option<&str>,
    ) -> Result<FetchPage, MailError> {
        let label = folder.as_remote_id();
        if let Some(start) = cursor.and_then(|c| c.strip_prefix(HISTORY_CURSOR)) {
            return self.fetch_history(label, start).await;
        }
        if let Some(rest) = cursor.and_then(|c| c.strip_prefix(PAGE_CURSOR)) {
            if let Some((snapshot, token)) = rest.split_once(':') {
                return self
                    .fetch_listing(label, Some(snapshot.to_string()), Some(token))
                    .await;
            }
        }
        self.fetch_listing(label, None, None).await
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        self.send_raw(render_rfc2822(mail, None, None), None).await
    }

    async fn reply(
        &self,
        remote_id: &str,
        _folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        let original = self.get_message(remote_id).await?;
        let message_id = header_value(&original.payload, "Message-ID");
        let references = header_value(&original.payload, "References");
        self.send_raw(
            render_rfc2822(mail, message_id.as_deref(), references.as_deref()),
            Some(&original.thread_id),
        )
        .await
    }

    async fn forward(
        &self,
        _remote_id: &str,
        _folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        self.send_raw(render_rfc2822(mail, None, None), None).await
    }

    async fn mark_read(
        &self,
        _folder: &FolderIdentifier,
        remote_ids: &[String],
    ) -> Result<(), MailError> {
        if remote_ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/users/me/messages/batchModify", self.base_url);
        let payload = serde_json::json!({
            "ids": remote_ids,
            "removeLabelIds": ["UNREAD"],
        });
        self.post_json(&url, &payload).await?;
        Ok(())
    }

    async fn move_messages(
        &self,
        remote_ids: &[String],
        from: &FolderIdentifier,
        to: &FolderIdentifier,
    ) -> Result<(), MailError> {
        if remote_ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/users/me/messages/batchModify", self.base_url);
        let payload = serde_json::json!({
            "ids": remote_ids,
            "addLabelIds": [to.as_remote_id()],
            "removeLabelIds": [from.as_remote_id()],
        });
        self.post_json(&url, &payload).await?;
        Ok(())
    }
}

// ── Wire mapping ────────────────────────────────────────────────────

fn to_remote_message(msg: GmailMessage) -> RemoteMessage {
    let label_ids = msg.label_ids.unwrap_or_default();
    let date = msg
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let mut html_body = None;
    let mut text_body = None;
    collect_bodies(&msg.payload, &mut html_body, &mut text_body);

    RemoteMessage {
        remote_id: msg.id,
        message_id: header_value(&msg.payload, "Message-ID"),
        subject: header_value(&msg.payload, "Subject"),
        from: header_value(&msg.payload, "From"),
        html_body,
        text_body,
        is_read: !label_ids.iter().any(|l| l == "UNREAD"),
        is_draft: label_ids.iter().any(|l| l == "DRAFT"),
        date,
    }
}

fn header_value(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Walk the MIME part tree collecting the first text/html and text/plain
/// bodies.
fn collect_bodies(
    payload: &GmailPayload,
    html_body: &mut Option<String>,
    text_body: &mut Option<String>,
) {
    let mime = payload.mime_type.as_deref().unwrap_or("");
    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
        match mime {
            "text/html" if html_body.is_none() => *html_body = decode_body(data),
            "text/plain" if text_body.is_none() => *text_body = decode_body(data),
            _ => {}
        }
    }
    for part in payload.parts.as_deref().unwrap_or_default() {
        collect_bodies(part, html_body, text_body);
    }
}

/// Gmail body data is URL-safe base64, sometimes padded.
fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

// ── Gmail API response types ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GmailLabelList {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailProfile {
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Deserialize)]
struct GmailHistoryList {
    history: Option<Vec<GmailHistoryEntry>>,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailHistoryEntry {
    #[serde(rename = "messagesAdded")]
    messages_added: Option<Vec<GmailHistoryMessage>>,
}

#[derive(Debug, Deserialize)]
struct GmailHistoryMessage {
    message: GmailMessageStub,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: GmailPayload,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    data: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::{Path, Query};
    use axum::routing::get;
    use axum::{Json, Router};
    use secrecy::SecretString;

    use super::*;

    struct StaticToken;

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn access_token(&self) -> Result<SecretString, MailError> {
            Ok(SecretString::from("test-token"))
        }
    }

    fn full_message(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "threadId": format!("t-{id}"),
            "labelIds": ["INBOX"],
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [{"name": "Subject", "value": id}],
                "body": {"data": URL_SAFE_NO_PAD.encode("body")}
            }
        })
    }

    /// Mailbox fixture: the listing yields m1 then m2 across two pages at
    /// history id 1000, and one later arrival m3 at history id 1010.
    async fn spawn_fake_gmail() -> String {
        let app = Router::new()
            .route(
                "/users/me/profile",
                get(|| async { Json(serde_json::json!({"historyId": "1000"})) }),
            )
            .route(
                "/users/me/messages",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let body = match q.get("pageToken").map(String::as_str) {
                        None => serde_json::json!({
                            "messages": [{"id": "m1"}],
                            "nextPageToken": "tok1"
                        }),
                        Some("tok1") => serde_json::json!({"messages": [{"id": "m2"}]}),
                        Some(_) => return Err(axum::http::StatusCode::BAD_REQUEST),
                    };
                    Ok(Json(body))
                }),
            )
            .route(
                "/users/me/messages/{id}",
                get(|Path(id): Path<String>| async move { Json(full_message(&id)) }),
            )
            .route(
                "/users/me/history",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("startHistoryId").map(String::as_str) == Some("9") {
                        return Err(axum::http::StatusCode::NOT_FOUND);
                    }
                    Ok(Json(serde_json::json!({
                        "history": [{"messagesAdded": [{"message": {"id": "m3"}}]}],
                        "historyId": "1010"
                    })))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_client(base: &str) -> GmailClient {
        GmailClient::new(Arc::new(StaticToken)).with_base_url(base)
    }

    #[tokio::test]
    async fn initial_walk_pages_then_settles_on_history_cursor() {
        let base = spawn_fake_gmail().await;
        let client = test_client(&base);
        let inbox = FolderIdentifier::opaque("INBOX");

        let first = client.fetch_messages(&inbox, None).await.unwrap();
        assert_eq!(first.messages[0].remote_id, "m1");
        assert_eq!(first.next_cursor.as_deref(), Some("page:1000:tok1"));

        let second = client
            .fetch_messages(&inbox, first.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.messages[0].remote_id, "m2");
        assert_eq!(second.next_cursor.as_deref(), Some("history:1000"));
    }

    #[tokio::test]
    async fn incremental_pull_rides_the_history_api() {
        let base = spawn_fake_gmail().await;
        let client = test_client(&base);
        let inbox = FolderIdentifier::opaque("INBOX");

        let page = client
            .fetch_messages(&inbox, Some("history:1000"))
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].remote_id, "m3");
        assert_eq!(page.next_cursor.as_deref(), Some("history:1010"));
    }

    #[tokio::test]
    async fn aged_out_history_cursor_restarts_the_walk() {
        let base = spawn_fake_gmail().await;
        let client = test_client(&base);
        let inbox = FolderIdentifier::opaque("INBOX");

        let page = client
            .fetch_messages(&inbox, Some("history:9"))
            .await
            .unwrap();
        assert_eq!(page.messages[0].remote_id, "m1");
        assert_eq!(page.next_cursor.as_deref(), Some("page:1000:tok1"));
    }

    #[tokio::test]
    async fn expired_page_token_restarts_the_walk() {
        let base = spawn_fake_gmail().await;
        let client = test_client(&base);
        let inbox = FolderIdentifier::opaque("INBOX");

        let page = client
            .fetch_messages(&inbox, Some("page:1000:stale"))
            .await
            .unwrap();
        assert_eq!(page.messages[0].remote_id, "m1");
        assert_eq!(page.next_cursor.as_deref(), Some("page:1000:tok1"));
    }

    fn payload_with_parts() -> GmailPayload {
        serde_json::from_value(serde_json::json!({
            "mimeType": "multipart/alternative",
            "headers": [
                {"name": "Subject", "value": "Hello"},
                {"name": "From", "value": "alice@example.com"},
                {"name": "Message-ID", "value": "<abc@mail>"}
            ],
            "parts": [
                {"mimeType": "text/plain", "body": {"data": URL_SAFE_NO_PAD.encode("plain text")}},
                {"mimeType": "text/html", "body": {"data": URL_SAFE_NO_PAD.encode("<p>rich</p>")}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn collect_bodies_walks_parts() {
        let payload = payload_with_parts();
        let mut html = None;
        let mut text = None;
        collect_bodies(&payload, &mut html, &mut text);
        assert_eq!(html.as_deref(), Some("<p>rich</p>"));
        assert_eq!(text.as_deref(), Some("plain text"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let payload = payload_with_parts();
        assert_eq!(header_value(&payload, "subject").as_deref(), Some("Hello"));
        assert_eq!(
            header_value(&payload, "message-id").as_deref(),
            Some("<abc@mail>")
        );
        assert!(header_value(&payload, "Reply-To").is_none());
    }

    #[test]
    fn unread_label_maps_to_is_read() {
        let msg: GmailMessage = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "internalDate": "1700000000000",
            "payload": {"mimeType": "text/plain", "body": {"data": URL_SAFE_NO_PAD.encode("hi")}}
        }))
        .unwrap();
        let remote = to_remote_message(msg);
        assert!(!remote.is_read);
        assert!(!remote.is_draft);
        assert_eq!(remote.text_body.as_deref(), Some("hi"));
        assert_eq!(remote.date.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn rfc2822_reply_carries_threading_headers() {
        let mut mail = OutgoingMail::new();
        mail.to = vec!["bob@example.com".into()];
        mail.subject = Some("Re: Hello".into());
        mail.html_body = Some("<p>reply</p>".into());
        let raw = render_rfc2822(&mail, Some("<abc@mail>"), None);
        assert!(raw.contains("In-Reply-To: <abc@mail>"));
        assert!(raw.contains("References: <abc@mail>"));
        assert!(raw.contains("Content-Type: text/html"));
        assert!(raw.ends_with("<p>reply</p>"));
    }

    #[test]
    fn decode_body_accepts_padded_input() {
        let padded = URL_SAFE.encode("ab");
        assert_eq!(decode_body(&padded).as_deref(), Some("ab"));
    }
}

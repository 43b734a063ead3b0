//! Outlook variant — Microsoft Graph-style REST surface.
//!
//! Folders are opaque mailFolder ids; fetch cursors are the full
//! `@odata.nextLink` / `@odata.deltaLink` URLs returned by the per-folder
//! delta listing, so an incremental resync resumes exactly where the last
//! committed page ended.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::client::{
    FetchPage, MailClient, OutgoingMail, RemoteFolder, RemoteMessage, TokenProvider,
};
use crate::error::MailError;
use crate::model::FolderIdentifier;

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const PAGE_SIZE: usize = 50;
const MAX_RATE_LIMIT_RETRIES: usize = 3;

const MESSAGE_SELECT: &str =
    "id,subject,from,body,isRead,isDraft,receivedDateTime,internetMessageId";

/// Outlook (Graph) mail client.
pub struct OutlookClient {
    http: reqwest::Client,
    token: Arc<dyn TokenProvider>,
    base_url: String,
}

impl OutlookClient {
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

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, MailError> {
        let token = self.bearer().await?;
        let mut backoff = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .http
                .get(url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| MailError::transient("outlook", e))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    return Err(MailError::transient(
                        "outlook",
                        "rate limit retries exhausted",
                    ));
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
                .map_err(|e| MailError::transient("outlook", e))?;
            if !status.is_success() {
                return Err(MailError::transient(
                    "outlook",
                    format!("status {status}: {body}"),
                ));
            }
            return serde_json::from_str(&body)
                .map_err(|e| MailError::transient("outlook", format!("decode: {e}")));
        }

        Err(MailError::transient(
            "outlook",
            "request failed without response",
        ))
    }

    async fn post_json(&self, url: &str, payload: &serde_json::Value) -> Result<(), MailError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&token)
            .json(payload)
            .send()
            .await
            .map_err(|e| MailError::transient("outlook", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::transient(
                "outlook",
                format!("status {status}: {body}"),
            ));
        }
        Ok(())
    }

    async fn patch_json(&self, url: &str, payload: &serde_json::Value) -> Result<(), MailError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&token)
            .json(payload)
            .send()
            .await
            .map_err(|e| MailError::transient("outlook", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::transient(
                "outlook",
                format!("status {status}: {body}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MailClient for OutlookClient {
    fn provider(&self) -> &'static str {
        "outlook"
    }

    async fn fetch_folders(&self) -> Result<Vec<RemoteFolder>, MailError> {
        let url = format!("{}/me/mailFolders?$top=100", self.base_url);
        let list: GraphFolderList = self.get_json(&url).await?;
        Ok(list
            .value
            .into_iter()
            .map(|f| RemoteFolder {
                identifier: FolderIdentifier::opaque(&f.id),
                name: f.display_name,
                support_move: true,
            })
            .collect())
    }

    async fn fetch_messages(
        &self,
        folder: &FolderIdentifier,
        cursor: Option<&str>,
    ) -> Result<FetchPage, MailError> {
        // A cursor is a complete continuation URL issued by the provider.
        let url = match cursor {
            Some(link) => link.to_string(),
            None => format!(
                "{}/me/mailFolders/{}/messages/delta?$top={PAGE_SIZE}&$select={MESSAGE_SELECT}",
                self.base_url,
                folder.as_remote_id()
            ),
        };
        let page: GraphMessagePage = self.get_json(&url).await?;

        let messages = page.value.into_iter().map(to_remote_message).collect();
        let next_cursor = page.next_link.or(page.delta_link);
        Ok(FetchPage {
            messages,
            next_cursor,
        })
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let url = format!("{}/me/sendMail", self.base_url);
        let payload = serde_json::json!({
            "message": graph_message(mail),
            "saveToSentItems": true,
        });
        self.post_json(&url, &payload).await
    }

    async fn reply(
        &self,
        remote_id: &str,
        _folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        let url = format!("{}/me/messages/{remote_id}/reply", self.base_url);
        let payload = serde_json::json!({
            "message": graph_message(mail),
            "comment": "",
        });
        self.post_json(&url, &payload).await
    }

    async fn forward(
        &self,
        remote_id: &str,
        _folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        let url = format!("{}/me/messages/{remote_id}/forward", self.base_url);
        let payload = serde_json::json!({
            "message": graph_message(mail),
            "toRecipients": recipients(&mail.to),
            "comment": "",
        });
        self.post_json(&url, &payload).await
    }

    async fn mark_read(
        &self,
        _folder: &FolderIdentifier,
        remote_ids: &[String],
    ) -> Result<(), MailError> {
        for remote_id in remote_ids {
            let url = format!("{}/me/messages/{remote_id}", self.base_url);
            self.patch_json(&url, &serde_json::json!({ "isRead": true }))
                .await?;
        }
        Ok(())
    }

    async fn move_messages(
        &self,
        remote_ids: &[String],
        _from: &FolderIdentifier,
        to: &FolderIdentifier,
    ) -> Result<(), MailError> {
        for remote_id in remote_ids {
            let url = format!("{}/me/messages/{remote_id}/move", self.base_url);
            self.post_json(
                &url,
                &serde_json::json!({ "destinationId": to.as_remote_id() }),
            )
            .await?;
        }
        Ok(())
    }
}

// ── Wire mapping ────────────────────────────────────────────────────

fn recipients(addresses: &[String]) -> serde_json::Value {
    serde_json::json!(
        addresses
            .iter()
            .map(|a| serde_json::json!({ "emailAddress": { "address": a } }))
            .collect::<Vec<_>>()
    )
}

fn graph_message(mail: &OutgoingMail) -> serde_json::Value {
    let (content_type, content) = match &mail.html_body {
        Some(html) => ("HTML", html.clone()),
        None => ("Text", mail.text_body.clone().unwrap_or_default()),
    };
    serde_json::json!({
        "subject": mail.subject.as_deref().unwrap_or(""),
        "body": { "contentType": content_type, "content": content },
        "toRecipients": recipients(&mail.to),
        "ccRecipients": recipients(&mail.cc),
        "bccRecipients": recipients(&mail.bcc),
    })
}

fn to_remote_message(msg: GraphMessage) -> RemoteMessage {
    let (html_body, text_body) = match msg.body {
        Some(body) if body.content_type.eq_ignore_ascii_case("html") => {
            (Some(body.content), None)
        }
        Some(body) => (None, Some(body.content)),
        None => (None, None),
    };
    RemoteMessage {
        remote_id: msg.id,
        message_id: msg.internet_message_id,
        subject: msg.subject,
        from: msg
            .from
            .and_then(|f| f.email_address)
            .map(|e| e.address),
        html_body,
        text_body,
        is_read: msg.is_read.unwrap_or(false),
        is_draft: msg.is_draft.unwrap_or(false),
        date: msg
            .received_date_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    }
}

// ── Graph API response types ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GraphFolderList {
    value: Vec<GraphFolder>,
}

#[derive(Debug, Deserialize)]
struct GraphFolder {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct GraphMessagePage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: String,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    body: Option<GraphBody>,
    #[serde(rename = "isRead")]
    is_read: Option<bool>,
    #[serde(rename = "isDraft")]
    is_draft: Option<bool>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
    #[serde(rename = "internetMessageId")]
    internet_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: String,
}

#[derive(Debug, Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: String,
    content: String,
}

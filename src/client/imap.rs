//! IMAP variant — blocking IMAP-over-rustls session for the mailbox side,
//! lettre SMTP for the outbound side. All blocking work runs inside
//! `spawn_blocking`.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};

use crate::client::{
    FetchPage, MailClient, OutgoingMail, RemoteFolder, RemoteMessage, render_rfc2822,
};
use crate::error::MailError;
use crate::model::FolderIdentifier;

/// Max messages fetched per incremental page.
const PAGE_SIZE: usize = 50;

/// IMAP/SMTP connection settings for one account.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Lower bound for the first pull; ignored once a cursor exists.
    pub initial_sync_from: Option<DateTime<Utc>>,
}

impl ImapConfig {
    /// Build from `MAILCRM_IMAP_*` environment variables. Returns `None`
    /// when no IMAP host is configured.
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("MAILCRM_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("MAILCRM_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host = std::env::var("MAILCRM_SMTP_HOST")
            .unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("MAILCRM_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("MAILCRM_IMAP_USERNAME").unwrap_or_default();
        let password = std::env::var("MAILCRM_IMAP_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("MAILCRM_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
            initial_sync_from: None,
        })
    }
}

/// IMAP mail client.
pub struct ImapClient {
    config: ImapConfig,
}

impl ImapClient {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    /// Send an email via SMTP.
    fn send_smtp(&self, mail: &OutgoingMail, in_reply_to: Option<&str>) -> Result<(), MailError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| MailError::SendFailed(format!("SMTP relay error: {e}")))?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        let from: Mailbox = self
            .config
            .from_address
            .parse()
            .map_err(|e| MailError::SendFailed(format!("Invalid from address: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(mail.subject.clone().unwrap_or_default());

        for to in &mail.to {
            let mbox: Mailbox = to
                .parse()
                .map_err(|e| MailError::SendFailed(format!("Invalid to address: {e}")))?;
            builder = builder.to(mbox);
        }
        for cc in &mail.cc {
            if let Ok(mbox) = cc.parse::<Mailbox>() {
                builder = builder.cc(mbox);
            }
        }
        for bcc in &mail.bcc {
            if let Ok(mbox) = bcc.parse::<Mailbox>() {
                builder = builder.bcc(mbox);
            }
        }
        if let Some(msg_id) = in_reply_to {
            builder = builder.in_reply_to(msg_id.to_string());
        }

        let email = match (&mail.html_body, &mail.text_body) {
            (Some(html), Some(text)) => builder
                .multipart(MultiPart::alternative_plain_html(
                    text.clone(),
                    html.clone(),
                ))
                .map_err(|e| MailError::SendFailed(format!("Failed to build email: {e}")))?,
            (Some(html), None) => builder
                .header(lettre::message::header::ContentType::TEXT_HTML)
                .body(html.clone())
                .map_err(|e| MailError::SendFailed(format!("Failed to build email: {e}")))?,
            _ => builder
                .body(mail.text_body.clone().unwrap_or_default())
                .map_err(|e| MailError::SendFailed(format!("Failed to build email: {e}")))?,
        };

        transport
            .send(&email)
            .map_err(|e| MailError::SendFailed(format!("SMTP send failed: {e}")))?;

        tracing::info!(to = ?mail.to, "Email sent via SMTP");
        Ok(())
    }

    /// Look up the RFC 5322 Message-Id of a remote message so a reply can
    /// carry threading headers.
    async fn message_id_of(
        &self,
        remote_id: &str,
        folder: &FolderIdentifier,
    ) -> Result<Option<String>, MailError> {
        let config = self.config.clone();
        let mailbox = folder.as_remote_id().to_string();
        let uid = remote_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.select(&mailbox)?;
            let header = session.fetch_header_field(&uid, "MESSAGE-ID")?;
            session.logout();
            Ok(header)
        })
        .await
        .map_err(|e| MailError::transient("imap", format!("task panicked: {e}")))?
    }
}

#[async_trait]
impl MailClient for ImapClient {
    fn provider(&self) -> &'static str {
        "imap"
    }

    async fn fetch_folders(&self) -> Result<Vec<RemoteFolder>, MailError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            let folders = session.list_folders()?;
            session.logout();
            Ok(folders)
        })
        .await
        .map_err(|e| MailError::transient("imap", format!("task panicked: {e}")))?
    }

    async fn fetch_messages(
        &self,
        folder: &FolderIdentifier,
        cursor: Option<&str>,
    ) -> Result<FetchPage, MailError> {
        let config = self.config.clone();
        let mailbox = folder.as_remote_id().to_string();
        let cursor = cursor.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.select(&mailbox)?;
            let page = session.fetch_page(cursor.as_deref(), config.initial_sync_from)?;
            session.logout();
            Ok(page)
        })
        .await
        .map_err(|e| MailError::transient("imap", format!("task panicked: {e}")))?
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let client = self.config.clone();
        let mail = mail.clone();
        tokio::task::spawn_blocking(move || ImapClient { config: client }.send_smtp(&mail, None))
            .await
            .map_err(|e| MailError::transient("imap", format!("task panicked: {e}")))?
    }

    async fn reply(
        &self,
        remote_id: &str,
        folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        let in_reply_to = self.message_id_of(remote_id, folder).await?;
        let config = self.config.clone();
        let mail = mail.clone();
        tokio::task::spawn_blocking(move || {
            ImapClient { config }.send_smtp(&mail, in_reply_to.as_deref())
        })
        .await
        .map_err(|e| MailError::transient("imap", format!("task panicked: {e}")))?
    }

    async fn forward(
        &self,
        _remote_id: &str,
        _folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        // A forward is a fresh outgoing message; the composer has already
        // folded the original body in.
        self.send(mail).await
    }

    /// SMTP delivery does not touch the mailbox; file the copy explicitly.
    async fn append_sent(
        &self,
        folder: &FolderIdentifier,
        mail: &OutgoingMail,
    ) -> Result<(), MailError> {
        let config = self.config.clone();
        let mailbox = folder.as_remote_id().to_string();
        let rfc2822 = render_rfc2822(mail, None, None);
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.append(&mailbox, &rfc2822)?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| MailError::transient("imap", format!("task panicked: {e}")))?
    }

    async fn mark_read(
        &self,
        folder: &FolderIdentifier,
        remote_ids: &[String],
    ) -> Result<(), MailError> {
        if remote_ids.is_empty() {
            return Ok(());
        }
        let config = self.config.clone();
        let mailbox = folder.as_remote_id().to_string();
        let uid_set = remote_ids.join(",");
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.select(&mailbox)?;
            session.store_seen(&uid_set)?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| MailError::transient("imap", format!("task panicked: {e}")))?
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
        let config = self.config.clone();
        let source = from.as_remote_id().to_string();
        let target = to.as_remote_id().to_string();
        let uid_set = remote_ids.join(",");
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.select(&source)?;
            session.uid_move(&uid_set, &target)?;
            session.logout();
            Ok(())
        })
        .await
        .map_err(|e| MailError::transient("imap", format!("task panicked: {e}")))?
    }
}

// ── Blocking IMAP session ───────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Minimal tagged-command IMAP session over rustls.
struct ImapSession {
    tls: TlsStream,
    tag_counter: u32,
}

impl ImapSession {
    /// Connect, perform the TLS handshake, and LOGIN.
    fn connect(config: &ImapConfig) -> Result<Self, MailError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
            .map_err(|e| MailError::transient("imap", e))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(|e| MailError::transient("imap", e))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = std::sync::Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.imap_host.clone())
                .map_err(|e| MailError::transient("imap", e))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailError::transient("imap", e))?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self { tls, tag_counter: 1 };
        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN {} {}",
            quote_imap(&config.username)?,
            quote_imap(config.password.expose_secret())?
        ))?;
        if !response_ok(&login) {
            return Err(MailError::transient("imap", "login failed"));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => return Err(MailError::transient("imap", "connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(MailError::transient("imap", e)),
            }
        }
    }

    /// Send one tagged command and collect all response lines up to the
    /// tagged completion line.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailError> {
        let tag = format!("A{}", self.tag_counter);
        self.tag_counter += 1;
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())
            .map_err(|e| MailError::transient("imap", e))?;
        IoWrite::flush(&mut self.tls).map_err(|e| MailError::transient("imap", e))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn select(&mut self, mailbox: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("SELECT \"{mailbox}\""))?;
        if response_ok(&resp) {
            Ok(())
        } else {
            Err(MailError::FolderNotFound(mailbox.to_string()))
        }
    }

    fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, MailError> {
        let resp = self.command("LIST \"\" \"*\"")?;
        let mut folders = Vec::new();
        for line in &resp {
            if let Some(folder) = parse_list_line(line) {
                folders.push(folder);
            }
        }
        Ok(folders)
    }

    /// Fetch up to [`PAGE_SIZE`] messages above the UID watermark `cursor`.
    fn fetch_page(
        &mut self,
        cursor: Option<&str>,
        initial_sync_from: Option<DateTime<Utc>>,
    ) -> Result<FetchPage, MailError> {
        let search = match cursor {
            Some(uid) => format!("UID SEARCH UID {}:*", next_uid(uid)),
            None => match initial_sync_from {
                Some(from) => format!("UID SEARCH SINCE {}", from.format("%d-%b-%Y")),
                None => "UID SEARCH ALL".to_string(),
            },
        };
        let resp = self.command(&search)?;

        let mut uids: Vec<u64> = Vec::new();
        for line in &resp {
            if line.starts_with("* SEARCH") {
                uids.extend(
                    line.split_whitespace()
                        .skip(2)
                        .filter_map(|s| s.parse::<u64>().ok()),
                );
            }
        }
        uids.sort_unstable();
        // `UID n:*` always matches the highest existing UID; drop it when
        // it is not actually new.
        if let Some(watermark) = cursor.and_then(|c| c.parse::<u64>().ok()) {
            uids.retain(|&u| u > watermark);
        }
        uids.truncate(PAGE_SIZE);

        let mut messages = Vec::new();
        for uid in &uids {
            if let Some(msg) = self.fetch_message(&uid.to_string())? {
                messages.push(msg);
            }
        }

        let next_cursor = uids.last().map(|u| u.to_string());
        Ok(FetchPage {
            messages,
            next_cursor,
        })
    }

    fn fetch_message(&mut self, uid: &str) -> Result<Option<RemoteMessage>, MailError> {
        let resp = self.command(&format!("UID FETCH {uid} (FLAGS BODY.PEEK[])"))?;

        let seen = resp
            .first()
            .is_some_and(|l| l.contains("FLAGS") && l.contains("\\Seen"));
        let draft = resp
            .first()
            .is_some_and(|l| l.contains("FLAGS") && l.contains("\\Draft"));

        let raw: String = resp
            .iter()
            .skip(1)
            .take(resp.len().saturating_sub(2))
            .cloned()
            .collect();

        let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) else {
            return Ok(None);
        };

        Ok(Some(RemoteMessage {
            remote_id: uid.to_string(),
            message_id: parsed.message_id().map(|s| s.to_string()),
            subject: parsed.subject().map(|s| s.to_string()),
            from: parsed
                .from()
                .and_then(|a| a.first())
                .and_then(|a| a.address())
                .map(|s| s.to_string()),
            html_body: parsed.body_html(0).map(|s| s.to_string()),
            text_body: parsed.body_text(0).map(|s| s.to_string()),
            is_read: seen,
            is_draft: draft,
            date: parsed
                .date()
                .and_then(|d| DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }))
    }

    /// Fetch a single header field of one message.
    fn fetch_header_field(&mut self, uid: &str, field: &str) -> Result<Option<String>, MailError> {
        let resp = self.command(&format!(
            "UID FETCH {uid} BODY.PEEK[HEADER.FIELDS ({field})]"
        ))?;
        let prefix = format!("{}:", field.to_ascii_lowercase());
        for line in &resp {
            if line.to_ascii_lowercase().starts_with(&prefix) {
                let value = line[prefix.len()..].trim().trim_matches(['<', '>']);
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
            }
        }
        Ok(None)
    }

    fn store_seen(&mut self, uid_set: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("UID STORE {uid_set} +FLAGS (\\Seen)"))?;
        if response_ok(&resp) {
            Ok(())
        } else {
            Err(MailError::transient("imap", "STORE failed"))
        }
    }

    fn uid_move(&mut self, uid_set: &str, target: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("UID MOVE {uid_set} \"{target}\""))?;
        if response_ok(&resp) {
            Ok(())
        } else {
            Err(MailError::transient("imap", format!("MOVE to {target} failed")))
        }
    }

    /// APPEND a message literal into `mailbox`, flagged \Seen.
    fn append(&mut self, mailbox: &str, rfc2822: &str) -> Result<(), MailError> {
        let tag = format!("A{}", self.tag_counter);
        self.tag_counter += 1;
        let header = format!(
            "{tag} APPEND {} (\\Seen) {{{}}}\r\n",
            quote_imap(mailbox)?,
            rfc2822.len()
        );
        IoWrite::write_all(&mut self.tls, header.as_bytes())
            .map_err(|e| MailError::transient("imap", e))?;
        IoWrite::flush(&mut self.tls).map_err(|e| MailError::transient("imap", e))?;

        let continuation = self.read_line()?;
        if !continuation.starts_with('+') {
            return Err(MailError::transient("imap", "APPEND rejected"));
        }

        IoWrite::write_all(&mut self.tls, rfc2822.as_bytes())
            .map_err(|e| MailError::transient("imap", e))?;
        IoWrite::write_all(&mut self.tls, b"\r\n")
            .map_err(|e| MailError::transient("imap", e))?;
        IoWrite::flush(&mut self.tls).map_err(|e| MailError::transient("imap", e))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        if response_ok(&lines) {
            Ok(())
        } else {
            Err(MailError::transient("imap", "APPEND failed"))
        }
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Render a value as an IMAP quoted string (RFC 3501). CR and LF can
/// never appear in a quoted string and would otherwise inject a second
/// command.
fn quote_imap(value: &str) -> Result<String, MailError> {
    if value.contains(['\r', '\n']) {
        return Err(MailError::transient(
            "imap",
            "credential contains a line break",
        ));
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("\"{escaped}\""))
}

fn response_ok(lines: &[String]) -> bool {
    lines.last().is_some_and(|l| l.contains("OK"))
}

fn next_uid(cursor: &str) -> u64 {
    cursor.parse::<u64>().map(|u| u + 1).unwrap_or(1)
}

/// Parse one `* LIST (\Flags) "/" "name"` response line.
fn parse_list_line(line: &str) -> Option<RemoteFolder> {
    if !line.starts_with("* LIST") {
        return None;
    }
    let close = line.find(')')?;
    let flags = &line[..close];
    if flags.contains("\\Noselect") {
        return None;
    }
    let rest = line[close + 1..].trim_end();
    // The mailbox name is the last token, possibly quoted.
    let name = if rest.ends_with('"') {
        let without = &rest[..rest.len() - 1];
        let open = without.rfind('"')?;
        &without[open + 1..]
    } else {
        rest.rsplit(' ').next()?
    };
    if name.is_empty() {
        return None;
    }
    Some(RemoteFolder {
        identifier: FolderIdentifier::path(name),
        name: name.to_string(),
        support_move: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_line_quoted() {
        let folder = parse_list_line(r#"* LIST (\HasNoChildren) "." "INBOX.Archive""#).unwrap();
        assert_eq!(folder.identifier, FolderIdentifier::path("INBOX.Archive"));
        assert_eq!(folder.name, "INBOX.Archive");
        assert!(folder.support_move);
    }

    #[test]
    fn parse_list_line_unquoted() {
        let folder = parse_list_line(r#"* LIST (\HasNoChildren) "/" INBOX"#).unwrap();
        assert_eq!(folder.name, "INBOX");
    }

    #[test]
    fn parse_list_line_skips_noselect() {
        assert!(parse_list_line(r#"* LIST (\Noselect) "/" "[Gmail]""#).is_none());
    }

    #[test]
    fn parse_list_line_ignores_other_responses() {
        assert!(parse_list_line("* 3 EXISTS").is_none());
        assert!(parse_list_line("A2 OK LIST completed").is_none());
    }

    #[test]
    fn quote_imap_escapes_specials() {
        assert_eq!(quote_imap("plain").unwrap(), r#""plain""#);
        assert_eq!(quote_imap(r#"p"ss\w"#).unwrap(), r#""p\"ss\\w""#);
    }

    #[test]
    fn quote_imap_rejects_line_breaks() {
        assert!(quote_imap("a\r\nA2 DELETE INBOX").is_err());
    }

    #[test]
    fn next_uid_increments_watermark() {
        assert_eq!(next_uid("41"), 42);
        assert_eq!(next_uid("garbage"), 1);
    }
}

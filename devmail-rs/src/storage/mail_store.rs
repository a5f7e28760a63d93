use super::paths::{ensure_within, validate_email_id, validate_filename};
use crate::error::{MailError, Result};
use crate::events::{EventBus, EventKind};
use crate::mime::{sanitize_html, MimeParser, MimePart, ParsedEmail};
use crate::model::{Email, EmailStats, Envelope, MailAddress};
use crate::relay::{OutgoingConfig, OutgoingMail, OutgoingRelay, RelayTask};
use crate::utils::{format_size, new_message_id};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// In-memory list of captured messages backed by one `.eml` file each
///
/// Insertion order is arrival order. Raw bytes and attachments live on disk
/// under `mail_dir`; the list holds the parsed form.
pub struct MailStore {
    mail_dir: PathBuf,
    emails: RwLock<Vec<Email>>,
    events: Arc<EventBus>,
    outgoing: RwLock<Option<Arc<dyn OutgoingRelay>>>,
    use_uuid: bool,
}

impl MailStore {
    pub fn new(mail_dir: impl Into<PathBuf>, events: Arc<EventBus>) -> Self {
        Self {
            mail_dir: mail_dir.into(),
            emails: RwLock::new(Vec::new()),
            events,
            outgoing: RwLock::new(None),
            use_uuid: false,
        }
    }

    /// Use UUID v4 ids instead of short alphanumeric ones
    pub fn with_uuid_ids(mut self, use_uuid: bool) -> Self {
        self.use_uuid = use_uuid;
        self
    }

    pub fn mail_dir(&self) -> &Path {
        &self.mail_dir
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn new_id(&self) -> String {
        new_message_id(self.use_uuid)
    }

    /// Path of the raw message file for an id; the id must already be validated
    pub fn eml_path(&self, id: &str) -> PathBuf {
        self.mail_dir.join(format!("{}.eml", id))
    }

    /// Parse raw bytes and commit the result under `id`
    ///
    /// Parsing and storing are one unit: a parse error leaves the store
    /// untouched. With `save_attachments` the attachment bytes are written to
    /// `<mail_dir>/<id>/`; otherwise only attachments whose file is already
    /// there are kept. An attachment that cannot be written is dropped.
    pub async fn ingest(
        &self,
        id: &str,
        raw: &[u8],
        envelope: Option<Envelope>,
        save_attachments: bool,
        mark_read: bool,
    ) -> Result<Email> {
        validate_email_id(id)?;

        let ParsedEmail { mut email, parts } = MimeParser::parse(raw, envelope)?;

        let mut unavailable = HashSet::new();
        for part in &parts {
            if save_attachments {
                if let Err(e) = self.save_attachment(id, part).await {
                    warn!(
                        "Error saving attachment {} of {}: {}",
                        part.generated_file_name, id, e
                    );
                    unavailable.insert(part.generated_file_name.clone());
                }
            } else if !self.attachment_exists(id, &part.generated_file_name).await {
                debug!(
                    "Attachment {} of {} not found on disk",
                    part.generated_file_name, id
                );
                unavailable.insert(part.generated_file_name.clone());
            }
        }
        email
            .attachments
            .retain(|a| !unavailable.contains(&a.generated_file_name));

        self.save(id, mark_read, None, email).await
    }

    async fn attachment_exists(&self, id: &str, filename: &str) -> bool {
        if validate_filename(filename).is_err() {
            return false;
        }
        fs::metadata(self.mail_dir.join(id).join(filename))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn save_attachment(&self, id: &str, part: &MimePart) -> Result<()> {
        validate_filename(&part.generated_file_name)?;

        let attachment_dir = self.mail_dir.join(id);
        fs::create_dir_all(&attachment_dir).await.map_err(|e| {
            MailError::Persistence(format!("failed to create attachment directory: {}", e))
        })?;

        let attachment_path = attachment_dir.join(&part.generated_file_name);
        ensure_within(&self.mail_dir, &attachment_path)?;
        fs::write(&attachment_path, &part.body)
            .await
            .map_err(|e| MailError::Persistence(format!("failed to save attachment: {}", e)))
    }

    /// Commit a parsed message
    ///
    /// Fills in id, time, read flag, envelope, source and size, computes the
    /// calculated BCC, sanitizes the HTML, appends, emits `new` and hands the
    /// message to the relay when auto-relay is on.
    pub async fn save(
        &self,
        id: &str,
        is_read: bool,
        envelope: Option<Envelope>,
        mut email: Email,
    ) -> Result<Email> {
        validate_email_id(id)?;
        let eml_path = self.eml_path(id);

        email.id = id.to_string();
        if email.time_unset() {
            email.time = Utc::now();
        }
        email.read = is_read;
        if envelope.is_some() {
            email.envelope = envelope;
        }
        email.source = eml_path.to_string_lossy().into_owned();

        // A missing file is not an error here
        email.size = fs::metadata(&eml_path).await.map(|m| m.len()).unwrap_or(0);
        email.size_human = format_size(email.size);

        let envelope_to = email
            .envelope
            .as_ref()
            .map(|e| e.to.clone())
            .unwrap_or_default();
        email.calculated_bcc = calculate_bcc(&envelope_to, &email.to, &email.cc);

        if !email.html.is_empty() {
            email.html = sanitize_html(&email.html).trim().to_string();
        }

        self.emails.write().await.push(email.clone());

        info!("Saving email: {}, id: {}", email.subject, id);

        let shared = Arc::new(email.clone());
        self.events.emit(EventKind::New, shared.clone()).await;

        if let Some(outgoing) = self.outgoing().await {
            if outgoing.is_auto_relay_enabled() {
                outgoing.relay_mail(
                    RelayTask::new(shared, eml_path)
                        .auto_relay(true)
                        .on_complete(|result| {
                            if let Err(e) = result {
                                error!("Error when auto-relaying email: {}", e);
                            }
                        }),
                );
            }
        }

        Ok(email)
    }

    pub async fn get(&self, id: &str) -> Result<Email> {
        validate_email_id(id)?;

        let emails = self.emails.read().await;
        let mut email = emails
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| MailError::NotFound(format!("email {} was not found", id)))?;

        if !email.html.is_empty() {
            email.html = sanitize_html(&email.html);
        }
        Ok(email)
    }

    /// Snapshot of every message in arrival order
    pub async fn get_all(&self) -> Vec<Email> {
        self.emails.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.emails.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.emails.read().await.is_empty()
    }

    /// Remove a message, its `.eml` file and its attachment directory
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_email_id(id)?;

        let eml_path = self.eml_path(id);
        let attachment_dir = self.mail_dir.join(id);
        ensure_within(&self.mail_dir, &eml_path)?;
        ensure_within(&self.mail_dir, &attachment_dir)?;

        let email = {
            let mut emails = self.emails.write().await;
            let index = emails
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| MailError::NotFound(format!("email {} not found", id)))?;
            emails.remove(index)
        };

        if let Err(e) = fs::remove_file(&eml_path).await {
            debug!("Error deleting email file: {}", e);
        }
        if let Err(e) = fs::remove_dir_all(&attachment_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Error deleting attachment directory: {}", e);
            }
        }

        info!("Deleting email - {}, id: {}", email.subject, email.id);

        self.events.emit(EventKind::Delete, Arc::new(email)).await;
        Ok(())
    }

    /// Wipe the mail directory and forget every message
    pub async fn delete_all(&self) -> Result<()> {
        info!("Deleting all email");

        let mut emails = self.emails.write().await;

        match fs::read_dir(&self.mail_dir).await {
            Ok(mut entries) => loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        let removed = match entry.file_type().await {
                            Ok(t) if t.is_dir() => fs::remove_dir_all(&path).await,
                            _ => fs::remove_file(&path).await,
                        };
                        if let Err(e) = removed {
                            debug!("Failed to remove {}: {}", path.display(), e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Failed to read mail directory entry: {}", e);
                        break;
                    }
                }
            },
            Err(e) => debug!("Mail directory not readable: {}", e),
        }

        emails.clear();
        Ok(())
    }

    pub async fn read_one(&self, id: &str) -> Result<()> {
        validate_email_id(id)?;

        let mut emails = self.emails.write().await;
        let email = emails
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| MailError::NotFound(format!("email {} not found", id)))?;
        email.read = true;
        Ok(())
    }

    /// Mark everything read; returns how many were unread
    pub async fn read_all(&self) -> usize {
        let mut emails = self.emails.write().await;
        let mut count = 0;
        for email in emails.iter_mut().filter(|e| !e.read) {
            email.read = true;
            count += 1;
        }
        count
    }

    pub async fn stats(&self) -> EmailStats {
        let emails = self.emails.read().await;

        let mut stats = EmailStats {
            total: emails.len(),
            ..Default::default()
        };
        for email in emails.iter() {
            if !email.read {
                stats.unread += 1;
            }
            *stats
                .by_date
                .entry(email.time.format("%Y-%m-%d").to_string())
                .or_insert(0) += 1;
        }
        stats.read = stats.total - stats.unread;
        stats
    }

    /// Path of the raw `.eml` file
    pub async fn get_raw(&self, id: &str) -> Result<PathBuf> {
        validate_email_id(id)?;
        let eml_path = self.eml_path(id);
        ensure_within(&self.mail_dir, &eml_path)?;

        match fs::metadata(&eml_path).await {
            Ok(_) => Ok(eml_path),
            Err(_) => Err(MailError::NotFound(format!("email file {} not found", id))),
        }
    }

    pub async fn get_raw_content(&self, id: &str) -> Result<Vec<u8>> {
        validate_email_id(id)?;
        let eml_path = self.eml_path(id);
        ensure_within(&self.mail_dir, &eml_path)?;

        fs::read(&eml_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MailError::NotFound(format!("email file {} not found", id))
            }
            _ => MailError::Persistence(format!("failed to read email file: {}", e)),
        })
    }

    pub async fn get_html(&self, id: &str) -> Result<String> {
        Ok(self.get(id).await?.html)
    }

    /// Path and content type of an attachment, by generated filename
    pub async fn get_attachment(&self, id: &str, filename: &str) -> Result<(PathBuf, String)> {
        validate_email_id(id)?;
        validate_filename(filename)?;

        let email = self.get(id).await?;
        if email.attachments.is_empty() {
            return Err(MailError::NotFound("email has no attachments".to_string()));
        }

        let attachment = email
            .attachment(filename)
            .ok_or_else(|| MailError::NotFound("attachment not found".to_string()))?;

        let path = self.mail_dir.join(id).join(&attachment.generated_file_name);
        ensure_within(&self.mail_dir, &path)?;
        Ok((path, attachment.content_type.clone()))
    }

    /// Restore messages from `*.eml` files not already in memory
    ///
    /// Restored messages are marked read and their attachments are not
    /// rewritten. Unparseable files are skipped.
    pub async fn load_from_directory(&self) -> Result<usize> {
        let mut entries = fs::read_dir(&self.mail_dir).await.map_err(|e| {
            MailError::Persistence(format!("failed to read mail directory: {}", e))
        })?;

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("eml") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_email_id(id).is_err() {
                warn!("Skipping mail file with unsafe name: {}", path.display());
                continue;
            }

            let already_loaded = self.emails.read().await.iter().any(|e| e.id == id);
            if already_loaded {
                continue;
            }

            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("Error opening email file {}: {}", path.display(), e);
                    continue;
                }
            };

            match self.ingest(id, &raw, None, false, true).await {
                Ok(email) => {
                    debug!("Restored email: {} (id: {})", email.subject, id);
                    loaded += 1;
                }
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }

        Ok(loaded)
    }

    pub async fn set_outgoing(&self, outgoing: Arc<dyn OutgoingRelay>) {
        *self.outgoing.write().await = Some(outgoing);
    }

    pub async fn outgoing(&self) -> Option<Arc<dyn OutgoingRelay>> {
        self.outgoing.read().await.clone()
    }

    /// Create the relay engine on first use, otherwise replace its config
    pub async fn set_outgoing_config(&self, config: OutgoingConfig) {
        let mut outgoing = self.outgoing.write().await;
        match outgoing.as_ref() {
            Some(relay) => relay.update_config(config),
            None => *outgoing = Some(Arc::new(OutgoingMail::new(config))),
        }
    }

    pub async fn outgoing_config(&self) -> Option<OutgoingConfig> {
        self.outgoing().await.map(|relay| relay.config())
    }

    /// Queue a stored message for relay to its envelope recipients
    pub async fn relay_mail<F>(&self, email: &Email, is_auto_relay: bool, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.submit_relay(email, None, is_auto_relay, callback).await
    }

    /// Queue a stored message for relay to one explicit address
    pub async fn relay_mail_to<F>(&self, email: &Email, relay_to: &str, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.submit_relay(email, Some(relay_to), false, callback)
            .await
    }

    async fn submit_relay<F>(
        &self,
        email: &Email,
        relay_to: Option<&str>,
        is_auto_relay: bool,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        validate_email_id(&email.id)?;
        let outgoing = self.outgoing().await.ok_or(MailError::RelayNotConfigured)?;

        let mut task = RelayTask::new(Arc::new(email.clone()), self.eml_path(&email.id))
            .auto_relay(is_auto_relay)
            .on_complete(callback);
        if let Some(relay_to) = relay_to {
            task = task.relay_to(relay_to);
        }

        outgoing.relay_mail(task);
        Ok(())
    }
}

/// Envelope recipients that appear in neither Cc nor To
///
/// Each Cc/To entry absorbs at most one matching recipient, so an address
/// sent to twice but listed once is reported as blind-copied once.
pub fn calculate_bcc(
    recipients: &[String],
    to: &[MailAddress],
    cc: &[MailAddress],
) -> Vec<MailAddress> {
    let mut to_copy: Vec<&str> = to.iter().map(|a| a.address.as_str()).collect();
    let mut cc_copy: Vec<&str> = cc.iter().map(|a| a.address.as_str()).collect();

    let mut bcc = Vec::new();
    for recipient in recipients {
        if let Some(i) = cc_copy
            .iter()
            .position(|a| a.eq_ignore_ascii_case(recipient))
        {
            cc_copy.remove(i);
            continue;
        }
        if let Some(i) = to_copy
            .iter()
            .position(|a| a.eq_ignore_ascii_case(recipient))
        {
            to_copy.remove(i);
            continue;
        }
        bcc.push(MailAddress::new(recipient.clone()));
    }
    bcc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const SIMPLE: &[u8] =
        b"From: sender@example.com\r\nTo: a@example.com\r\nSubject: Hello\r\n\r\nPlain body\r\n";

    fn addresses(values: &[&str]) -> Vec<MailAddress> {
        values.iter().map(|v| MailAddress::new(*v)).collect()
    }

    async fn store_with(dir: &TempDir) -> MailStore {
        MailStore::new(dir.path(), Arc::new(EventBus::new()))
    }

    async fn write_and_ingest(store: &MailStore, id: &str, raw: &[u8]) -> Email {
        fs::write(store.eml_path(id), raw).await.unwrap();
        store.ingest(id, raw, None, true, false).await.unwrap()
    }

    #[test]
    fn test_calculate_bcc() {
        let recipients: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let bcc = calculate_bcc(&recipients, &addresses(&["a", "b"]), &addresses(&["c"]));
        assert_eq!(bcc, addresses(&["d"]));
    }

    #[test]
    fn test_calculate_bcc_duplicates() {
        let recipients: Vec<String> = ["a", "a"].iter().map(|s| s.to_string()).collect();
        let bcc = calculate_bcc(&recipients, &addresses(&["a"]), &[]);
        assert_eq!(bcc, addresses(&["a"]));
    }

    #[tokio::test]
    async fn test_round_trip_plain_body() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;

        write_and_ingest(&store, "abc123", SIMPLE).await;
        let email = store.get("abc123").await.unwrap();

        assert_eq!(email.text, "Plain body");
        assert_eq!(email.subject, "Hello");
        assert_eq!(email.size, SIMPLE.len() as u64);
        assert!(!email.read);
        assert!(email.source.ends_with("abc123.eml"));
    }

    #[tokio::test]
    async fn test_save_without_file_has_zero_size() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;

        let email = store
            .save("nofile", false, None, Email::default())
            .await
            .unwrap();
        assert_eq!(email.size, 0);
        assert!(!email.time_unset());
    }

    #[tokio::test]
    async fn test_unsafe_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;

        for id in ["../x", "a/b", "a\\b", "a\0b", ".."] {
            assert!(store.get(id).await.unwrap_err().is_validation());
            assert!(store.delete(id).await.unwrap_err().is_validation());
            assert!(store.read_one(id).await.unwrap_err().is_validation());
            assert!(store.get_raw(id).await.unwrap_err().is_validation());
            assert!(store.get_raw_content(id).await.unwrap_err().is_validation());
            assert!(store
                .get_attachment(id, "x.png")
                .await
                .unwrap_err()
                .is_validation());
        }
    }

    #[tokio::test]
    async fn test_delete_removes_files() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        let raw = b"From: a@example.com\r\nContent-Type: multipart/mixed; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nhi\r\n--b\r\nContent-Type: text/plain\r\nContent-Disposition: attachment; filename=\"notes.txt\"\r\n\r\nnotes\r\n--b--\r\n";

        let email = write_and_ingest(&store, "del01", raw).await;
        let attachment_dir = dir.path().join("del01");
        assert!(attachment_dir
            .join(&email.attachments[0].generated_file_name)
            .exists());

        store.delete("del01").await.unwrap();

        assert!(!dir.path().join("del01.eml").exists());
        assert!(!attachment_dir.exists());
        assert!(store.get("del01").await.unwrap_err().is_not_found());
        assert!(store.delete("del01").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_read_all_counts_unread() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;

        for id in ["m1", "m2", "m3"] {
            write_and_ingest(&store, id, SIMPLE).await;
        }
        store.read_one("m2").await.unwrap();

        assert_eq!(store.read_all().await, 2);
        assert!(store.get_all().await.iter().all(|e| e.read));
        assert_eq!(store.read_all().await, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;

        write_and_ingest(
            &store,
            "s1",
            b"From: a@x.com\r\nDate: Mon, 02 Jan 2006 15:04:05 +0000\r\n\r\nx",
        )
        .await;
        write_and_ingest(
            &store,
            "s2",
            b"From: a@x.com\r\nDate: Mon, 02 Jan 2006 18:00:00 +0000\r\n\r\ny",
        )
        .await;
        write_and_ingest(
            &store,
            "s3",
            b"From: a@x.com\r\nDate: Tue, 03 Jan 2006 09:00:00 +0000\r\n\r\nz",
        )
        .await;
        store.read_one("s1").await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unread, 2);
        assert_eq!(stats.read, 1);
        assert_eq!(stats.by_date.get("2006-01-02"), Some(&2));
        assert_eq!(stats.by_date.get("2006-01-03"), Some(&1));
    }

    #[tokio::test]
    async fn test_delete_all() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        write_and_ingest(&store, "w1", SIMPLE).await;
        write_and_ingest(&store, "w2", SIMPLE).await;

        store.delete_all().await.unwrap();

        assert!(store.is_empty().await);
        assert!(!dir.path().join("w1.eml").exists());
    }

    #[tokio::test]
    async fn test_delete_all_tolerates_missing_dir() {
        let store = MailStore::new("/nonexistent/devmail-test", Arc::new(EventBus::new()));
        assert!(store.delete_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_raw_accessors() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        write_and_ingest(&store, "raw01", SIMPLE).await;

        assert_eq!(store.get_raw("raw01").await.unwrap(), dir.path().join("raw01.eml"));
        assert_eq!(store.get_raw_content("raw01").await.unwrap(), SIMPLE);
        assert!(store.get_raw("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_attachment() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        let raw = b"From: a@example.com\r\nContent-Type: multipart/related; boundary=\"r\"\r\n\r\n--r\r\nContent-Type: text/html\r\n\r\n<img src=\"cid:logo1\"><script>x()</script>\r\n--r\r\nContent-Type: image/png\r\nContent-ID: <logo1>\r\nContent-Transfer-Encoding: base64\r\n\r\niVBORw0KGgo=\r\n--r--\r\n";
        let email = write_and_ingest(&store, "att01", raw).await;

        assert!(email.html.contains("cid:logo1"));
        assert!(!email.html.contains("script"));

        let name = email.attachments[0].generated_file_name.clone();
        let (path, content_type) = store.get_attachment("att01", &name).await.unwrap();
        assert_eq!(content_type, "image/png");
        assert!(path.exists());

        assert!(store
            .get_attachment("att01", "other.png")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .get_attachment("att01", "../att01.eml")
            .await
            .unwrap_err()
            .is_validation());
    }

    const WITH_PDF: &[u8] = b"From: a@example.com\r\nSubject: Report\r\nContent-Type: multipart/mixed; boundary=\"m\"\r\n\r\n--m\r\nContent-Type: text/plain\r\n\r\nSee attached\r\n--m\r\nContent-Type: application/pdf\r\nContent-Disposition: attachment; filename=\"report.pdf\"\r\nContent-Transfer-Encoding: base64\r\n\r\nSGVsbG8gV29ybGQ=\r\n--m--\r\n";

    #[tokio::test]
    async fn test_attachment_survives_reload() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        let email = write_and_ingest(&store, "pdf01", WITH_PDF).await;
        let name = email.attachments[0].generated_file_name.clone();
        assert!(email.attachments[0].content_id.is_empty());

        let restored = store_with(&dir).await;
        assert_eq!(restored.load_from_directory().await.unwrap(), 1);

        let email = restored.get("pdf01").await.unwrap();
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].generated_file_name, name);

        let (path, content_type) = restored.get_attachment("pdf01", &name).await.unwrap();
        assert_eq!(content_type, "application/pdf");
        assert_eq!(std::fs::read(path).unwrap(), b"Hello World");
    }

    #[tokio::test]
    async fn test_reload_drops_attachment_missing_on_disk() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pdf02.eml"), WITH_PDF).unwrap();

        let store = store_with(&dir).await;
        assert_eq!(store.load_from_directory().await.unwrap(), 1);
        assert!(store.get("pdf02").await.unwrap().attachments.is_empty());
    }

    #[tokio::test]
    async fn test_failed_attachment_write_drops_record() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        // A plain file where the attachment directory should go
        std::fs::write(dir.path().join("pdf03"), b"in the way").unwrap();

        let email = write_and_ingest(&store, "pdf03", WITH_PDF).await;
        assert_eq!(email.text, "See attached");
        assert!(email.attachments.is_empty());
        assert!(store.get("pdf03").await.unwrap().attachments.is_empty());
    }

    #[tokio::test]
    async fn test_attachment_on_message_without_any() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        write_and_ingest(&store, "plain1", SIMPLE).await;
        assert!(store
            .get_attachment("plain1", "x.bin")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_parse_error_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;

        let err = store.ingest("bad01", b"", None, true, false).await.unwrap_err();
        assert!(matches!(err, MailError::Parse(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_reload_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep01.eml"), SIMPLE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::create_dir(dir.path().join("keep01")).unwrap();

        let store = store_with(&dir).await;
        assert_eq!(store.load_from_directory().await.unwrap(), 1);
        assert_eq!(store.load_from_directory().await.unwrap(), 0);

        let all = store.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "keep01");
        assert!(all[0].read);
    }

    #[tokio::test]
    async fn test_emits_new_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        let mut events = store.events().subscribe();

        write_and_ingest(&store, "ev01", SIMPLE).await;
        store.delete("ev01").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((first.kind, first.email.id.as_str()), (EventKind::New, "ev01"));
        assert_eq!(second.kind, EventKind::Delete);
    }

    #[tokio::test]
    async fn test_calculated_bcc_from_envelope() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        let envelope = Envelope {
            from: "s@example.com".to_string(),
            to: vec!["a@example.com".to_string(), "hidden@example.com".to_string()],
            host: "client".to_string(),
            remote_address: "127.0.0.1:1".to_string(),
        };

        let email = store
            .ingest("bcc01", SIMPLE, Some(envelope), false, false)
            .await
            .unwrap();
        assert_eq!(email.calculated_bcc, addresses(&["hidden@example.com"]));
    }

    #[tokio::test]
    async fn test_relay_without_engine() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;
        let email = write_and_ingest(&store, "r01", SIMPLE).await;

        let err = store.relay_mail(&email, false, |_| {}).await.unwrap_err();
        assert!(matches!(err, MailError::RelayNotConfigured));
        assert!(store.outgoing_config().await.is_none());
    }

    #[tokio::test]
    async fn test_set_outgoing_config_creates_then_updates() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir).await;

        store
            .set_outgoing_config(OutgoingConfig {
                host: "relay.local".to_string(),
                ..Default::default()
            })
            .await;
        store
            .set_outgoing_config(OutgoingConfig {
                host: "relay2.local".to_string(),
                ..Default::default()
            })
            .await;

        assert_eq!(store.outgoing_config().await.unwrap().host, "relay2.local");
        if let Some(outgoing) = store.outgoing().await {
            outgoing.close().await;
        }
    }
}

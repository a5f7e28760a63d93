use crate::error::{MailError, Result};
use crate::model::{Email, Envelope};
use crate::storage::MailStore;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Fresh ids tried before giving up on a colliding `.eml` name
const MAX_ID_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    HasSender,
    HasRecipients,
    Closed,
}

/// One SMTP transaction context: sender, recipients and the DATA commit
///
/// Transport concerns (greeting, TLS, AUTH exchange, dot-stuffing) live in
/// the connection; this type only sees envelope values and message bytes.
pub struct Session {
    store: Arc<MailStore>,
    state: SessionState,
    from: String,
    to: Vec<String>,
    helo: String,
    remote_address: String,
    auth_enabled: bool,
    authenticated_user: Option<String>,
}

impl Session {
    pub fn new(store: Arc<MailStore>, remote_address: impl Into<String>, auth_enabled: bool) -> Self {
        Self {
            store,
            state: SessionState::New,
            from: String::new(),
            to: Vec::new(),
            helo: String::new(),
            remote_address: remote_address.into(),
            auth_enabled,
            authenticated_user: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn recipients(&self) -> &[String] {
        &self.to
    }

    /// Client name from HELO/EHLO, recorded as the envelope host
    pub fn set_helo(&mut self, name: impl Into<String>) {
        self.helo = name.into();
    }

    pub fn set_authenticated(&mut self, username: impl Into<String>) {
        self.authenticated_user = Some(username.into());
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user.is_some()
    }

    /// Record the sender
    ///
    /// An unauthenticated sender is accepted even when credentials are
    /// configured; only a warning is logged.
    pub fn mail(&mut self, from: &str) -> Result<()> {
        self.ensure_open()?;

        if self.auth_enabled && !self.is_authenticated() {
            warn!(
                "Unauthenticated sender {} accepted from {}",
                from, self.remote_address
            );
        }

        self.from = from.to_string();
        self.to.clear();
        self.state = SessionState::HasSender;
        Ok(())
    }

    pub fn rcpt(&mut self, to: &str) -> Result<()> {
        match self.state {
            SessionState::HasSender | SessionState::HasRecipients => {
                self.to.push(to.to_string());
                self.state = SessionState::HasRecipients;
                Ok(())
            }
            SessionState::New => Err(MailError::SmtpProtocol("Need MAIL command".to_string())),
            SessionState::Closed => Err(MailError::SmtpProtocol("Session closed".to_string())),
        }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            from: self.from.clone(),
            to: self.to.clone(),
            host: self.helo.clone(),
            remote_address: self.remote_address.clone(),
        }
    }

    /// Receive the message body, keep it as `<id>.eml` and commit it to the store
    ///
    /// The bytes are written to the file and collected for the parser in the
    /// same pass. Failing to create the file aborts before anything reaches
    /// the store. The transaction is reset afterwards whatever the outcome.
    pub async fn data<R>(&mut self, mut reader: R) -> Result<Email>
    where
        R: AsyncRead + Unpin,
    {
        if self.state != SessionState::HasRecipients {
            return Err(MailError::SmtpProtocol("Need RCPT command".to_string()));
        }

        let result = self.receive(&mut reader).await;
        self.reset();
        result
    }

    async fn receive<R>(&self, reader: &mut R) -> Result<Email>
    where
        R: AsyncRead + Unpin,
    {
        let (id, mut file) = self.create_message_file().await?;

        let mut raw = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            file.write_all(&chunk[..n])
                .await
                .map_err(|e| MailError::Persistence(format!("failed to write email file: {}", e)))?;
            raw.extend_from_slice(&chunk[..n]);
        }
        file.flush().await?;
        drop(file);

        let email = self
            .store
            .ingest(&id, &raw, Some(self.envelope()), true, false)
            .await?;

        info!(
            "Received mail from {} for {} recipient(s), id: {}",
            self.from,
            self.to.len(),
            id
        );
        Ok(email)
    }

    /// Allocate an id whose `.eml` file does not exist yet
    async fn create_message_file(&self) -> Result<(String, File)> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.store.new_id();
            match open_exclusive(&self.store.eml_path(&id)).await {
                Ok(file) => return Ok((id, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Email id {} already taken, generating another", id);
                }
                Err(e) => {
                    return Err(MailError::Persistence(format!(
                        "failed to create email file: {}",
                        e
                    )))
                }
            }
        }
        Err(MailError::Persistence(
            "could not allocate an unused email id".to_string(),
        ))
    }

    /// Clear sender and recipients
    pub fn reset(&mut self) {
        self.from.clear();
        self.to.clear();
        if self.state != SessionState::Closed {
            self.state = SessionState::New;
        }
    }

    pub fn logout(&mut self) {
        self.reset();
        self.state = SessionState::Closed;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(MailError::SmtpProtocol("Session closed".to_string()));
        }
        Ok(())
    }
}

/// Create a file, failing with `AlreadyExists` instead of truncating
async fn open_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

use crate::config::Config;
use crate::error::{MailError, Result};
use crate::security::auth::{
    decode_login_credential, decode_plain_auth, LOGIN_PASSWORD_PROMPT, LOGIN_USERNAME_PROMPT,
};
use crate::security::{AuthMechanism, SmtpAuthConfig, TlsConfig};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::session::{Session, SessionState};
use crate::storage::MailStore;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadBuf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

/// Maximum length of one protocol or message line, CRLF included
const MAX_LINE_LENGTH: usize = 2000;

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

/// Listener-wide SMTP settings shared by every connection
#[derive(Clone)]
pub struct SmtpSettings {
    pub hostname: String,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tls: Option<TlsConfig>,
    pub auth: Option<SmtpAuthConfig>,
}

impl SmtpSettings {
    pub fn from_config(config: &Config, tls: Option<TlsConfig>) -> Self {
        Self {
            hostname: config.server.hostname.clone(),
            max_message_size: config.smtp.max_message_size,
            max_recipients: config.smtp.max_recipients,
            read_timeout: Duration::from_secs(config.smtp.read_timeout_secs),
            write_timeout: Duration::from_secs(config.smtp.write_timeout_secs),
            tls,
            auth: SmtpAuthConfig::from_config(&config.smtp),
        }
    }
}

/// Plain or TLS connection, so STARTTLS can swap the transport mid-session
pub enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient state while the STARTTLS handshake owns the socket
    Upgrading,
}

fn upgrading_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is being upgraded to TLS")
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

enum SessionResult {
    /// Transport was upgraded; restart reading on the new stream
    Continue,
    Quit,
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
    LineTooLong,
}

/// Wire-level SMTP dialogue for one client
pub struct SmtpConnection {
    settings: Arc<SmtpSettings>,
    session: Session,
    greeted: bool,
    is_encrypted: bool,
    error_count: usize,
}

impl SmtpConnection {
    pub fn new(settings: Arc<SmtpSettings>, store: Arc<MailStore>, remote_address: String) -> Self {
        let auth_enabled = settings.auth.is_some();
        Self {
            settings,
            session: Session::new(store, remote_address, auth_enabled),
            greeted: false,
            is_encrypted: false,
            error_count: 0,
        }
    }

    /// Run the dialogue until QUIT, disconnect or a fatal transport error
    pub async fn handle(mut self, stream: SmtpStream) -> Result<()> {
        self.is_encrypted = matches!(stream, SmtpStream::Tls(_));
        let mut stream = stream;

        self.reply(
            &mut stream,
            &format!("220 {} ESMTP Service Ready\r\n", self.settings.hostname),
        )
        .await?;

        loop {
            match self.process_commands(&mut stream).await? {
                SessionResult::Continue => continue,
                SessionResult::Quit => break,
            }
        }

        self.session.logout();
        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<SessionResult> {
        let mut reader = BufReader::new(&mut *stream);
        let mut line = Vec::new();

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors, disconnecting");
                self.reply(&mut reader, "421 Too many errors, closing connection\r\n")
                    .await?;
                return Ok(SessionResult::Quit);
            }

            let read = match timeout(
                self.settings.read_timeout,
                read_line(&mut reader, &mut line, MAX_LINE_LENGTH),
            )
            .await
            {
                Ok(read) => read?,
                Err(_) => {
                    warn!("Command timeout, disconnecting");
                    self.reply(&mut reader, "421 Timeout, closing connection\r\n")
                        .await?;
                    return Ok(SessionResult::Quit);
                }
            };

            match read {
                LineRead::Eof => {
                    debug!("Client disconnected");
                    return Ok(SessionResult::Quit);
                }
                LineRead::TooLong => {
                    error!("Line too long");
                    self.reply(&mut reader, "500 Line too long\r\n").await?;
                    self.error_count += 1;
                    continue;
                }
                LineRead::Line => {}
            }

            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            if text.to_uppercase().starts_with("AUTH ") {
                debug!("Received: AUTH ...");
            } else {
                debug!("Received: {}", text);
            }

            let cmd = match SmtpCommand::parse(&text) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    self.reply(&mut reader, "501 Syntax error in parameters or arguments\r\n")
                        .await?;
                    self.error_count += 1;
                    continue;
                }
            };

            match cmd {
                SmtpCommand::Starttls => {
                    if let Some(response) = self.starttls_refusal() {
                        self.reply(&mut reader, response).await?;
                        continue;
                    }

                    // Pipelined bytes after STARTTLS must not survive the upgrade
                    if !reader.buffer().is_empty() {
                        self.reply(&mut reader, "501 Unexpected data after STARTTLS\r\n")
                            .await?;
                        continue;
                    }

                    drop(reader);
                    self.upgrade(stream).await?;
                    return Ok(SessionResult::Continue);
                }
                SmtpCommand::Auth(mechanism, initial) => {
                    if let Err(e) = self.handle_auth(&mechanism, initial, &mut reader).await {
                        debug!("AUTH error: {}", e);
                        self.reply(&mut reader, "535 Authentication failed\r\n")
                            .await?;
                        self.error_count += 1;
                    }
                }
                SmtpCommand::Data => {
                    if let Some(response) = self.data_refusal() {
                        self.reply(&mut reader, response).await?;
                        continue;
                    }
                    self.reply(&mut reader, "354 Start mail input; end with <CRLF>.<CRLF>\r\n")
                        .await?;

                    let response = match self.receive_data(&mut reader).await? {
                        DataOutcome::Complete(data) => self.commit(data).await,
                        DataOutcome::TooLarge => {
                            self.session.reset();
                            format!(
                                "552 Message exceeds fixed maximum message size ({} bytes)\r\n",
                                self.settings.max_message_size
                            )
                        }
                        DataOutcome::LineTooLong => {
                            self.session.reset();
                            "500 Line too long\r\n".to_string()
                        }
                    };
                    self.reply(&mut reader, &response).await?;
                }
                SmtpCommand::Quit => {
                    info!("QUIT command");
                    self.reply(
                        &mut reader,
                        &format!("221 {} closing connection\r\n", self.settings.hostname),
                    )
                    .await?;
                    return Ok(SessionResult::Quit);
                }
                cmd => {
                    let response = self.handle_command(cmd);
                    if response.starts_with('5') {
                        self.error_count += 1;
                    }
                    self.reply(&mut reader, &response).await?;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match cmd {
            SmtpCommand::Helo(domain) => {
                info!("HELO from {}", domain);
                self.greet(&domain);
                format!("250 {} Hello {}\r\n", self.settings.hostname, domain)
            }
            SmtpCommand::Ehlo(domain) => {
                info!("EHLO from {}", domain);
                self.greet(&domain);
                self.ehlo_response(&domain)
            }
            SmtpCommand::MailFrom(from) => {
                if !self.greeted {
                    return "503 Bad sequence of commands: send HELO/EHLO first\r\n".to_string();
                }
                if self.session.state() != SessionState::New {
                    return "503 Bad sequence of commands: nested MAIL command\r\n".to_string();
                }
                match self.session.mail(&from) {
                    Ok(()) => {
                        debug!("MAIL FROM: {}", from);
                        "250 OK\r\n".to_string()
                    }
                    Err(e) => format!("503 {}\r\n", e),
                }
            }
            SmtpCommand::RcptTo(to) => {
                if self.session.recipients().len() >= self.settings.max_recipients {
                    warn!("Too many recipients: {}", self.session.recipients().len());
                    return format!(
                        "452 Too many recipients (max {})\r\n",
                        self.settings.max_recipients
                    );
                }
                match self.session.rcpt(&to) {
                    Ok(()) => {
                        debug!("RCPT TO: {}", to);
                        "250 OK\r\n".to_string()
                    }
                    Err(_) => "503 Bad sequence of commands: need MAIL command\r\n".to_string(),
                }
            }
            SmtpCommand::Rset => {
                self.session.reset();
                "250 OK\r\n".to_string()
            }
            SmtpCommand::Noop => "250 OK\r\n".to_string(),
            SmtpCommand::Unknown(cmd) => {
                debug!("Unknown command: {}", cmd);
                "502 Command not implemented\r\n".to_string()
            }
            SmtpCommand::Data
            | SmtpCommand::Quit
            | SmtpCommand::Starttls
            | SmtpCommand::Auth(_, _) => "503 Bad sequence of commands\r\n".to_string(),
        }
    }

    fn greet(&mut self, domain: &str) {
        self.session.set_helo(domain);
        self.session.reset();
        self.greeted = true;
    }

    fn ehlo_response(&self, domain: &str) -> String {
        let mut response = format!("250-{} Hello {}\r\n", self.settings.hostname, domain);
        response.push_str(&format!("250-SIZE {}\r\n", self.settings.max_message_size));
        response.push_str("250-8BITMIME\r\n");
        response.push_str("250-PIPELINING\r\n");

        if self.settings.tls.is_some() && !self.is_encrypted {
            response.push_str("250-STARTTLS\r\n");
        }
        if self.settings.auth.is_some() {
            response.push_str("250-AUTH PLAIN LOGIN\r\n");
        }

        response.push_str("250 HELP\r\n");
        response
    }

    fn starttls_refusal(&self) -> Option<&'static str> {
        if self.settings.tls.is_none() {
            Some("502 STARTTLS not available\r\n")
        } else if self.is_encrypted {
            Some("503 Already using TLS\r\n")
        } else if !self.greeted || self.session.state() != SessionState::New {
            Some("503 Bad sequence of commands\r\n")
        } else {
            None
        }
    }

    fn data_refusal(&self) -> Option<&'static str> {
        match self.session.state() {
            SessionState::HasRecipients => None,
            SessionState::HasSender => Some("554 No valid recipients\r\n"),
            _ => Some("503 Bad sequence of commands: need RCPT command\r\n"),
        }
    }

    /// Swap the plain socket for a TLS one; the client must EHLO again
    async fn upgrade(&mut self, stream: &mut SmtpStream) -> Result<()> {
        let tls = self
            .settings
            .tls
            .clone()
            .ok_or_else(|| MailError::Tls("TLS not configured".to_string()))?;

        self.reply(stream, "220 Ready to start TLS\r\n").await?;

        let tcp = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                *stream = other;
                return Err(MailError::Tls("Stream is not plaintext".to_string()));
            }
        };

        debug!("STARTTLS: Performing TLS handshake");
        let tls_stream = tls
            .acceptor()
            .accept(tcp)
            .await
            .map_err(|e| MailError::Tls(format!("TLS handshake failed: {}", e)))?;

        *stream = SmtpStream::Tls(Box::new(tls_stream));
        self.is_encrypted = true;
        self.greeted = false;
        self.session.reset();

        info!("STARTTLS upgrade completed");
        Ok(())
    }

    async fn handle_auth<S>(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
        reader: &mut BufReader<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(auth) = self.settings.auth.clone() else {
            self.reply(reader, "502 AUTH not available\r\n").await?;
            return Ok(());
        };

        if self.session.is_authenticated() {
            self.reply(reader, "503 Already authenticated\r\n").await?;
            return Ok(());
        }

        if !self.greeted || self.session.state() != SessionState::New {
            self.reply(reader, "503 Bad sequence of commands\r\n").await?;
            return Ok(());
        }

        let Some(mechanism) = AuthMechanism::parse(mechanism) else {
            self.reply(reader, "504 Authentication mechanism not supported\r\n")
                .await?;
            return Ok(());
        };

        debug!("AUTH {} initiated", mechanism.as_str());

        let (username, password) = match mechanism {
            AuthMechanism::Plain => {
                let data = match initial_response {
                    Some(data) => data,
                    None => {
                        self.reply(reader, "334 \r\n").await?;
                        self.read_auth_line(reader).await?
                    }
                };
                decode_plain_auth(&data)?
            }
            AuthMechanism::Login => {
                let username = match initial_response {
                    Some(data) => decode_login_credential(&data)?,
                    None => {
                        self.reply(reader, &format!("334 {}\r\n", LOGIN_USERNAME_PROMPT))
                            .await?;
                        decode_login_credential(&self.read_auth_line(reader).await?)?
                    }
                };
                self.reply(reader, &format!("334 {}\r\n", LOGIN_PASSWORD_PROMPT))
                    .await?;
                let password = decode_login_credential(&self.read_auth_line(reader).await?)?;
                (username, password)
            }
        };

        if auth.verify(&username, &password) {
            info!("Authentication successful for {}", username);
            self.session.set_authenticated(username);
            self.reply(reader, "235 Authentication successful\r\n").await
        } else {
            Err(MailError::SmtpProtocol("invalid credentials".to_string()))
        }
    }

    async fn read_auth_line<S>(&self, reader: &mut BufReader<S>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = Vec::new();
        let read = timeout(
            self.settings.read_timeout,
            read_line(reader, &mut line, MAX_LINE_LENGTH),
        )
        .await
        .map_err(|_| MailError::SmtpProtocol("AUTH timeout".to_string()))??;

        match read {
            LineRead::Line => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if text == "*" {
                    return Err(MailError::SmtpProtocol("AUTH cancelled".to_string()));
                }
                Ok(text)
            }
            LineRead::TooLong => Err(MailError::SmtpProtocol("Line too long".to_string())),
            LineRead::Eof => Err(MailError::SmtpProtocol(
                "Connection closed during AUTH".to_string(),
            )),
        }
    }

    /// Read dot-terminated message content, undoing dot-stuffing
    ///
    /// Oversized content is read through to the terminator and discarded so
    /// the dialogue stays in sync. Timeouts and disconnects are fatal.
    async fn receive_data<S>(&self, reader: &mut BufReader<S>) -> Result<DataOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut too_large = false;
        let mut line_too_long = false;

        loop {
            let read = timeout(
                self.settings.read_timeout,
                read_line(reader, &mut line, MAX_LINE_LENGTH),
            )
            .await
            .map_err(|_| MailError::SmtpProtocol("Timeout during DATA".to_string()))??;

            match read {
                LineRead::Eof => {
                    return Err(MailError::SmtpProtocol(
                        "Connection closed during DATA".to_string(),
                    ))
                }
                LineRead::TooLong => {
                    line_too_long = true;
                    continue;
                }
                LineRead::Line => {}
            }

            if line == b".\r\n" || line == b".\n" {
                break;
            }
            if too_large || line_too_long {
                continue;
            }

            let content = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line[..]
            };

            if data.len() + content.len() > self.settings.max_message_size {
                warn!(
                    "Message too large: over {} bytes",
                    self.settings.max_message_size
                );
                too_large = true;
                data.clear();
                continue;
            }
            data.extend_from_slice(content);
        }

        if line_too_long {
            Ok(DataOutcome::LineTooLong)
        } else if too_large {
            Ok(DataOutcome::TooLarge)
        } else {
            debug!("End of DATA received, total size: {} bytes", data.len());
            Ok(DataOutcome::Complete(data))
        }
    }

    async fn commit(&mut self, data: Vec<u8>) -> String {
        match self.session.data(data.as_slice()).await {
            Ok(email) => format!("250 OK: queued as {}\r\n", email.id),
            Err(MailError::Parse(e)) => {
                warn!("Rejected unparseable message: {}", e);
                "554 Transaction failed: message could not be parsed\r\n".to_string()
            }
            Err(e) => {
                error!("Error saving message: {}", e);
                "451 Requested action aborted: local error in processing\r\n".to_string()
            }
        }
    }

    async fn reply<W>(&self, writer: &mut W, response: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let write = async {
            writer.write_all(response.as_bytes()).await?;
            writer.flush().await
        };

        timeout(self.settings.write_timeout, write)
            .await
            .map_err(|_| MailError::SmtpProtocol("Write timeout".to_string()))??;
        Ok(())
    }
}

/// Read one `\n`-terminated line of at most `max` bytes into `buf`
///
/// An over-long line is consumed up to its terminator and reported as
/// [`LineRead::TooLong`].
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader).take(max as u64).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.ends_with(b"\n") {
        return Ok(LineRead::Line);
    }
    if n < max {
        return Ok(LineRead::Eof);
    }

    loop {
        buf.clear();
        let n = (&mut *reader).take(max as u64).read_until(b'\n', buf).await?;
        if n == 0 {
            return Ok(LineRead::Eof);
        }
        if buf.ends_with(b"\n") {
            buf.clear();
            return Ok(LineRead::TooLong);
        }
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("outgoing mail not configured")]
    RelayNotConfigured,

    #[error("relay queue is full")]
    RelayQueueFull,

    #[error("relay worker is closed")]
    RelayClosed,

    #[error("email had no recipients")]
    NoRecipients,

    #[error("Relay error: {0}")]
    Relay(String),
}

impl MailError {
    /// True for errors raised because an id or filename is structurally unsafe
    pub fn is_validation(&self) -> bool {
        matches!(self, MailError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MailError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, MailError>;

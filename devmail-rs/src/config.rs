use crate::error::{MailError, Result};
use crate::relay::OutgoingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub storage: StorageConfig,
    pub outgoing: Option<OutgoingConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name announced in the greeting and EHLO reply
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS (SMTPS) port, only bound when `enable_tls` is set
    pub tls_port: u16,
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mail_dir: PathBuf,
    pub use_uuid_for_id: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// silent | normal | verbose, or any tracing level name
    pub level: String,
    /// pretty | json
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| MailError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| MailError::Config(e.to_string()))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1025,
            tls_port: 465,
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            auth_username: None,
            auth_password: None,
            max_message_size: 1024 * 1024, // 1MB
            max_recipients: 50,
            read_timeout_secs: 10,
            write_timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mail_dir: std::env::temp_dir().join(format!("devmail-{}", std::process::id())),
            use_uuid_for_id: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Translate the capture-server log levels onto tracing directives
    pub fn filter_directive(&self) -> &str {
        match self.level.as_str() {
            "silent" => "error",
            "normal" => "info",
            "verbose" => "debug",
            other => other,
        }
    }
}

impl SmtpConfig {
    /// Credentials, present only when both username and password are non-empty
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.auth_username, &self.auth_password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user.clone(), pass.clone()))
            }
            _ => None,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tls_listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.tls_port)
    }
}

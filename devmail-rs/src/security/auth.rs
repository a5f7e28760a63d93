//! SMTP AUTH support
//!
//! A capture server has a single set of credentials taken from the
//! configuration; there is no user database.
//!
//! # Supported mechanisms
//! - PLAIN (RFC 4616)
//! - LOGIN (common but not standardized)

use crate::config::SmtpConfig;
use crate::error::{MailError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Base64 "Username:" prompt for AUTH LOGIN
pub const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6";

/// Base64 "Password:" prompt for AUTH LOGIN
pub const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    /// Parse mechanism name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Configured SMTP credentials
#[derive(Clone)]
pub struct SmtpAuthConfig {
    username: String,
    password: String,
}

impl SmtpAuthConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Present only when both username and password are configured
    pub fn from_config(config: &SmtpConfig) -> Option<Self> {
        config
            .credentials()
            .map(|(username, password)| Self::new(username, password))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Check a username/password pair
    ///
    /// Passwords are compared through their SHA-256 digests so the
    /// comparison time does not depend on the common prefix length.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        debug!("Authentication attempt for {}", username);

        let ok = username == self.username
            && Sha256::digest(password.as_bytes()) == Sha256::digest(self.password.as_bytes());
        if !ok {
            warn!("Authentication failed for {}", username);
        }
        ok
    }
}

impl std::fmt::Debug for SmtpAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpAuthConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Decode PLAIN authentication data
///
/// Format: `authzid\0username\0password` (base64 encoded)
pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| MailError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    let parts: Vec<&str> = std::str::from_utf8(&decoded)
        .map_err(|e| MailError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))?
        .split('\0')
        .collect();

    match parts.as_slice() {
        [_authzid, username, password] => Ok((username.to_string(), password.to_string())),
        _ => Err(MailError::SmtpProtocol(
            "Invalid PLAIN auth format".to_string(),
        )),
    }
}

/// Decode one base64 LOGIN response line
pub fn decode_login_credential(credential: &str) -> Result<String> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| MailError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded).map_err(|e| MailError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))
}

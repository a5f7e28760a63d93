//! Security module
//!
//! - [`auth`]: SMTP AUTH (PLAIN, LOGIN) against the configured credentials
//! - [`tls`]: TLS for STARTTLS and the implicit-TLS listener

pub mod auth;
pub mod tls;

pub use auth::{AuthMechanism, SmtpAuthConfig};
pub use tls::TlsConfig;

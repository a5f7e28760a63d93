//! SMTP capture (RFC 5321)
//!
//! - [`commands`]: command line parsing
//! - [`session`]: per-transaction state (sender, recipients, DATA commit)
//! - [`connection`]: wire dialogue, STARTTLS, AUTH and limits
//! - [`server`]: listener accept loop

pub mod commands;
pub mod connection;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use connection::{SmtpConnection, SmtpSettings, SmtpStream};
pub use server::SmtpServer;
pub use session::{Session, SessionState};

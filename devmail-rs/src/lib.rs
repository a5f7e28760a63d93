//! devmail-rs: development mail capture server
//!
//! Accepts mail over SMTP, keeps every message as a raw `.eml` file plus a
//! parsed in-memory record, and can forward captured messages to a real
//! SMTP relay on request or automatically.
//!
//! # Example
//!
//! ```no_run
//! use devmail_rs::config::Config;
//! use devmail_rs::events::EventKind;
//! use devmail_rs::server::MailServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = MailServer::new(Config::default()).await?;
//!     server
//!         .on(EventKind::New, |email| println!("captured {}", email.subject))
//!         .await;
//!
//!     server.listen().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`events`]: `new` / `delete` notifications
//! - [`mime`]: Message parsing
//! - [`model`]: Captured message types
//! - [`relay`]: Outgoing relay engine
//! - [`security`]: TLS and SMTP AUTH
//! - [`server`]: Lifecycle
//! - [`smtp`]: SMTP protocol implementation
//! - [`storage`]: Mail store
//! - [`utils`]: Ids and sizes

pub mod config;
pub mod error;
pub mod events;
pub mod mime;
pub mod model;
pub mod relay;
pub mod security;
pub mod server;
pub mod smtp;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};
pub use events::{EventBus, EventKind};
pub use model::Email;
pub use server::MailServer;
pub use storage::MailStore;

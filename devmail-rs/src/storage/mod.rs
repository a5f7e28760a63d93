//! Mail store
//!
//! - [`mail_store`]: lock-protected message list backed by `<id>.eml` files
//!   and `<id>/` attachment directories
//! - [`paths`]: id and filename validation against path traversal

pub mod mail_store;
pub mod paths;

pub use mail_store::{calculate_bcc, MailStore};
pub use paths::{validate_email_id, validate_filename};

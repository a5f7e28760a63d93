//! MIME message parsing
//!
//! Turns a raw RFC 5322 byte stream into an [`Email`](crate::model::Email):
//! common headers, decoded subject and addresses, text and HTML bodies, and
//! attachments (including inline `cid:` media).

pub mod attachment;
pub mod date;
pub mod html;
pub mod parser;
pub mod types;

pub use attachment::transform_attachment;
pub use date::parse_email_date;
pub use html::sanitize_html;
pub use parser::MimeParser;
pub use types::{MimePart, ParsedEmail};

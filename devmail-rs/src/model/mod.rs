//! Captured message model
//!
//! Value types shared by the parser, the store, the relay and anything
//! observing store events. All of them serialize to the JSON shape the
//! web inspector consumes.

pub mod email;

pub use email::{Attachment, Email, EmailStats, Envelope, HeaderValue, MailAddress};

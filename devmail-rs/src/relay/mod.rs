//! Outgoing relay engine
//!
//! Captured messages can be forwarded to a real SMTP server, either on
//! request or automatically on arrival. Work goes through a bounded queue
//! drained by a single background worker; a full queue is reported to the
//! caller immediately instead of stalling message ingestion.
//!
//! The store only depends on the [`OutgoingRelay`] trait, so the engine can
//! be swapped for a test double.

pub mod client;
pub mod config;
pub mod outgoing;
pub mod rules;

pub use client::RelayClient;
pub use config::{load_auto_relay_rules, OutgoingConfig};
pub use outgoing::{OutgoingMail, QUEUE_CAPACITY};
pub use rules::{filter_recipients, matches_rule};

use crate::error::{MailError, Result};
use crate::model::Email;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Completion callback, invoked exactly once with the delivery outcome
pub type RelayCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One unit of relay work
pub struct RelayTask {
    pub email: Arc<Email>,
    pub eml_path: PathBuf,
    /// Explicit recipient overriding every other resolution rule
    pub relay_to: Option<String>,
    pub is_auto_relay: bool,
    pub callback: Option<RelayCallback>,
}

impl RelayTask {
    pub fn new(email: Arc<Email>, eml_path: PathBuf) -> Self {
        Self {
            email,
            eml_path,
            relay_to: None,
            is_auto_relay: false,
            callback: None,
        }
    }

    pub fn relay_to(mut self, address: impl Into<String>) -> Self {
        self.relay_to = Some(address.into()).filter(|a: &String| !a.is_empty());
        self
    }

    pub fn auto_relay(mut self, is_auto_relay: bool) -> Self {
        self.is_auto_relay = is_auto_relay;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn complete(mut self, result: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    pub fn fail(self, err: MailError) {
        self.complete(Err(err));
    }
}

impl fmt::Debug for RelayTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTask")
            .field("email", &self.email.id)
            .field("eml_path", &self.eml_path)
            .field("relay_to", &self.relay_to)
            .field("is_auto_relay", &self.is_auto_relay)
            .finish()
    }
}

/// Capability the store and server hold the relay engine through
#[async_trait]
pub trait OutgoingRelay: Send + Sync {
    /// Enqueue without blocking; failures are reported through the task callback
    fn relay_mail(&self, task: RelayTask);

    fn update_config(&self, config: OutgoingConfig);

    fn config(&self) -> OutgoingConfig;

    fn is_auto_relay_enabled(&self) -> bool;

    /// Stop accepting tasks and wait for the worker to drain
    async fn close(&self);
}

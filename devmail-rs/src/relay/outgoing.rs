use super::client::RelayClient;
use super::config::OutgoingConfig;
use super::rules::filter_recipients;
use super::{OutgoingRelay, RelayTask};
use crate::error::{MailError, Result};
use crate::model::Email;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Bounded relay queue size
pub const QUEUE_CAPACITY: usize = 100;

const FALLBACK_SENDER: &str = "noreply@localhost";

/// Queue-backed relay engine with a single delivery worker
///
/// The worker runs for the whole lifetime of the engine, so a relay host can
/// be configured (or removed) at runtime through [`OutgoingRelay::update_config`].
pub struct OutgoingMail {
    config: watch::Sender<OutgoingConfig>,
    queue: mpsc::Sender<RelayTask>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OutgoingMail {
    /// Start the engine; must be called from within a Tokio runtime
    pub fn new(config: OutgoingConfig) -> Self {
        Self::with_capacity(config, QUEUE_CAPACITY)
    }

    pub fn with_capacity(config: OutgoingConfig, capacity: usize) -> Self {
        let (config_tx, config_rx) = watch::channel(config);
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(run_worker(queue_rx, config_rx, shutdown_rx));

        Self {
            config: config_tx,
            queue: queue_tx,
            shutdown: shutdown_tx,
            worker: Mutex::new(Some(worker)),
        }
    }
}

#[async_trait]
impl OutgoingRelay for OutgoingMail {
    fn relay_mail(&self, task: RelayTask) {
        if !self.config.borrow().is_enabled() {
            task.fail(MailError::RelayNotConfigured);
            return;
        }
        if *self.shutdown.borrow() {
            task.fail(MailError::RelayClosed);
            return;
        }

        match self.queue.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                debug!("Relay queue full, rejecting {}", task.email.id);
                task.fail(MailError::RelayQueueFull);
            }
            Err(TrySendError::Closed(task)) => task.fail(MailError::RelayClosed),
        }
    }

    fn update_config(&self, config: OutgoingConfig) {
        info!(
            "Outgoing relay {}",
            if config.is_enabled() {
                format!("set to {}:{}", config.host, config.port)
            } else {
                "disabled".to_string()
            }
        );
        self.config.send_replace(config);
    }

    fn config(&self) -> OutgoingConfig {
        self.config.borrow().clone()
    }

    fn is_auto_relay_enabled(&self) -> bool {
        let config = self.config.borrow();
        config.is_enabled() && config.auto_relay
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!("Relay worker terminated abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    mut queue: mpsc::Receiver<RelayTask>,
    config: watch::Receiver<OutgoingConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Relay worker started");

    loop {
        tokio::select! {
            task = queue.recv() => match task {
                Some(task) => process(task, &config).await,
                None => break,
            },
            _ = shutdown.changed() => {
                // Drain what was accepted before close
                queue.close();
                while let Some(task) = queue.recv().await {
                    process(task, &config).await;
                }
                break;
            }
        }
    }

    debug!("Relay worker stopped");
}

async fn process(task: RelayTask, config: &watch::Receiver<OutgoingConfig>) {
    let snapshot = config.borrow().clone();
    let recipients = get_recipients(&task, &snapshot);
    let result = deliver(
        task.email.clone(),
        task.eml_path.clone(),
        recipients,
        snapshot,
    )
    .await;
    if let Err(e) = &result {
        debug!("Relay of {} failed: {}", task.email.id, e);
    }
    task.complete(result);
}

async fn deliver(
    email: Arc<Email>,
    eml_path: PathBuf,
    recipients: Vec<String>,
    config: OutgoingConfig,
) -> Result<()> {
    if !config.is_enabled() {
        return Err(MailError::RelayNotConfigured);
    }
    if recipients.is_empty() {
        return Err(MailError::NoRecipients);
    }

    let data = tokio::fs::read(&eml_path).await.map_err(|e| {
        MailError::Persistence(format!(
            "failed to read email file {}: {}",
            eml_path.display(),
            e
        ))
    })?;

    let sender = resolve_sender(&email);
    RelayClient::new(config).send_raw(&sender, &recipients, &data).await?;

    info!(
        "Mail relayed successfully: {} (to: {:?})",
        email.subject, recipients
    );
    Ok(())
}

/// Explicit address, else the auto-relay address, else filtered envelope recipients
pub fn get_recipients(task: &RelayTask, config: &OutgoingConfig) -> Vec<String> {
    if let Some(relay_to) = task.relay_to.as_ref().filter(|r| !r.is_empty()) {
        return vec![relay_to.clone()];
    }

    if task.is_auto_relay && !config.auto_relay_addr.is_empty() {
        return vec![config.auto_relay_addr.clone()];
    }

    let recipients = task
        .email
        .envelope
        .as_ref()
        .map(|e| e.to.clone())
        .unwrap_or_default();

    filter_recipients(&recipients, &config.allow_rules, &config.deny_rules)
}

/// Declared From address, else the SMTP sender, else `noreply@localhost`
pub fn resolve_sender(email: &Email) -> String {
    email
        .from_address()
        .map(str::to_string)
        .or_else(|| {
            email
                .envelope
                .as_ref()
                .map(|e| e.from.clone())
                .filter(|f| !f.is_empty())
        })
        .unwrap_or_else(|| FALLBACK_SENDER.to_string())
}

//! Server lifecycle
//!
//! [`MailServer`] owns the store, the event bus, the relay engine and the
//! SMTP listeners for the lifetime of the process.

use crate::config::Config;
use crate::error::{MailError, Result};
use crate::events::{EventBus, EventKind};
use crate::model::{Email, EmailStats};
use crate::relay::{OutgoingConfig, OutgoingMail, OutgoingRelay};
use crate::security::TlsConfig;
use crate::smtp::{SmtpServer, SmtpSettings};
use crate::storage::MailStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Listener {
    name: &'static str,
    addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

pub struct MailServer {
    config: Config,
    events: Arc<EventBus>,
    store: Arc<MailStore>,
    settings: Arc<SmtpSettings>,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<Listener>>,
}

impl MailServer {
    /// Prepare the mail directory, relay engine and TLS, and restore stored mail
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn new(config: Config) -> Result<Self> {
        let mail_dir = config.storage.mail_dir.clone();
        tokio::fs::create_dir_all(&mail_dir).await.map_err(|e| {
            MailError::Persistence(format!(
                "failed to create mail directory {}: {}",
                mail_dir.display(),
                e
            ))
        })?;

        let events = Arc::new(EventBus::new());
        let store = Arc::new(
            MailStore::new(&mail_dir, events.clone())
                .with_uuid_ids(config.storage.use_uuid_for_id),
        );

        if let Some(mut outgoing) = config.outgoing.clone() {
            outgoing.load_rules_file()?;
            if outgoing.is_enabled() {
                info!("Outgoing relay: {}:{}", outgoing.host, outgoing.port);
            }
            store.set_outgoing(Arc::new(OutgoingMail::new(outgoing))).await;
        }

        let tls = if config.smtp.enable_tls {
            Some(TlsConfig::load_or_generate(
                config.smtp.tls_cert_path.as_deref(),
                config.smtp.tls_key_path.as_deref(),
            )?)
        } else {
            None
        };
        let settings = Arc::new(SmtpSettings::from_config(&config, tls));

        if settings.auth.is_some() {
            info!("SMTP authentication enabled");
        }

        match store.load_from_directory().await {
            Ok(0) => {}
            Ok(count) => info!("Loaded {} email(s) from {}", count, mail_dir.display()),
            Err(e) => warn!("Could not load stored mail: {}", e),
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            events,
            store,
            settings,
            shutdown,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<MailStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Bind the plaintext listener, plus the implicit-TLS one when TLS is on
    ///
    /// Returns the plaintext address; binding failures are returned to the
    /// caller.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let smtp_addr = self
            .spawn_listener("SMTP", &self.config.smtp.listen_addr(), false)
            .await?;

        if self.settings.tls.is_some() {
            self.spawn_listener("SMTPS", &self.config.smtp.tls_listen_addr(), true)
                .await?;
        }

        Ok(smtp_addr)
    }

    async fn spawn_listener(
        &self,
        name: &'static str,
        addr: &str,
        implicit_tls: bool,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            MailError::Config(format!("failed to bind {} listener on {}: {}", name, addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let server = SmtpServer::new(self.settings.clone(), self.store.clone())
            .implicit_tls(implicit_tls);
        let handle = tokio::spawn(server.serve(listener, self.shutdown.subscribe()));

        self.listeners.lock().await.push(Listener {
            name,
            addr: local_addr,
            handle,
        });
        Ok(local_addr)
    }

    /// Address of the implicit-TLS listener, once listening
    pub async fn tls_local_addr(&self) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .await
            .iter()
            .find(|l| l.name == "SMTPS")
            .map(|l| l.addr)
    }

    /// Stop the relay engine, then the SMTPS and SMTP listeners
    ///
    /// Every step runs; the first error is returned.
    pub async fn close(&self) -> Result<()> {
        info!("Shutting down mail server");

        if let Some(outgoing) = self.store.outgoing().await {
            outgoing.close().await;
        }

        self.shutdown.send_replace(true);

        let mut listeners = std::mem::take(&mut *self.listeners.lock().await);
        listeners.sort_by_key(|l| l.name != "SMTPS");

        let mut first_error = None;
        for listener in listeners {
            let result = match listener.handle.await {
                Ok(result) => result,
                Err(e) => Err(MailError::SmtpProtocol(format!(
                    "{} listener task failed: {}",
                    listener.name, e
                ))),
            };
            if let Err(e) = result {
                warn!("Error closing {} listener: {}", listener.name, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register an event handler
    pub async fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Arc<Email>) + Send + Sync + 'static,
    {
        self.events.on(kind, handler).await;
    }

    pub async fn stats(&self) -> EmailStats {
        self.store.stats().await
    }

    pub async fn relay_mail<F>(&self, email: &Email, is_auto_relay: bool, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.store.relay_mail(email, is_auto_relay, callback).await
    }

    pub async fn relay_mail_to<F>(&self, email: &Email, relay_to: &str, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.store.relay_mail_to(email, relay_to, callback).await
    }

    pub async fn set_outgoing_config(&self, config: OutgoingConfig) {
        self.store.set_outgoing_config(config).await;
    }

    pub async fn outgoing_config(&self) -> Option<OutgoingConfig> {
        self.store.outgoing_config().await
    }

    /// Swap in a different relay implementation
    pub async fn set_outgoing(&self, outgoing: Arc<dyn OutgoingRelay>) {
        self.store.set_outgoing(outgoing).await;
    }
}

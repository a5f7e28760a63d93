use crate::error::{MailError, Result};
use crate::smtp::connection::{SmtpConnection, SmtpSettings, SmtpStream};
use crate::storage::MailStore;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Accept loop for one listening socket
pub struct SmtpServer {
    settings: Arc<SmtpSettings>,
    store: Arc<MailStore>,
    implicit_tls: bool,
}

impl SmtpServer {
    pub fn new(settings: Arc<SmtpSettings>, store: Arc<MailStore>) -> Self {
        Self {
            settings,
            store,
            implicit_tls: false,
        }
    }

    /// Start TLS right after accept (SMTPS) instead of offering STARTTLS
    pub fn implicit_tls(mut self, enabled: bool) -> Self {
        self.implicit_tls = enabled;
        self
    }

    /// Accept connections until `shutdown` flips to true
    ///
    /// Connections already in progress keep running to completion.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.implicit_tls && self.settings.tls.is_none() {
            return Err(MailError::Tls(
                "implicit TLS listener requires a TLS configuration".to_string(),
            ));
        }

        let local_addr = listener.local_addr()?;
        info!(
            "SMTP{} server listening on {}",
            if self.implicit_tls { "S" } else { "" },
            local_addr
        );

        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        debug!("New SMTP connection from {}", addr);
                        self.spawn_connection(socket, addr.to_string());
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("SMTP server on {} stopped", local_addr);
        Ok(())
    }

    fn spawn_connection(&self, socket: TcpStream, remote_address: String) {
        let settings = self.settings.clone();
        let store = self.store.clone();
        let acceptor = if self.implicit_tls {
            settings.tls.as_ref().map(|tls| tls.acceptor())
        } else {
            None
        };

        tokio::spawn(async move {
            let stream = match acceptor {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(tls) => SmtpStream::Tls(Box::new(tls)),
                    Err(e) => {
                        debug!("TLS handshake with {} failed: {}", remote_address, e);
                        return;
                    }
                },
                None => SmtpStream::Plain(socket),
            };

            let connection = SmtpConnection::new(settings, store, remote_address.clone());
            if let Err(e) = connection.handle(stream).await {
                error!("Session error with {}: {}", remote_address, e);
            }
        });
    }
}

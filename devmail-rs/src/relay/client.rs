//! SMTP submission to the configured upstream relay
//!
//! Sends the stored `.eml` bytes verbatim; only the SMTP envelope (sender
//! and filtered recipients) is decided here.

use super::config::OutgoingConfig;
use crate::error::{MailError, Result};
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{debug, info};

/// SMTP client for one relay configuration snapshot
pub struct RelayClient {
    config: OutgoingConfig,
}

impl RelayClient {
    pub fn new(config: OutgoingConfig) -> Self {
        Self { config }
    }

    /// Submit raw message bytes to the relay
    ///
    /// Uses implicit TLS when `secure` is set, otherwise upgrades with
    /// STARTTLS when the relay offers it. PLAIN/LOGIN credentials are sent
    /// only when both user and password are configured.
    pub async fn send_raw(&self, from: &str, recipients: &[String], data: &[u8]) -> Result<()> {
        if !self.config.is_enabled() {
            return Err(MailError::RelayNotConfigured);
        }
        if recipients.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let envelope = Self::envelope(from, recipients)?;
        let transport = self.transport()?;

        debug!(
            "Relaying {} bytes via {}:{} (secure: {})",
            data.len(),
            self.config.host,
            self.config.port,
            self.config.secure
        );

        transport
            .send_raw(&envelope, data)
            .await
            .map_err(|e| MailError::Relay(format!("failed to send email: {}", e)))?;

        info!("Relayed message from {} to {:?}", from, recipients);
        Ok(())
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let host = self.config.host.as_str();

        let builder = if self.config.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| MailError::Relay(format!("SMTP relay error: {}", e)))?
        } else {
            let tls = TlsParameters::new(host.to_string())
                .map_err(|e| MailError::Relay(format!("TLS parameters error: {}", e)))?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                .tls(Tls::Opportunistic(tls))
        };
        let mut builder = builder.port(self.config.port);

        if self.config.has_credentials() {
            builder = builder
                .credentials(Credentials::new(
                    self.config.user.clone(),
                    self.config.password.clone(),
                ))
                .authentication(vec![Mechanism::Plain, Mechanism::Login]);
        }

        Ok(builder.build())
    }

    fn envelope(from: &str, recipients: &[String]) -> Result<Envelope> {
        let sender: Address = from
            .parse()
            .map_err(|e| MailError::Relay(format!("invalid sender {}: {}", from, e)))?;

        let rcpts = recipients
            .iter()
            .map(|r| {
                r.parse::<Address>()
                    .map_err(|e| MailError::Relay(format!("invalid recipient {}: {}", r, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Envelope::new(Some(sender), rcpts).map_err(|e| MailError::Relay(e.to_string()))
    }
}

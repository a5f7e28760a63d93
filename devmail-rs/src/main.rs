use anyhow::Context;
use clap::Parser;
use devmail_rs::config::Config;
use devmail_rs::events::EventKind;
use devmail_rs::server::MailServer;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devmail")]
#[command(about = "Development SMTP server that captures every message", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the SMTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the mail directory
    #[arg(long)]
    mail_dir: Option<PathBuf>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter_directive()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        Config::default()
    };
    if let Some(port) = cli.port {
        config.smtp.port = port;
    }
    if let Some(mail_dir) = cli.mail_dir {
        config.storage.mail_dir = mail_dir;
    }

    init_tracing(&config);

    info!("Starting devmail");
    info!("  SMTP listening on: {}", config.smtp.listen_addr());
    if config.smtp.enable_tls {
        info!("  SMTPS listening on: {}", config.smtp.tls_listen_addr());
    }
    info!("  Mail directory: {}", config.storage.mail_dir.display());

    let server = MailServer::new(config)
        .await
        .context("failed to start mail server")?;

    server
        .on(EventKind::New, |email| {
            debug!("New email {} from {:?}", email.id, email.from_address());
        })
        .await;

    server.listen().await.context("failed to listen")?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    server.close().await?;
    Ok(())
}

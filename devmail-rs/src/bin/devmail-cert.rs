//! Generate a self-signed certificate for the SMTP listeners
//!
//! The certificate covers `localhost`, `127.0.0.1` and `::1` and is valid
//! for one year. For local development only.
//!
//! # Usage
//!
//! ```bash
//! devmail-cert --cert dev-cert.pem --key dev-key.pem
//! ```

use clap::Parser;
use devmail_rs::security::tls::generate_self_signed_cert;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devmail-cert")]
#[command(about = "Generate a self-signed development certificate", long_about = None)]
struct Cli {
    /// Certificate output (PEM)
    #[arg(long, default_value = "cert.pem")]
    cert: PathBuf,

    /// Private key output (PKCS#8 PEM)
    #[arg(long, default_value = "key.pem")]
    key: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    generate_self_signed_cert(&cli.cert, &cli.key)?;

    println!("✓ Certificate written to {}", cli.cert.display());
    println!("✓ Private key written to {}", cli.key.display());
    println!();
    println!("Add to config.toml:");
    println!("  [smtp]");
    println!("  enable_tls = true");
    println!("  tls_cert_path = \"{}\"", cli.cert.display());
    println!("  tls_key_path = \"{}\"", cli.key.display());

    Ok(())
}

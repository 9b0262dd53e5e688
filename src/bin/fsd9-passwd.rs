//! fsd9-passwd - create or update an FSD account
//!
//! Writes one user with an argon2 password hash through the credential
//! store named in the server configuration.

use anyhow::{bail, Context, Result};
use clap::Parser;
use fsd9_core::config::AppConfig;
use fsd9_db::credential::new_user_record;
use std::path::PathBuf;

/// Create or update an FSD account
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml", env = "FSD9_CONFIG")]
    config: PathBuf,

    /// Account callsign (the CID clients log in with)
    callsign: String,

    /// Account password
    password: String,

    /// Rating, 0 suspends the account
    #[arg(default_value_t = 1)]
    rating: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.callsign.is_empty() || args.password.is_empty() {
        bail!("Callsign and password must not be empty");
    }

    let config = AppConfig::from_config_builder(&args.config)
        .with_context(|| format!("Failed to load config file: {:?}", args.config))?;

    let gateway = fsd9_db::open(&config.database).context("Failed to open credential store")?;
    let record = new_user_record(&args.callsign, &args.password, args.rating).context("Failed to hash password")?;
    gateway
        .upsert_user(record)
        .await
        .with_context(|| format!("Failed to store user {}", args.callsign))?;

    println!("User {} saved with rating {}", args.callsign, args.rating);
    Ok(())
}

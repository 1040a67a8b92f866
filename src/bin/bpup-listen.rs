//! Debug tool that subscribes to a bridge's push updates and logs them.
//!
//! Usage:
//!   BOND_HOST=10.0.0.5 cargo run --bin bpup-listen
//!
//! Runs until Ctrl+C or until the bridge stops answering keepalives.

use bondhome_mqtt_bridge::bond::push::{PushError, PushSession, SessionConfig, UpdateKind};
use bondhome_mqtt_bridge::config::{self, Config};
use log::{debug, error, info, warn};
use std::time::Duration;

#[tokio::main]
async fn main() {
    // Load .env file before anything else
    config::load_dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = Config::from_env();
    if config.bond.host.trim().is_empty() {
        error!("BOND_HOST is not set");
        std::process::exit(1);
    }

    let address = config.bond.push_address();
    info!("[BPUP] Subscribing to {}", address);

    let session = match PushSession::open(&address, SessionConfig::default()).await {
        Ok(session) => session,
        Err(e) => {
            error!("[BPUP] Could not start push session: {}", e);
            std::process::exit(1);
        }
    };

    info!("Listening for updates... Press Ctrl+C to exit.");

    let listen = async {
        loop {
            match session.receive(Duration::from_secs(30)).await {
                Ok(update) => match update.kind() {
                    UpdateKind::Topic => info!(
                        "[BPUP] {} {} {} -> {}",
                        update.method().map(|m| m.to_string()).unwrap_or_default(),
                        update.topic,
                        update.status_code,
                        update.body
                    ),
                    UpdateKind::Error => warn!(
                        "[BPUP] Error from bridge: {:?} {}",
                        update.error_id,
                        update.error_message().unwrap_or_default()
                    ),
                    UpdateKind::Noop => debug!("[BPUP] No-op update from {}", update.bond_id),
                },
                Err(PushError::Timeout(after)) => debug!("[BPUP] Nothing received in {:?}", after),
                Err(PushError::Decode(e)) => warn!("[BPUP] {}", e),
                Err(e) => return e,
            }
        }
    };

    tokio::select! {
        e = listen => {
            match session.shutdown_reason() {
                Some(reason) if reason.is_failure() => error!("[BPUP] Session failed: {:?}", reason),
                _ => error!("[BPUP] Receive failed: {}", e),
            }
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    session.close();
}

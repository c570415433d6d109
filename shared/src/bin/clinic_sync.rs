//! Headless sync session: resolves the mode, loads state, follows remote
//! changes and logs a summary whenever the state moves.
//!
//! `clinic-sync hash-passphrase <passphrase>` prints a PHC string for
//! `admin_passphrase_hash` instead.

use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use shared::auth::hash_passphrase;
use shared::config::ClinicConfig;
use shared::Session;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("hash-passphrase") {
        let passphrase = args.next().ok_or("usage: clinic-sync hash-passphrase <passphrase>")?;
        println!("{}", hash_passphrase(&SecretString::new(passphrase))?);
        return Ok(());
    }

    let config = ClinicConfig::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    config.validate()?;
    tracing::info!("clinic-sync starting v{}", env!("CARGO_PKG_VERSION"));

    let session = Session::start(config.session_parts()?).await;
    let mut state = session.coordinator().subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = state.borrow_and_update().clone();
                tracing::info!(
                    mode = %view.mode_label,
                    pending_prescriptions = view.pending_prescriptions,
                    pending_missing = view.pending_missing,
                    conditions = view.advice_index.len(),
                    "State updated"
                );
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

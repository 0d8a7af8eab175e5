use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Returns a token that is cancelled on the first Ctrl+C.
///
/// Hand it to [`crate::Driver`] so an interrupt takes the same draining path
/// as the duration timer.
pub fn setup_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt signal (Ctrl+C), stopping run");
                trigger.cancel();
            }
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    });

    token
}

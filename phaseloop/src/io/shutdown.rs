//! SIGINT/SIGTERM handling for graceful shutdown.
//!
//! The loop is synchronous, so signals are awaited on a helper thread running
//! a small tokio runtime. A signal only sets the [`AbortSignal`]; the loop
//! persists PAUSED at its next safe checkpoint.

use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::io::clock::AbortSignal;

/// Install signal listeners that request an abort on SIGINT or SIGTERM.
pub fn install(abort: AbortSignal) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;

    thread::Builder::new()
        .name("phaseloop-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                wait_for_signal().await;
                warn!("shutdown requested; pausing at next checkpoint");
                abort.request();
            });
        })
        .context("spawn signal thread")?;
    debug!("signal handlers installed");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("SIGINT received"),
        _ = sigterm.recv() => debug!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    debug!("ctrl-c received");
}

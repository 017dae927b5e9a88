//! Cancellation of an in-flight rollout attempt
//!
//! The binary wires SIGTERM/SIGINT to a [`CancelHandle`]; the orchestrator and
//! the steady-state poll loop listen on the paired [`CancelSignal`]. Once
//! cancelled, the attempt is abandoned and the failure path still persists a
//! `Failed` release if apply was already reached.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Receiving side of a cancel channel, cheap to clone
#[derive(Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
    // Held by `never()` so the channel stays open
    _sender: Option<Arc<watch::Sender<bool>>>,
}

impl CancelSignal {
    /// Signal that never fires
    pub fn never() -> Self {
        let (sender, receiver) = watch::channel(false);
        CancelSignal {
            receiver,
            _sender: Some(Arc::new(sender)),
        }
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                // Handle dropped, treat as cancelled
                break;
            }
        }
    }

    /// Non-blocking check
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sending side of a cancel channel
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
        info!("Cancellation requested");
    }
}

/// Create a new cancel channel
pub fn cancel_channel() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancelHandle { sender },
        CancelSignal {
            receiver,
            _sender: None,
        },
    )
}

/// Cancel through `handle` once `signal` resolves
///
/// When the signal source fails the handle is held forever: a dropped handle
/// reads as a cancellation, and a missing signal handler must not abort the
/// attempt.
pub async fn cancel_on<F>(handle: CancelHandle, signal: F)
where
    F: Future<Output = std::io::Result<&'static str>>,
{
    match signal.await {
        Ok(name) => {
            warn!(signal = name, "Cancelling rollout");
            handle.cancel();
        }
        Err(e) => {
            warn!(error = %e, "Failed to install signal handlers (non-fatal)");
            std::future::pending::<()>().await;
            drop(handle);
        }
    }
}

/// Wait for SIGTERM or SIGINT
///
/// Returns the name of the signal received.
///
/// # Errors
/// Fails if the signal handlers cannot be registered.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

/// Wait for Ctrl+C (non-unix)
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok("CTRL_C")
}

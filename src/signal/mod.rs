//! Signal handling for graceful shutdown (SIGINT/SIGTERM)
//!
//! On the first signal the shared cancellation token fires: consumer pools
//! stop taking deliveries and running evaluations are marked `interrupted`
//! and killed. A second signal exits immediately.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Exit code after an interrupted run
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: begin graceful shutdown
    InitiateShutdown,
    /// Second signal: exit without waiting
    ImmediateExit,
    /// Third+ signal: ignore
    Ignore,
}

/// Signal handler state
#[derive(Debug, Default)]
pub struct SignalState {
    signal_count: AtomicU8,
    token: CancellationToken,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled by the first signal.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a signal and return what to do about it.
    pub fn handle_signal(&self) -> SignalAction {
        match self.signal_count.fetch_add(1, Ordering::SeqCst) {
            0 => {
                self.token.cancel();
                SignalAction::InitiateShutdown
            }
            1 => SignalAction::ImmediateExit,
            _ => SignalAction::Ignore,
        }
    }
}

/// Install the process-wide SIGINT/SIGTERM handler.
///
/// Must be called once at program startup.
pub fn install(state: Arc<SignalState>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || match state.handle_signal() {
        SignalAction::InitiateShutdown => {
            tracing::warn!("Received interrupt signal, shutting down gracefully");
        }
        SignalAction::ImmediateExit => {
            tracing::error!("Received second interrupt, exiting immediately");
            std::process::exit(EXIT_CODE_INTERRUPTED);
        }
        SignalAction::Ignore => {}
    })
}

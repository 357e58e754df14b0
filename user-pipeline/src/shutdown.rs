use std::fmt;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    /// Pulling from the log and flushing on thresholds
    Running,
    /// No new messages are pulled, resident batches are being flushed
    Draining,
    /// Everything flushed and committed, or given up on
    Stopped,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ShutdownState::Running => "RUNNING",
            ShutdownState::Draining => "DRAINING",
            ShutdownState::Stopped => "STOPPED",
        };
        f.write_str(state)
    }
}

/// Process lifecycle, shared by the pipeline, signal handlers and probes.
/// Transitions only move forward: RUNNING → DRAINING → STOPPED.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    state: Arc<watch::Sender<ShutdownState>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            token: CancellationToken::new(),
            state: Arc::new(state),
        }
    }

    /// Cancelled as soon as draining starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Starts draining. Returns false if draining had already started.
    pub fn begin_draining(&self, reason: &str) -> bool {
        let changed = self.advance(ShutdownState::Draining);
        if changed {
            info!(reason, "shutdown state change: {}", ShutdownState::Draining);
        }
        self.token.cancel();
        changed
    }

    pub fn mark_stopped(&self) {
        if self.advance(ShutdownState::Stopped) {
            info!("shutdown state change: {}", ShutdownState::Stopped);
        }
        self.token.cancel();
    }

    /// Resolves once the coordinator reaches `state` or a later one
    pub async fn wait_for(&self, state: ShutdownState) {
        let mut receiver = self.state.subscribe();
        if receiver.wait_for(|current| *current >= state).await.is_err() {
            warn!(%state, "shutdown coordinator dropped while waiting");
        }
    }

    /// Registers SIGINT and SIGTERM handlers and starts draining when either
    /// arrives. Fails if the handlers can't be installed.
    pub fn install_signal_handlers(&self) -> std::io::Result<JoinHandle<()>> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let coordinator = self.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => {
                    coordinator.begin_draining("received SIGINT");
                }
                _ = terminate.recv() => {
                    coordinator.begin_draining("received SIGTERM");
                }
                _ = coordinator.token.cancelled() => {}
            }
        }))
    }

    fn advance(&self, next: ShutdownState) -> bool {
        self.state.send_if_modified(|current| {
            if *current < next {
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

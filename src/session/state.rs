//! Session lifecycle states and the atomic cell holding the current one.

use std::fmt::{Display, Formatter};

use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle of one extension host session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, `start` not called.
    NotStarted,
    /// Launching the guest (or dialling the debug target).
    ProcessLaunching,
    /// Connected; waiting for the guest's `Ready`.
    AwaitingReady,
    /// Init payload sent; waiting for `Initialized`.
    AwaitingInitialized,
    /// RPC layer live.
    Active,
    /// Teardown in progress.
    Disposing,
    /// Teardown finished.
    Disposed,
}

impl SessionState {
    /// Check whether a transition from the current state to `next` is valid.
    ///
    /// Forward handshake steps advance one at a time; any state before
    /// `Disposing` may enter `Disposing`, which only leads to `Disposed`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::ProcessLaunching)
                | (Self::ProcessLaunching, Self::AwaitingReady)
                | (Self::AwaitingReady, Self::AwaitingInitialized)
                | (Self::AwaitingInitialized, Self::Active)
                | (
                    Self::NotStarted
                        | Self::ProcessLaunching
                        | Self::AwaitingReady
                        | Self::AwaitingInitialized
                        | Self::Active,
                    Self::Disposing
                )
                | (Self::Disposing, Self::Disposed)
        )
    }

    /// Whether the handshake is still in progress.
    #[must_use]
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            Self::ProcessLaunching | Self::AwaitingReady | Self::AwaitingInitialized
        )
    }

    /// Whether teardown has started or finished.
    #[must_use]
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Disposing | Self::Disposed)
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NotStarted => "not_started",
            Self::ProcessLaunching => "process_launching",
            Self::AwaitingReady => "awaiting_ready",
            Self::AwaitingInitialized => "awaiting_initialized",
            Self::Active => "active",
            Self::Disposing => "disposing",
            Self::Disposed => "disposed",
        };
        f.write_str(text)
    }
}

/// Single source of truth for the session state.
///
/// Transitions are check-and-set under the watch channel's lock, so two
/// racing teardown triggers cannot both win.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        let (tx, _) = watch::channel(SessionState::NotStarted);
        Self { tx }
    }
}

impl StateCell {
    /// Current state.
    #[must_use]
    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Move to `next` if valid from the current state.
    ///
    /// # Errors
    ///
    /// Returns the current state when the transition is not allowed.
    pub fn advance(&self, next: SessionState) -> std::result::Result<SessionState, SessionState> {
        let mut outcome = Err(next);
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                outcome = Ok(*current);
                *current = next;
                true
            } else {
                outcome = Err(*current);
                false
            }
        });
        outcome
    }

    /// Move from exactly `expected` to `next`.
    ///
    /// # Errors
    ///
    /// Returns the current state when it is not `expected` or the
    /// transition is not allowed.
    pub fn compare_and_advance(
        &self,
        expected: SessionState,
        next: SessionState,
    ) -> std::result::Result<(), SessionState> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| {
            if *current == expected && current.can_transition_to(next) {
                *current = next;
                true
            } else {
                outcome = Err(*current);
                false
            }
        });
        outcome
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

/*!
 * Session controller states.
 *
 * The controller moves through a fixed linear lifecycle. The current state
 * is published on a `watch` channel so callers can follow progress without
 * holding a reference to the controller.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, SessionError};

/// Lifecycle state of a session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    /// Nothing has happened yet
    Idle,
    /// Waiting for the device server to accept the connection
    Connecting,
    /// Connection established, no channel yet
    Connected,
    /// Waiting for the channel to open
    ChannelOpening,
    /// Channel open and subscribed, events are being delivered
    Listening,
    /// Closing the channel
    ClosingChannel,
    /// Closing and releasing the connection
    ClosingConnection,
    /// Finished, successfully or not
    Terminated,
}

impl ControllerState {
    /// Whether moving from `self` to `next` is a legal step
    pub fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Terminated)
                | (Connected, ChannelOpening)
                | (ChannelOpening, Listening)
                | (ChannelOpening, Terminated)
                // subscribe failed after the channel opened
                | (ChannelOpening, ClosingChannel)
                | (Listening, ClosingChannel)
                | (ClosingChannel, ClosingConnection)
                | (ClosingConnection, Terminated)
        )
    }

    /// Whether this is the final state
    pub fn is_terminal(self) -> bool {
        self == ControllerState::Terminated
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Connecting => "connecting",
            ControllerState::Connected => "connected",
            ControllerState::ChannelOpening => "channel-opening",
            ControllerState::Listening => "listening",
            ControllerState::ClosingChannel => "closing-channel",
            ControllerState::ClosingConnection => "closing-connection",
            ControllerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Owner of the current state and its watch channel
#[derive(Debug)]
pub struct StateTracker {
    tx: watch::Sender<ControllerState>,
}

impl StateTracker {
    /// A tracker starting in [`ControllerState::Idle`]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControllerState::Idle);
        Self { tx }
    }

    /// The current state
    pub fn current(&self) -> ControllerState {
        *self.tx.borrow()
    }

    /// A receiver that observes every published state
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting illegal steps
    pub fn transition(&self, next: ControllerState) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(SessionError::state(format!(
                "illegal transition {} -> {}",
                current, next
            )));
        }

        debug!("Session state {} -> {}", current, next);
        self.tx.send_replace(next);
        Ok(())
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

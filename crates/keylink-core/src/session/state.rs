//! Lifecycle of one logical session.
//!
//! ```text
//! Unselected ─▶ Selecting ─▶ Active ─┬─▶ Superseded ──▶ Closed
//!                   │                ├─▶ Disconnected ─▶ Closed
//!                   │                └─▶ Closed
//!                   └─▶ Disconnected / Closed (selection failed)
//! ```
//!
//! Closed is terminal.  A caller that needs the application again requests a
//! fresh session instead of reviving an old one.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    /// Requested but not yet at the head of the queue.
    Unselected = 0,
    /// SELECT is on the wire.
    Selecting = 1,
    /// Selected and usable.
    Active = 2,
    /// Another session was granted after this one.
    Superseded = 3,
    /// The link dropped while this session was live.
    Disconnected = 4,
    /// Finished; nothing more will happen.
    Closed = 5,
}

impl SessionState {
    /// Returns `true` if the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unselected, Selecting)
                | (Unselected, Disconnected)
                | (Selecting, Active)
                | (Selecting, Disconnected)
                | (Selecting, Closed)
                | (Active, Superseded)
                | (Active, Disconnected)
                | (Active, Closed)
                | (Superseded, Closed)
                | (Disconnected, Closed)
        )
    }

    /// Only an active session may send commands.
    pub fn accepts_commands(self) -> bool {
        self == SessionState::Active
    }

    /// Returns `true` once the session can no longer become active.
    pub fn is_retired(self) -> bool {
        matches!(
            self,
            SessionState::Superseded | SessionState::Disconnected | SessionState::Closed
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Unselected,
            1 => SessionState::Selecting,
            2 => SessionState::Active,
            3 => SessionState::Superseded,
            4 => SessionState::Disconnected,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unselected => "unselected",
            SessionState::Selecting => "selecting",
            SessionState::Active => "active",
            SessionState::Superseded => "superseded",
            SessionState::Disconnected => "disconnected",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A [`SessionState`] shared between the connection task and handles.
///
/// Transitions are validated and applied atomically; an illegal transition
/// leaves the state untouched.
#[derive(Debug)]
pub struct SessionStateCell {
    inner: AtomicU8,
}

impl SessionStateCell {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: AtomicU8::new(state as u8),
        }
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Moves to `next` if the lifecycle allows it.
    ///
    /// Returns the previous state on success, or the current state if the
    /// transition was refused.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionState> {
        self.inner
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                SessionState::from_u8(raw)
                    .can_transition_to(next)
                    .then_some(next as u8)
            })
            .map(SessionState::from_u8)
            .map_err(SessionState::from_u8)
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new(SessionState::Unselected)
    }
}

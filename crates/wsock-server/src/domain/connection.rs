//! Connection identity and lifecycle state.

use uuid::Uuid;

/// Unique identifier assigned to every accepted connection.
pub type ConnectionId = Uuid;

/// Lifecycle of a single connection.
///
/// ```text
/// AwaitingHandshake ──(101 sent)──▶ Upgraded ──▶ Closed
///          └──────────(EOF / error / stop)──────────▲
/// ```
///
/// There is no transition back and no half-closed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// TCP is connected but no valid Upgrade request has been seen yet.
    AwaitingHandshake,
    /// The 101 response was sent; frames are decoded and dispatched.
    Upgraded,
    /// The receive task has ended.  Terminal.
    Closed,
}

impl ConnectionState {
    /// Returns `true` only in the `Upgraded` state.
    pub fn is_upgraded(self) -> bool {
        self == Self::Upgraded
    }

    /// Returns `true` in the terminal `Closed` state.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

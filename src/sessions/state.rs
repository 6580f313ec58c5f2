//! Session lifecycle state machine.
//!
//! ```text
//!             backend ready            quiet window
//!  Creating ─────────────────> Running ───────────> Idle
//!     │                          │  ^                 │
//!     │ provision/prepare fails  │  └──── input ──────┘
//!     v                          v                    v
//!   Failed <──── failure ──── (Running|Idle) ──> Completed
//!     │                          │                    │
//!     └──────────> Archived <────┴────────────────────┘
//! ```
//!
//! Deletion is not a state: any non-archived session may be removed.

use super::models::SessionStatus;

/// Whether `from → to` is a legal edge. Staying in place is not an edge;
/// callers treat it as a no-op before asking.
pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Creating, Running)
            | (Creating, Failed)
            | (Running, Idle)
            | (Idle, Running)
            | (Running | Idle, Completed)
            | (Running | Idle, Failed)
            | (Running | Idle | Completed | Failed, Archived)
    )
}

/// Statuses a session may be deleted from.
pub fn can_delete(from: SessionStatus) -> bool {
    from != SessionStatus::Archived
}

/// Validate an observed sequence of statuses, e.g. from the event stream.
pub fn is_valid_walk(statuses: &[SessionStatus]) -> bool {
    statuses
        .windows(2)
        .all(|pair| pair[0] == pair[1] || can_transition(pair[0], pair[1]))
}

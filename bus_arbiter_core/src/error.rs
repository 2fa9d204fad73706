use std::time::Duration;

use crate::types::{Direction, Priority, Ticket};

/// Everything that can go wrong when talking to a [`BusArbiter`].
///
/// `InvalidCapacity`, `UnmatchedRelease` and `StaleTicket` are caller defects and are never
/// retried. `WouldBlock` and `TimedOut` only come out of the non-blocking and
/// bounded-wait entry points.
///
/// [`BusArbiter`]: crate::BusArbiter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArbiterError {
    /// Capacity must be at least one slot.
    #[error("invalid bus capacity {capacity}: at least one slot is required")]
    InvalidCapacity { capacity: usize },

    /// `release` for a (direction, priority) pair that holds no slot.
    #[error("release of {priority} {direction} slot that is not held")]
    UnmatchedRelease {
        direction: Direction,
        priority: Priority,
    },

    /// Release of a ticket that holds no slot, e.g. one already released.
    #[error("release of ticket {ticket} that holds no slot")]
    StaleTicket { ticket: Ticket },

    /// `try_acquire` could not be admitted without waiting.
    #[error("{priority} {direction} request is not immediately admissible")]
    WouldBlock {
        direction: Direction,
        priority: Priority,
    },

    /// `acquire_timeout` gave up; its request was withdrawn from the queue.
    #[error("{priority} {direction} request timed out after {waited:?}")]
    TimedOut {
        direction: Direction,
        priority: Priority,
        waited: Duration,
    },

    /// A thread panicked while holding the arbiter lock.
    #[error("bus arbiter mutex poisoned")]
    Poisoned,
}

impl ArbiterError {
    /// Stable negative code for the C ABI. `-1`, `-2`, `-8`, `-9` and `-11`
    /// are reserved there for its own argument and handle checks.
    pub fn code(&self) -> i32 {
        match self {
            ArbiterError::InvalidCapacity { .. } => -3,
            ArbiterError::UnmatchedRelease { .. } => -4,
            ArbiterError::WouldBlock { .. } => -5,
            ArbiterError::TimedOut { .. } => -6,
            ArbiterError::Poisoned => -7,
            ArbiterError::StaleTicket { .. } => -10,
        }
    }
}

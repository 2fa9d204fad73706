//bus_arbiter_core/decide.rs

use std::fmt;

use crate::cfg::FairnessPolicy;
use crate::state::ArbiterState;
use crate::types::{Direction, Priority, Ticket};

/// Why an idle bus was handed to a direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChoiceReason {
    /// Only this direction had waiters.
    OnlyWaiting,
    /// This direction had elevated waiters and the other did not.
    Elevated,
    /// Tie broken toward the direction not served last.
    Alternation,
    /// Tie broken toward the direction with the oldest waiter.
    OldestFirst,
    /// The elevated direction used up its streak; the other side gets a turn.
    StreakLimit,
}

impl fmt::Display for ChoiceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChoiceReason::OnlyWaiting => "only-waiting",
            ChoiceReason::Elevated => "elevated",
            ChoiceReason::Alternation => "alternation",
            ChoiceReason::OldestFirst => "oldest-first",
            ChoiceReason::StreakLimit => "streak-limit",
        })
    }
}

/// Whether a new `(direction, priority)` request may take a slot right now.
///
/// An idle bus admits anyone (queues are always empty while idle). A busy bus
/// admits only its own direction, only with room left, and never past an
/// earlier waiter that would be served first: same-cell waiters always, and
/// elevated waiters of that direction for a normal request.
pub fn is_admissible(state: &ArbiterState, direction: Direction, priority: Priority) -> bool {
    if state.active_count == 0 {
        return true;
    }
    if state.current_direction != Some(direction) || state.active_count >= state.cfg.capacity {
        return false;
    }
    let queues = &state.waiting[direction.index()];
    if !queues[priority.index()].is_empty() {
        return false;
    }
    if priority == Priority::Normal && !queues[Priority::Elevated.index()].is_empty() {
        return false;
    }
    !(state.cfg.yield_to_opposite && state.has_waiters(direction.opposite()))
}

/// Pick the direction an idle bus serves next, or `None` if nobody waits.
///
/// Total and deterministic in the queue contents, the last served direction,
/// and the elevated streak.
pub fn next_direction(state: &ArbiterState) -> Option<(Direction, ChoiceReason)> {
    let out = state.has_waiters(Direction::Outbound);
    let inb = state.has_waiters(Direction::Inbound);
    match (out, inb) {
        (false, false) => None,
        (true, false) => Some((Direction::Outbound, ChoiceReason::OnlyWaiting)),
        (false, true) => Some((Direction::Inbound, ChoiceReason::OnlyWaiting)),
        (true, true) => Some(contested(state)),
    }
}

fn contested(state: &ArbiterState) -> (Direction, ChoiceReason) {
    let elevated = |d: Direction| !state.waiting[d.index()][Priority::Elevated.index()].is_empty();

    let preferred = match (elevated(Direction::Outbound), elevated(Direction::Inbound)) {
        (true, false) => Some(Direction::Outbound),
        (false, true) => Some(Direction::Inbound),
        _ => None,
    };

    if let Some(d) = preferred {
        let exhausted = state.last_served_direction == Some(d)
            && state.elevated_streak >= state.cfg.elevated_streak_limit;
        if exhausted {
            return (d.opposite(), ChoiceReason::StreakLimit);
        }
        return (d, ChoiceReason::Elevated);
    }

    match (state.cfg.fairness, state.last_served_direction) {
        (FairnessPolicy::Alternate, Some(last)) => (last.opposite(), ChoiceReason::Alternation),
        // Waiters only exist after the bus has run once, so `last` is set in
        // practice; fall back to arrival order anyway.
        (FairnessPolicy::Alternate, None) | (FairnessPolicy::OldestFirst, _) => {
            (oldest_side(state), ChoiceReason::OldestFirst)
        }
    }
}

fn oldest_waiter(state: &ArbiterState, direction: Direction) -> Option<Ticket> {
    state.waiting[direction.index()]
        .iter()
        .filter_map(|q| q.front().copied())
        .min()
}

fn oldest_side(state: &ArbiterState) -> Direction {
    match (
        oldest_waiter(state, Direction::Outbound),
        oldest_waiter(state, Direction::Inbound),
    ) {
        (Some(o), Some(i)) if i < o => Direction::Inbound,
        (None, Some(_)) => Direction::Inbound,
        _ => Direction::Outbound,
    }
}

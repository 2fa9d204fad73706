use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::cfg::ArbiterCfg;
use crate::decide::{self, ChoiceReason};
use crate::error::ArbiterError;
use crate::types::{Direction, Priority, Ticket};

/// Outcome of [`ArbiterState::request`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// The caller holds a slot now.
    Admitted(Ticket),
    /// The caller was queued; it owns a slot once `take_grant(ticket)` says so.
    Queued(Ticket),
}

impl Request {
    pub fn ticket(self) -> Ticket {
        match self {
            Request::Admitted(t) | Request::Queued(t) => t,
        }
    }
}

/// Outcome of [`ArbiterState::withdraw`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Withdrawal {
    /// The ticket left its queue. `woken` lists tickets admitted as a result.
    Removed { woken: Vec<Ticket> },
    /// The ticket was admitted before it could be withdrawn; the caller owns
    /// a slot and must consume the grant.
    AlreadyAdmitted,
    /// Neither waiting nor granted.
    Unknown,
}

/// Cumulative counters, never reset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterStats {
    pub admissions: u64,
    /// Admitted on arrival without queueing.
    pub immediate_admissions: u64,
    /// Admitted from a queue by a release or withdrawal.
    pub queued_admissions: u64,
    pub outbound_admissions: u64,
    pub inbound_admissions: u64,
    pub elevated_admissions: u64,
    pub normal_admissions: u64,
    /// Idle-to-active transitions.
    pub cycles: u64,
    pub direction_switches: u64,
    pub withdrawn: u64,
    pub rejected_releases: u64,
    pub peak_active: usize,
}

/// One count per (direction, priority) cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCounts {
    pub outbound_elevated: usize,
    pub outbound_normal: usize,
    pub inbound_elevated: usize,
    pub inbound_normal: usize,
}

impl CellCounts {
    fn from_fn<F: Fn(Direction, Priority) -> usize>(f: F) -> Self {
        Self {
            outbound_elevated: f(Direction::Outbound, Priority::Elevated),
            outbound_normal: f(Direction::Outbound, Priority::Normal),
            inbound_elevated: f(Direction::Inbound, Priority::Elevated),
            inbound_normal: f(Direction::Inbound, Priority::Normal),
        }
    }

    pub fn get(&self, direction: Direction, priority: Priority) -> usize {
        match (direction, priority) {
            (Direction::Outbound, Priority::Elevated) => self.outbound_elevated,
            (Direction::Outbound, Priority::Normal) => self.outbound_normal,
            (Direction::Inbound, Priority::Elevated) => self.inbound_elevated,
            (Direction::Inbound, Priority::Normal) => self.inbound_normal,
        }
    }

    pub fn total(&self) -> usize {
        self.outbound_elevated + self.outbound_normal + self.inbound_elevated + self.inbound_normal
    }
}

/// Point-in-time copy of the observable arbiter state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterSnapshot {
    pub capacity: usize,
    pub active_count: usize,
    pub current_direction: Option<Direction>,
    pub last_served_direction: Option<Direction>,
    pub waiting: CellCounts,
    pub held: CellCounts,
    pub stats: ArbiterStats,
}

impl ArbiterSnapshot {
    pub fn is_idle(&self) -> bool {
        self.active_count == 0 && self.waiting.total() == 0
    }
}

/// The arbiter's bookkeeping, without any locking or blocking.
///
/// Every method runs one complete admission decision. `BusArbiter` owns one
/// of these behind its mutex; tests drive it directly.
#[derive(Debug)]
pub struct ArbiterState {
    pub(crate) cfg: ArbiterCfg,
    pub(crate) active_count: usize,
    pub(crate) current_direction: Option<Direction>,
    pub(crate) last_served_direction: Option<Direction>,
    /// `[direction][priority]`, FIFO per cell.
    pub(crate) waiting: [[VecDeque<Ticket>; 2]; 2],
    /// Slots currently held, `[direction][priority]`.
    pub(crate) held: [[usize; 2]; 2],
    /// Class of every ticket that holds a slot.
    pub(crate) holders: HashMap<Ticket, (Direction, Priority)>,
    /// Admitted from a queue but not yet picked up by the waiting caller.
    pub(crate) granted: HashSet<Ticket>,
    /// Consecutive cycles `last_served_direction` won over a waiting opposite
    /// direction on elevated priority alone.
    pub(crate) elevated_streak: u32,
    next_ticket: u64,
    stats: ArbiterStats,
}

impl ArbiterState {
    pub fn new(cfg: ArbiterCfg) -> Result<Self, ArbiterError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            active_count: 0,
            current_direction: None,
            last_served_direction: None,
            waiting: Default::default(),
            held: [[0; 2]; 2],
            holders: HashMap::new(),
            granted: HashSet::new(),
            elevated_streak: 0,
            next_ticket: 0,
            stats: ArbiterStats::default(),
        })
    }

    pub fn cfg(&self) -> &ArbiterCfg {
        &self.cfg
    }

    pub fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn current_direction(&self) -> Option<Direction> {
        self.current_direction
    }

    pub fn last_served_direction(&self) -> Option<Direction> {
        self.last_served_direction
    }

    pub fn stats(&self) -> &ArbiterStats {
        &self.stats
    }

    pub fn held(&self, direction: Direction, priority: Priority) -> usize {
        self.held[direction.index()][priority.index()]
    }

    pub fn waiting_len(&self, direction: Direction, priority: Priority) -> usize {
        self.waiting[direction.index()][priority.index()].len()
    }

    /// Queued tickets of one cell, oldest first.
    pub fn queued(&self, direction: Direction, priority: Priority) -> impl Iterator<Item = Ticket> + '_ {
        self.waiting[direction.index()][priority.index()].iter().copied()
    }

    pub fn has_waiters(&self, direction: Direction) -> bool {
        self.waiting[direction.index()].iter().any(|q| !q.is_empty())
    }

    pub fn total_waiting(&self) -> usize {
        self.waiting.iter().flatten().map(VecDeque::len).sum()
    }

    /// No slot held and nobody queued.
    pub fn is_idle(&self) -> bool {
        self.active_count == 0 && self.total_waiting() == 0
    }

    pub fn is_granted(&self, ticket: Ticket) -> bool {
        self.granted.contains(&ticket)
    }

    /// `true` while `ticket` occupies a slot.
    pub fn holds_slot(&self, ticket: Ticket) -> bool {
        self.holders.contains_key(&ticket)
    }

    /// Register a new request: admit it now if the admission rule allows,
    /// otherwise append it to its (direction, priority) queue.
    pub fn request(&mut self, direction: Direction, priority: Priority) -> Request {
        let ticket = self.issue_ticket();
        if decide::is_admissible(self, direction, priority) {
            self.admit(ticket, direction, priority, None);
            self.stats.immediate_admissions += 1;
            tracing::trace!(%ticket, %direction, %priority, active = self.active_count, "admitted on arrival");
            Request::Admitted(ticket)
        } else {
            self.waiting[direction.index()][priority.index()].push_back(ticket);
            tracing::debug!(
                %ticket,
                %direction,
                %priority,
                active = self.active_count,
                current = ?self.current_direction,
                "queued"
            );
            Request::Queued(ticket)
        }
    }

    /// Admit only if no waiting is needed. Nothing is queued on failure.
    pub fn try_request(&mut self, direction: Direction, priority: Priority) -> Option<Ticket> {
        if !decide::is_admissible(self, direction, priority) {
            return None;
        }
        let ticket = self.issue_ticket();
        self.admit(ticket, direction, priority, None);
        self.stats.immediate_admissions += 1;
        Some(ticket)
    }

    /// Consume the grant of a queued ticket. Returns `false` while the ticket
    /// is still waiting.
    pub fn take_grant(&mut self, ticket: Ticket) -> bool {
        self.granted.remove(&ticket)
    }

    /// Give back one slot of `(direction, priority)` and run the wake cascade.
    ///
    /// Returns the tickets admitted by the cascade in admission order. A
    /// release for a cell holding no slot is rejected and changes nothing
    /// except the `rejected_releases` counter. The oldest holder of the cell
    /// gives up its slot; callers that know their ticket should use
    /// [`release_ticket`](Self::release_ticket), which also catches a second
    /// release while other tasks of the same class still hold slots.
    pub fn release(&mut self, direction: Direction, priority: Priority) -> Result<Vec<Ticket>, ArbiterError> {
        let oldest = self
            .holders
            .iter()
            .filter(|(_, class)| **class == (direction, priority))
            .map(|(t, _)| *t)
            .min();
        let Some(ticket) = oldest else {
            self.stats.rejected_releases += 1;
            tracing::warn!(%direction, %priority, active = self.active_count, "release without a held slot");
            return Err(ArbiterError::UnmatchedRelease { direction, priority });
        };
        Ok(self.vacate(ticket, direction, priority))
    }

    /// Give back the slot held by `ticket` and run the wake cascade.
    ///
    /// A ticket that holds no slot, because it was never admitted or was
    /// already released, is rejected and changes nothing except the
    /// `rejected_releases` counter.
    pub fn release_ticket(&mut self, ticket: Ticket) -> Result<Vec<Ticket>, ArbiterError> {
        let Some(&(direction, priority)) = self.holders.get(&ticket) else {
            self.stats.rejected_releases += 1;
            tracing::warn!(%ticket, active = self.active_count, "release of a ticket without a slot");
            return Err(ArbiterError::StaleTicket { ticket });
        };
        Ok(self.vacate(ticket, direction, priority))
    }

    fn vacate(&mut self, ticket: Ticket, direction: Direction, priority: Priority) -> Vec<Ticket> {
        self.holders.remove(&ticket);
        self.held[direction.index()][priority.index()] -= 1;
        self.active_count -= 1;

        if self.active_count == 0 {
            self.current_direction = None;
        }
        let woken = self.dispatch();
        tracing::trace!(
            %ticket,
            %direction,
            %priority,
            active = self.active_count,
            woken = woken.len(),
            "released"
        );
        woken
    }

    /// Pull a queued ticket back out, e.g. after a timeout.
    pub fn withdraw(&mut self, ticket: Ticket) -> Withdrawal {
        for queues in self.waiting.iter_mut() {
            for queue in queues.iter_mut() {
                if let Some(pos) = queue.iter().position(|t| *t == ticket) {
                    queue.remove(pos);
                    self.stats.withdrawn += 1;
                    tracing::debug!(%ticket, "withdrawn from queue");
                    // The departed waiter may have been what held others back.
                    let woken = self.dispatch();
                    return Withdrawal::Removed { woken };
                }
            }
        }
        if self.granted.contains(&ticket) {
            Withdrawal::AlreadyAdmitted
        } else {
            Withdrawal::Unknown
        }
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        ArbiterSnapshot {
            capacity: self.cfg.capacity,
            active_count: self.active_count,
            current_direction: self.current_direction,
            last_served_direction: self.last_served_direction,
            waiting: CellCounts::from_fn(|d, p| self.waiting_len(d, p)),
            held: CellCounts::from_fn(|d, p| self.held(d, p)),
            stats: self.stats.clone(),
        }
    }

    /// Verify every structural invariant; the error names the first one broken.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.active_count > self.cfg.capacity {
            return Err(format!(
                "active_count {} exceeds capacity {}",
                self.active_count, self.cfg.capacity
            ));
        }
        let held_total: usize = self.held.iter().flatten().sum();
        if held_total != self.active_count {
            return Err(format!(
                "held slots {held_total} disagree with active_count {}",
                self.active_count
            ));
        }
        for d in Direction::ALL {
            for p in Priority::ALL {
                let holders = self.holders.values().filter(|c| **c == (d, p)).count();
                if holders != self.held(d, p) {
                    return Err(format!(
                        "{holders} {p} {d} tickets hold slots but the cell counts {}",
                        self.held(d, p)
                    ));
                }
            }
        }
        match self.current_direction {
            None if self.active_count != 0 => {
                return Err(format!("{} active slots without a direction", self.active_count));
            }
            Some(d) if self.active_count == 0 => {
                return Err(format!("idle bus still claims direction {d}"));
            }
            Some(d) => {
                let other: usize = self.held[d.opposite().index()].iter().sum();
                if other != 0 {
                    return Err(format!("{other} {} slots held while bus runs {d}", d.opposite()));
                }
            }
            None => {}
        }
        if self.active_count == 0 && self.total_waiting() != 0 {
            return Err(format!("{} waiters stranded on an idle bus", self.total_waiting()));
        }
        for queue in self.waiting.iter().flatten() {
            if let Some(t) = queue.iter().find(|t| self.granted.contains(t)) {
                return Err(format!("ticket {t} is both queued and granted"));
            }
            if queue.iter().zip(queue.iter().skip(1)).any(|(a, b)| a >= b) {
                return Err("queue is not in arrival order".to_string());
            }
        }
        Ok(())
    }

    fn issue_ticket(&mut self) -> Ticket {
        let t = Ticket(self.next_ticket);
        self.next_ticket += 1;
        t
    }

    /// Occupy one slot for `ticket`. The bus must be idle or
    /// already running `direction` with room left. `reason` is how the
    /// direction was picked when this admission turns an idle bus around.
    fn admit(&mut self, ticket: Ticket, direction: Direction, priority: Priority, reason: Option<ChoiceReason>) {
        debug_assert!(self.active_count < self.cfg.capacity);
        debug_assert!(self.current_direction.is_none() || self.current_direction == Some(direction));

        if self.active_count == 0 {
            self.begin_cycle(direction, reason);
        }
        self.active_count += 1;
        self.held[direction.index()][priority.index()] += 1;
        self.holders.insert(ticket, (direction, priority));
        self.current_direction = Some(direction);

        self.stats.admissions += 1;
        self.stats.peak_active = self.stats.peak_active.max(self.active_count);
        match direction {
            Direction::Outbound => self.stats.outbound_admissions += 1,
            Direction::Inbound => self.stats.inbound_admissions += 1,
        }
        match priority {
            Priority::Elevated => self.stats.elevated_admissions += 1,
            Priority::Normal => self.stats.normal_admissions += 1,
        }
    }

    /// Bookkeeping for an idle-to-active transition. `reason` is set when the
    /// direction came out of the idle-time choice rather than an arrival.
    fn begin_cycle(&mut self, direction: Direction, reason: Option<ChoiceReason>) {
        if reason == Some(ChoiceReason::Elevated) {
            if self.last_served_direction == Some(direction) {
                self.elevated_streak += 1;
            } else {
                self.elevated_streak = 1;
            }
        } else {
            self.elevated_streak = 0;
        }
        if let Some(prev) = self.last_served_direction {
            if prev != direction {
                self.stats.direction_switches += 1;
            }
        }
        self.last_served_direction = Some(direction);
        self.stats.cycles += 1;
    }

    /// Admit whatever the current state allows: top up the running direction,
    /// or pick a new one if the bus went idle.
    fn dispatch(&mut self) -> Vec<Ticket> {
        match self.current_direction {
            Some(direction) => self.refill(direction),
            None => self.start_next_cycle(),
        }
    }

    fn refill(&mut self, direction: Direction) -> Vec<Ticket> {
        let mut woken = Vec::new();
        while self.active_count < self.cfg.capacity {
            if self.cfg.yield_to_opposite && self.has_waiters(direction.opposite()) {
                break;
            }
            match self.pop_next(direction) {
                Some((ticket, priority)) => {
                    self.admit(ticket, direction, priority, None);
                    self.grant(ticket);
                    woken.push(ticket);
                }
                None => break,
            }
        }
        if !woken.is_empty() {
            tracing::debug!(%direction, admitted = woken.len(), active = self.active_count, "refilled");
        }
        woken
    }

    fn start_next_cycle(&mut self) -> Vec<Ticket> {
        debug_assert_eq!(self.active_count, 0);
        let Some((direction, reason)) = decide::next_direction(self) else {
            return Vec::new();
        };

        let mut woken = Vec::new();
        while self.active_count < self.cfg.capacity {
            let Some((ticket, priority)) = self.pop_next(direction) else {
                break;
            };
            self.admit(ticket, direction, priority, Some(reason));
            self.grant(ticket);
            woken.push(ticket);
        }
        tracing::debug!(
            %direction,
            reason = %reason,
            admitted = woken.len(),
            streak = self.elevated_streak,
            "bus turned"
        );
        woken
    }

    fn grant(&mut self, ticket: Ticket) {
        self.stats.queued_admissions += 1;
        self.granted.insert(ticket);
    }

    /// Next waiter for `direction`: elevated queue first, FIFO within a queue.
    fn pop_next(&mut self, direction: Direction) -> Option<(Ticket, Priority)> {
        let queues = &mut self.waiting[direction.index()];
        Priority::ALL
            .into_iter()
            .find_map(|p| queues[p.index()].pop_front().map(|t| (t, p)))
    }
}

//! Blocking bus arbiter.
//!
//! [`BusArbiter`] is a monitor around [`ArbiterState`]: one mutex guards all
//! bookkeeping, and every queued request parks on its own condition variable.
//! A release computes exactly which tickets it admitted and notifies only
//! those, so there is no broadcast and no wake target that can miss.
//!
//! The admitting call does the admission on the waiter's behalf while holding
//! the lock; the woken thread only has to consume its grant.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cfg::ArbiterCfg;
use crate::error::ArbiterError;
use crate::state::{ArbiterSnapshot, ArbiterState, Request, Withdrawal};
use crate::types::{Direction, Priority, Ticket};

/// Proof of a granted slot, returned by the `acquire` family.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a granted slot must be released"]
pub struct Admission {
    ticket: Ticket,
    direction: Direction,
    priority: Priority,
    waited: bool,
}

impl Admission {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// `true` if the request was queued before being admitted.
    pub fn waited(&self) -> bool {
        self.waited
    }
}

#[derive(Debug)]
struct Inner {
    state: ArbiterState,
    /// Condition variable of each queued ticket.
    parked: HashMap<Ticket, Arc<Condvar>>,
}

impl Inner {
    fn wake(&self, woken: &[Ticket]) {
        for ticket in woken {
            if let Some(cv) = self.parked.get(ticket) {
                cv.notify_one();
            }
        }
    }

    /// Drop a parked request whose caller is bailing out. A grant that
    /// already landed is handed straight back so its slot is not lost.
    fn abandon(&mut self, ticket: Ticket) {
        self.parked.remove(&ticket);
        let woken = match self.state.withdraw(ticket) {
            Withdrawal::Removed { woken } => woken,
            Withdrawal::AlreadyAdmitted => {
                self.state.take_grant(ticket);
                self.state.release_ticket(ticket).unwrap_or_default()
            }
            Withdrawal::Unknown => Vec::new(),
        };
        self.wake(&woken);
        tracing::warn!(%ticket, "abandoned queued request");
    }
}

/// Shared coordinator for one bus. Share it between tasks with `Arc`.
#[derive(Debug)]
pub struct BusArbiter {
    inner: Mutex<Inner>,
}

impl BusArbiter {
    pub fn new(cfg: ArbiterCfg) -> Result<Self, ArbiterError> {
        let state = ArbiterState::new(cfg)?;
        tracing::debug!(capacity = state.capacity(), fairness = ?state.cfg().fairness, "bus arbiter created");
        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                parked: HashMap::new(),
            }),
        })
    }

    /// Arbiter with default fairness settings and `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Result<Self, ArbiterError> {
        Self::new(ArbiterCfg::with_capacity(capacity))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ArbiterError> {
        self.inner.lock().map_err(|_| ArbiterError::Poisoned)
    }

    /// Block until a slot for `(direction, priority)` is granted.
    pub fn acquire(&self, direction: Direction, priority: Priority) -> Result<Admission, ArbiterError> {
        let mut inner = self.lock()?;
        let ticket = match inner.state.request(direction, priority) {
            Request::Admitted(ticket) => {
                return Ok(Admission {
                    ticket,
                    direction,
                    priority,
                    waited: false,
                })
            }
            Request::Queued(ticket) => ticket,
        };

        let cv = Arc::new(Condvar::new());
        inner.parked.insert(ticket, Arc::clone(&cv));
        while !inner.state.take_grant(ticket) {
            inner = match cv.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => {
                    poisoned.into_inner().abandon(ticket);
                    return Err(ArbiterError::Poisoned);
                }
            };
        }
        inner.parked.remove(&ticket);

        Ok(Admission {
            ticket,
            direction,
            priority,
            waited: true,
        })
    }

    /// Take a slot only if that needs no waiting.
    pub fn try_acquire(&self, direction: Direction, priority: Priority) -> Result<Admission, ArbiterError> {
        let mut inner = self.lock()?;
        match inner.state.try_request(direction, priority) {
            Some(ticket) => Ok(Admission {
                ticket,
                direction,
                priority,
                waited: false,
            }),
            None => Err(ArbiterError::WouldBlock { direction, priority }),
        }
    }

    /// Like [`acquire`](Self::acquire), but give up after `timeout`.
    ///
    /// A request that times out is withdrawn from its queue under the lock.
    /// If a release admitted it in the meantime, the admission stands and is
    /// returned. A timeout too large to express as a deadline waits forever.
    pub fn acquire_timeout(
        &self,
        direction: Direction,
        priority: Priority,
        timeout: Duration,
    ) -> Result<Admission, ArbiterError> {
        let started = Instant::now();
        let Some(deadline) = started.checked_add(timeout) else {
            return self.acquire(direction, priority);
        };

        let mut inner = self.lock()?;
        let ticket = match inner.state.request(direction, priority) {
            Request::Admitted(ticket) => {
                return Ok(Admission {
                    ticket,
                    direction,
                    priority,
                    waited: false,
                })
            }
            Request::Queued(ticket) => ticket,
        };

        let cv = Arc::new(Condvar::new());
        inner.parked.insert(ticket, Arc::clone(&cv));
        loop {
            if inner.state.take_grant(ticket) {
                inner.parked.remove(&ticket);
                return Ok(Admission {
                    ticket,
                    direction,
                    priority,
                    waited: true,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = match cv.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => {
                    poisoned.into_inner().0.abandon(ticket);
                    return Err(ArbiterError::Poisoned);
                }
            };
        }

        inner.parked.remove(&ticket);
        match inner.state.withdraw(ticket) {
            Withdrawal::Removed { woken } => {
                inner.wake(&woken);
                let waited = started.elapsed();
                tracing::warn!(%ticket, %direction, %priority, ?waited, "acquire timed out");
                Err(ArbiterError::TimedOut {
                    direction,
                    priority,
                    waited,
                })
            }
            // The grant was checked just above with the lock held throughout,
            // so these are unreachable; treat both as a late admission.
            Withdrawal::AlreadyAdmitted | Withdrawal::Unknown => {
                inner.state.take_grant(ticket);
                Ok(Admission {
                    ticket,
                    direction,
                    priority,
                    waited: true,
                })
            }
        }
    }

    /// Acquire a slot that is released when the returned guard drops.
    pub fn acquire_slot(&self, direction: Direction, priority: Priority) -> Result<BusSlot<'_>, ArbiterError> {
        let admission = self.acquire(direction, priority)?;
        Ok(BusSlot {
            arbiter: self,
            admission: Some(admission),
        })
    }

    /// Return a slot held by `(direction, priority)` and admit whoever may
    /// go next. Never blocks beyond the arbiter lock.
    pub fn release(&self, direction: Direction, priority: Priority) -> Result<(), ArbiterError> {
        let mut inner = self.lock()?;
        let woken = inner.state.release(direction, priority)?;
        inner.wake(&woken);
        Ok(())
    }

    /// Return the slot held by `ticket`. A second release of the same ticket
    /// fails with [`ArbiterError::StaleTicket`].
    pub fn release_ticket(&self, ticket: Ticket) -> Result<(), ArbiterError> {
        let mut inner = self.lock()?;
        let woken = inner.state.release_ticket(ticket)?;
        inner.wake(&woken);
        Ok(())
    }

    /// Release the slot behind an [`Admission`].
    pub fn release_admission(&self, admission: Admission) -> Result<(), ArbiterError> {
        self.release_ticket(admission.ticket)
    }

    pub fn snapshot(&self) -> Result<ArbiterSnapshot, ArbiterError> {
        Ok(self.lock()?.state.snapshot())
    }

    /// Run [`ArbiterState::check_invariants`] under the lock.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.lock().map_err(|e| e.to_string())?;
        inner.state.check_invariants()
    }

    pub fn capacity(&self) -> Result<usize, ArbiterError> {
        Ok(self.lock()?.state.capacity())
    }

    /// No slot held and nobody queued.
    pub fn is_idle(&self) -> Result<bool, ArbiterError> {
        Ok(self.lock()?.state.is_idle())
    }
}

impl Drop for BusArbiter {
    fn drop(&mut self) {
        let idle = match self.inner.get_mut() {
            Ok(inner) => inner.state.is_idle(),
            Err(_) => return,
        };
        if !idle {
            tracing::error!("bus arbiter dropped with slots held or requests queued");
            if !std::thread::panicking() {
                debug_assert!(idle, "bus arbiter dropped while in use");
            }
        }
    }
}

/// RAII slot: releases its admission when dropped.
///
/// Created by [`BusArbiter::acquire_slot`].
#[derive(Debug)]
pub struct BusSlot<'a> {
    arbiter: &'a BusArbiter,
    admission: Option<Admission>,
}

impl BusSlot<'_> {
    pub fn direction(&self) -> Option<Direction> {
        self.admission.as_ref().map(Admission::direction)
    }

    pub fn priority(&self) -> Option<Priority> {
        self.admission.as_ref().map(Admission::priority)
    }

    pub fn admission(&self) -> Option<&Admission> {
        self.admission.as_ref()
    }

    /// Release now and report the outcome instead of logging it on drop.
    pub fn release(mut self) -> Result<(), ArbiterError> {
        match self.admission.take() {
            Some(admission) => self.arbiter.release_admission(admission),
            None => Ok(()),
        }
    }
}

impl Drop for BusSlot<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            let (direction, priority) = (admission.direction, admission.priority);
            if let Err(e) = self.arbiter.release_admission(admission) {
                tracing::error!(%direction, %priority, error = %e, "failed to release bus slot");
            }
        }
    }
}

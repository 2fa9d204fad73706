use bus_arbiter_core::*;

use Direction::{Inbound, Outbound};
use Priority::{Elevated, Normal};

fn state(capacity: usize) -> ArbiterState {
    ArbiterState::new(ArbiterCfg::with_capacity(capacity)).unwrap()
}

fn admitted(st: &mut ArbiterState, d: Direction, p: Priority) -> Ticket {
    match st.request(d, p) {
        Request::Admitted(t) => t,
        Request::Queued(t) => panic!("{p} {d} request {t} was queued"),
    }
}

fn queued(st: &mut ArbiterState, d: Direction, p: Priority) -> Ticket {
    match st.request(d, p) {
        Request::Queued(t) => t,
        Request::Admitted(t) => panic!("{p} {d} request {t} was admitted"),
    }
}

fn release(st: &mut ArbiterState, d: Direction, p: Priority) -> Vec<Ticket> {
    let woken = st.release(d, p).unwrap();
    for t in &woken {
        assert!(st.take_grant(*t), "woken ticket {t} had no grant");
    }
    st.check_invariants().unwrap();
    woken
}

#[test]
fn same_direction_fills_to_capacity() {
    let mut st = state(3);
    for _ in 0..3 {
        admitted(&mut st, Outbound, Normal);
    }
    assert_eq!(st.active_count(), 3);
    assert_eq!(st.current_direction(), Some(Outbound));
    st.check_invariants().unwrap();

    // Fourth one in the same direction has to wait for room.
    let t = queued(&mut st, Outbound, Normal);
    assert_eq!(release(&mut st, Outbound, Normal), vec![t]);
    assert_eq!(st.active_count(), 3);
}

#[test]
fn opposite_direction_waits_for_idle_bus() {
    let mut st = state(3);
    for _ in 0..3 {
        admitted(&mut st, Outbound, Normal);
    }
    let inbound = queued(&mut st, Inbound, Normal);

    assert!(release(&mut st, Outbound, Normal).is_empty());
    assert!(release(&mut st, Outbound, Normal).is_empty());
    assert_eq!(st.current_direction(), Some(Outbound));

    assert_eq!(release(&mut st, Outbound, Normal), vec![inbound]);
    assert_eq!(st.current_direction(), Some(Inbound));
    assert_eq!(st.active_count(), 1);
}

#[test]
fn opposite_arrival_never_preempts_running_slots() {
    let mut st = state(3);
    admitted(&mut st, Outbound, Normal);
    // Room is left, but the bus runs outbound; even elevated inbound queues.
    queued(&mut st, Inbound, Elevated);
    assert_eq!(st.active_count(), 1);
    assert_eq!(st.current_direction(), Some(Outbound));
}

#[test]
fn elevated_is_admitted_before_normal_on_turnaround() {
    let mut st = state(3);
    admitted(&mut st, Inbound, Normal);
    let normal = queued(&mut st, Outbound, Normal);
    let elevated = queued(&mut st, Outbound, Elevated);

    assert_eq!(release(&mut st, Inbound, Normal), vec![elevated, normal]);
    assert_eq!(st.current_direction(), Some(Outbound));
}

#[test]
fn elevated_is_admitted_strictly_first_with_one_slot() {
    let mut st = state(1);
    admitted(&mut st, Inbound, Normal);
    let normal = queued(&mut st, Outbound, Normal);
    let elevated = queued(&mut st, Outbound, Elevated);

    assert_eq!(release(&mut st, Inbound, Normal), vec![elevated]);
    assert_eq!(st.waiting_len(Outbound, Normal), 1);
    assert_eq!(release(&mut st, Outbound, Elevated), vec![normal]);
}

#[test]
fn single_slot_serializes_tasks() {
    let mut st = state(1);
    admitted(&mut st, Outbound, Normal);
    let second = queued(&mut st, Outbound, Normal);

    assert_eq!(release(&mut st, Outbound, Normal), vec![second]);
    assert!(release(&mut st, Outbound, Normal).is_empty());
    assert_eq!(st.stats().peak_active, 1);
    assert!(st.is_idle());
}

#[test]
fn normal_does_not_jump_queued_elevated() {
    let mut st = state(2);
    admitted(&mut st, Outbound, Normal);
    admitted(&mut st, Outbound, Normal);
    let elevated = queued(&mut st, Outbound, Elevated);
    let normal = queued(&mut st, Outbound, Normal);

    assert_eq!(release(&mut st, Outbound, Normal), vec![elevated]);
    assert_eq!(release(&mut st, Outbound, Normal), vec![normal]);
}

#[test]
fn cell_queues_are_fifo() {
    let mut st = state(1);
    admitted(&mut st, Outbound, Normal);
    let a = queued(&mut st, Inbound, Normal);
    let b = queued(&mut st, Inbound, Normal);
    let c = queued(&mut st, Inbound, Normal);
    assert_eq!(st.queued(Inbound, Normal).collect::<Vec<_>>(), vec![a, b, c]);

    assert_eq!(release(&mut st, Outbound, Normal), vec![a]);
    assert_eq!(release(&mut st, Inbound, Normal), vec![b]);
    assert_eq!(release(&mut st, Inbound, Normal), vec![c]);
}

#[test]
fn normal_waiter_gets_in_within_one_elevated_cycle() {
    let mut st = state(1);
    admitted(&mut st, Outbound, Elevated);
    let inbound = queued(&mut st, Inbound, Normal);
    let next = queued(&mut st, Outbound, Elevated);

    // First turnaround: the elevated stream keeps the bus once.
    assert_eq!(release(&mut st, Outbound, Elevated), vec![next]);
    let later = queued(&mut st, Outbound, Elevated);

    // Second turnaround goes to the waiting normal task.
    assert_eq!(release(&mut st, Outbound, Elevated), vec![inbound]);
    assert_eq!(st.current_direction(), Some(Inbound));

    assert_eq!(release(&mut st, Inbound, Normal), vec![later]);
    release(&mut st, Outbound, Elevated);
    assert!(st.is_idle());
}

#[test]
fn overlapping_elevated_stream_yields_to_waiting_normal() {
    let cfg = ArbiterCfg {
        capacity: 3,
        yield_to_opposite: true,
        ..ArbiterCfg::default()
    };
    let mut st = ArbiterState::new(cfg).unwrap();
    for _ in 0..3 {
        admitted(&mut st, Outbound, Elevated);
    }
    let inbound = queued(&mut st, Inbound, Normal);
    let overflow = queued(&mut st, Outbound, Elevated);

    // No refill while the other side waits.
    assert!(release(&mut st, Outbound, Elevated).is_empty());
    assert!(release(&mut st, Outbound, Elevated).is_empty());
    assert_eq!(release(&mut st, Outbound, Elevated), vec![overflow]);

    // New arrivals queue instead of joining the running batch.
    let arrival = queued(&mut st, Outbound, Elevated);
    assert_eq!(release(&mut st, Outbound, Elevated), vec![inbound]);
    assert_eq!(release(&mut st, Inbound, Normal), vec![arrival]);
    release(&mut st, Outbound, Elevated);
    assert!(st.is_idle());
}

#[test]
fn elevated_streak_limit_zero_is_strict_alternation() {
    let cfg = ArbiterCfg {
        capacity: 1,
        elevated_streak_limit: 0,
        ..ArbiterCfg::default()
    };
    let mut st = ArbiterState::new(cfg).unwrap();
    admitted(&mut st, Outbound, Elevated);
    let inbound = queued(&mut st, Inbound, Normal);
    queued(&mut st, Outbound, Elevated);

    assert_eq!(release(&mut st, Outbound, Elevated), vec![inbound]);
}

#[test]
fn contested_elevated_directions_alternate() {
    let mut st = state(1);
    admitted(&mut st, Outbound, Elevated);
    let in1 = queued(&mut st, Inbound, Elevated);
    let out1 = queued(&mut st, Outbound, Elevated);
    let in2 = queued(&mut st, Inbound, Elevated);
    let out2 = queued(&mut st, Outbound, Elevated);

    assert_eq!(release(&mut st, Outbound, Elevated), vec![in1]);
    assert_eq!(release(&mut st, Inbound, Elevated), vec![out1]);
    assert_eq!(release(&mut st, Outbound, Elevated), vec![in2]);
    assert_eq!(release(&mut st, Inbound, Elevated), vec![out2]);
    assert_eq!(st.stats().direction_switches, 4);
}

#[test]
fn elevated_waiter_is_never_passed_over_twice() {
    let mut st = state(1);
    admitted(&mut st, Inbound, Normal);
    let out1 = queued(&mut st, Outbound, Elevated);
    let inbound = queued(&mut st, Inbound, Elevated);

    // Both sides elevated: alternation hands the bus to outbound once.
    assert_eq!(release(&mut st, Inbound, Normal), vec![out1]);
    let out2 = queued(&mut st, Outbound, Elevated);

    // Outbound may not win again while inbound elevated still waits.
    assert_eq!(release(&mut st, Outbound, Elevated), vec![inbound]);
    assert_eq!(next_direction(&st), Some((Outbound, ChoiceReason::OnlyWaiting)));
    assert_eq!(release(&mut st, Inbound, Elevated), vec![out2]);
}

#[test]
fn elevated_side_wins_turnaround_over_normal_side() {
    let mut st = state(1);
    admitted(&mut st, Outbound, Normal);
    queued(&mut st, Outbound, Normal);
    let inbound = queued(&mut st, Inbound, Elevated);

    assert_eq!(next_direction(&st), Some((Inbound, ChoiceReason::Elevated)));
    assert_eq!(release(&mut st, Outbound, Normal), vec![inbound]);
}

#[test]
fn oldest_first_breaks_ties_by_arrival() {
    let cfg = ArbiterCfg {
        capacity: 1,
        fairness: FairnessPolicy::OldestFirst,
        ..ArbiterCfg::default()
    };
    let mut st = ArbiterState::new(cfg).unwrap();
    admitted(&mut st, Outbound, Normal);
    let out = queued(&mut st, Outbound, Normal);
    let inb = queued(&mut st, Inbound, Normal);

    assert_eq!(release(&mut st, Outbound, Normal), vec![out]);
    assert_eq!(release(&mut st, Outbound, Normal), vec![inb]);
}

#[test]
fn alternation_breaks_the_same_tie_the_other_way() {
    let mut st = state(1);
    admitted(&mut st, Outbound, Normal);
    let out = queued(&mut st, Outbound, Normal);
    let inb = queued(&mut st, Inbound, Normal);

    assert_eq!(release(&mut st, Outbound, Normal), vec![inb]);
    assert_eq!(release(&mut st, Inbound, Normal), vec![out]);
}

#[test]
fn yield_to_opposite_drains_the_bus() {
    let cfg = ArbiterCfg {
        capacity: 3,
        yield_to_opposite: true,
        ..ArbiterCfg::default()
    };
    let mut st = ArbiterState::new(cfg).unwrap();
    admitted(&mut st, Outbound, Normal);
    let inbound = queued(&mut st, Inbound, Normal);
    // Room is left, but the other side is waiting.
    let late = queued(&mut st, Outbound, Normal);

    assert_eq!(release(&mut st, Outbound, Normal), vec![inbound]);
    assert_eq!(release(&mut st, Inbound, Normal), vec![late]);
}

#[test]
fn withdrawing_the_blocker_lets_same_direction_in() {
    let cfg = ArbiterCfg {
        capacity: 3,
        yield_to_opposite: true,
        ..ArbiterCfg::default()
    };
    let mut st = ArbiterState::new(cfg).unwrap();
    admitted(&mut st, Outbound, Normal);
    let inbound = queued(&mut st, Inbound, Normal);
    let late = queued(&mut st, Outbound, Normal);

    assert_eq!(st.withdraw(inbound), Withdrawal::Removed { woken: vec![late] });
    assert!(st.take_grant(late));
    assert_eq!(st.active_count(), 2);
    assert_eq!(st.stats().withdrawn, 1);
    st.check_invariants().unwrap();
}

#[test]
fn withdraw_after_admission_reports_the_grant() {
    let mut st = state(1);
    admitted(&mut st, Outbound, Normal);
    let t = queued(&mut st, Outbound, Normal);
    st.release(Outbound, Normal).unwrap();

    assert_eq!(st.withdraw(t), Withdrawal::AlreadyAdmitted);
    assert!(st.take_grant(t));
    assert_eq!(st.withdraw(t), Withdrawal::Unknown);
}

#[test]
fn double_release_is_rejected_without_side_effects() {
    let mut st = state(3);
    admitted(&mut st, Outbound, Normal);
    release(&mut st, Outbound, Normal);

    let before = st.snapshot();
    assert_eq!(
        st.release(Outbound, Normal),
        Err(ArbiterError::UnmatchedRelease {
            direction: Outbound,
            priority: Normal
        })
    );
    let after = st.snapshot();
    assert_eq!(after.active_count, 0);
    assert_eq!(after.held, before.held);
    assert_eq!(after.stats.rejected_releases, 1);
}

#[test]
fn second_release_of_a_ticket_is_rejected_while_its_class_is_still_held() {
    let mut st = state(3);
    let a = admitted(&mut st, Outbound, Normal);
    let b = admitted(&mut st, Outbound, Normal);
    let inbound = queued(&mut st, Inbound, Normal);

    assert!(st.release_ticket(a).unwrap().is_empty());
    let before = st.snapshot();
    assert_eq!(st.release_ticket(a), Err(ArbiterError::StaleTicket { ticket: a }));

    let after = st.snapshot();
    assert_eq!(after.active_count, 1);
    assert_eq!(after.current_direction, Some(Outbound));
    assert_eq!(after.held, before.held);
    assert_eq!(after.stats.rejected_releases, 1);
    assert!(st.holds_slot(b));
    st.check_invariants().unwrap();

    // The real holder still gets its release, and that one turns the bus.
    assert_eq!(st.release_ticket(b).unwrap(), vec![inbound]);
    assert!(!st.holds_slot(b));
    st.check_invariants().unwrap();
}

#[test]
fn class_release_gives_up_the_oldest_holder() {
    let mut st = state(3);
    let a = admitted(&mut st, Outbound, Normal);
    let b = admitted(&mut st, Outbound, Normal);
    release(&mut st, Outbound, Normal);
    assert!(!st.holds_slot(a));
    assert!(st.holds_slot(b));
    assert_eq!(st.release_ticket(a), Err(ArbiterError::StaleTicket { ticket: a }));
    assert!(st.release_ticket(b).unwrap().is_empty());
}

#[test]
fn release_with_wrong_class_is_rejected() {
    let mut st = state(3);
    admitted(&mut st, Outbound, Normal);
    assert!(st.release(Outbound, Elevated).is_err());
    assert!(st.release(Inbound, Normal).is_err());
    assert_eq!(st.active_count(), 1);
    release(&mut st, Outbound, Normal);
}

#[test]
fn idle_bus_has_no_direction_and_admits_anyone() {
    let mut st = state(2);
    assert_eq!(st.current_direction(), None);
    admitted(&mut st, Outbound, Normal);
    release(&mut st, Outbound, Normal);
    assert_eq!(st.current_direction(), None);
    assert_eq!(st.last_served_direction(), Some(Outbound));

    admitted(&mut st, Inbound, Normal);
    assert_eq!(st.current_direction(), Some(Inbound));
    release(&mut st, Inbound, Normal);
    assert!(st.is_idle());
}

#[test]
fn try_request_never_queues() {
    let mut st = state(1);
    assert!(st.try_request(Outbound, Normal).is_some());
    assert!(st.try_request(Outbound, Elevated).is_none());
    assert!(st.try_request(Inbound, Normal).is_none());
    assert_eq!(st.total_waiting(), 0);
    release(&mut st, Outbound, Normal);
}

#[test]
fn zero_capacity_is_a_configuration_fault() {
    assert_eq!(
        ArbiterState::new(ArbiterCfg::with_capacity(0)).unwrap_err(),
        ArbiterError::InvalidCapacity { capacity: 0 }
    );
}

#[test]
fn snapshot_counts_cells_and_cycles() {
    let mut st = state(2);
    admitted(&mut st, Outbound, Elevated);
    admitted(&mut st, Outbound, Normal);
    queued(&mut st, Inbound, Normal);
    queued(&mut st, Inbound, Elevated);

    let snap = st.snapshot();
    assert_eq!(snap.held.outbound_elevated, 1);
    assert_eq!(snap.held.outbound_normal, 1);
    assert_eq!(snap.waiting.get(Inbound, Elevated), 1);
    assert_eq!(snap.waiting.total(), 2);
    assert_eq!(snap.stats.cycles, 1);
    assert!(!snap.is_idle());

    release(&mut st, Outbound, Elevated);
    release(&mut st, Outbound, Normal);
    release(&mut st, Inbound, Elevated);
    release(&mut st, Inbound, Normal);
    let snap = st.snapshot();
    assert!(snap.is_idle());
    assert_eq!(snap.stats.cycles, 2);
    assert_eq!(snap.stats.queued_admissions, 2);
    assert_eq!(snap.stats.immediate_admissions, 2);
}

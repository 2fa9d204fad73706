//! Batch driver.
//!
//! Starts one named OS thread per task of a [`WorkloadCfg`], lets every task
//! run acquire / transfer / release against one shared [`BusArbiter`], and
//! collects what happened into a [`RunReport`].
//!
//! An [`OccupancyMonitor`] watches the bus from the tasks' side. A task
//! records `Enter` after its admission and `Exit` before its release, so the
//! monitor never sees more tasks inside than the arbiter has admitted.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use bus_arbiter_core::{ArbiterError, ArbiterSnapshot, BusArbiter, Direction, Priority};

use crate::error::DriverError;
use crate::workload::{Task, TransferModel, WorkloadCfg};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Enter,
    Exit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub kind: TraceKind,
    pub task: usize,
    pub direction: Direction,
    pub priority: Priority,
    /// Tasks inside the bus right after this event.
    pub inside: usize,
    /// Microseconds since the batch started.
    pub at_micros: u64,
}

#[derive(Debug, Default)]
struct Occupancy {
    direction: Option<Direction>,
    inside: usize,
    peak: usize,
    capacity_violations: usize,
    direction_violations: usize,
    trace: Vec<TraceEvent>,
}

/// Outside check of the capacity and direction invariants.
#[derive(Debug)]
pub struct OccupancyMonitor {
    capacity: usize,
    started: Instant,
    inner: Mutex<Occupancy>,
}

/// What an [`OccupancyMonitor`] saw over a whole run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    pub peak: usize,
    pub capacity_violations: usize,
    pub direction_violations: usize,
    pub trace: Vec<TraceEvent>,
}

impl OccupancyMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            started: Instant::now(),
            inner: Mutex::new(Occupancy::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Occupancy> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn at_micros(&self) -> u64 {
        self.started.elapsed().as_micros().min(u64::MAX as u128) as u64
    }

    pub fn enter(&self, task: &Task) {
        let at_micros = self.at_micros();
        let mut occ = self.lock();

        if occ.inside >= self.capacity {
            occ.capacity_violations += 1;
            tracing::error!(task = task.id, inside = occ.inside, "bus over capacity");
        }
        if occ.inside > 0 && occ.direction != Some(task.direction) {
            occ.direction_violations += 1;
            tracing::error!(task = task.id, direction = %task.direction, "bus shared by both directions");
        }

        occ.inside += 1;
        occ.peak = occ.peak.max(occ.inside);
        occ.direction = Some(task.direction);
        let inside = occ.inside;
        occ.trace.push(TraceEvent {
            kind: TraceKind::Enter,
            task: task.id,
            direction: task.direction,
            priority: task.priority,
            inside,
            at_micros,
        });
    }

    pub fn exit(&self, task: &Task) {
        let at_micros = self.at_micros();
        let mut occ = self.lock();
        occ.inside = occ.inside.saturating_sub(1);
        if occ.inside == 0 {
            occ.direction = None;
        }
        let inside = occ.inside;
        occ.trace.push(TraceEvent {
            kind: TraceKind::Exit,
            task: task.id,
            direction: task.direction,
            priority: task.priority,
            inside,
            at_micros,
        });
    }

    pub fn observed(&self) -> Observed {
        let occ = self.lock();
        Observed {
            peak: occ.peak,
            capacity_violations: occ.capacity_violations,
            direction_violations: occ.direction_violations,
            trace: occ.trace.clone(),
        }
    }
}

/// Summary of one batch run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub tasks: usize,
    /// Task ids in the order they entered the bus.
    pub admission_order: Vec<usize>,
    /// `waited[id]` is true if task `id` had to queue.
    pub waited: Vec<bool>,
    pub peak_concurrency: usize,
    pub capacity_violations: usize,
    pub direction_violations: usize,
    pub elapsed: Duration,
    pub trace: Vec<TraceEvent>,
    pub arbiter: ArbiterSnapshot,
}

impl RunReport {
    pub fn violations(&self) -> usize {
        self.capacity_violations + self.direction_violations
    }

    pub fn is_clean(&self) -> bool {
        self.violations() == 0 && self.admission_order.len() == self.tasks && self.arbiter.is_idle()
    }
}

/// Runs a whole batch to completion.
#[derive(Debug, Default)]
pub struct BatchScheduler;

impl BatchScheduler {
    pub fn run(workload: &WorkloadCfg, model: &dyn TransferModel) -> Result<RunReport, DriverError> {
        let arbiter = BusArbiter::new(workload.arbiter_cfg())?;
        let tasks = workload.tasks();
        let monitor = OccupancyMonitor::new(workload.capacity);

        tracing::info!(
            capacity = workload.capacity,
            outbound_normal = workload.outbound_normal,
            inbound_normal = workload.inbound_normal,
            outbound_elevated = workload.outbound_elevated,
            inbound_elevated = workload.inbound_elevated,
            seed = workload.seed,
            "batch starting"
        );

        // Durations are drawn up front so the model need not be shared.
        let plan: Vec<(Task, Duration)> = tasks
            .into_iter()
            .map(|t| {
                let d = model.duration(&t);
                (t, d)
            })
            .collect();

        let started = Instant::now();
        let outcomes = thread::scope(|scope| -> Result<Vec<(String, Result<bool, ArbiterError>)>, DriverError> {
            let mut handles = Vec::with_capacity(plan.len());
            for (task, transfer) in &plan {
                let name = task.thread_name();
                let (arbiter, monitor) = (&arbiter, &monitor);
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(scope, move || run_task(arbiter, monitor, task, *transfer))
                    .map_err(|source| DriverError::Spawn {
                        name: name.clone(),
                        source,
                    })?;
                handles.push((name, handle));
            }

            let mut outcomes = Vec::with_capacity(handles.len());
            for (name, handle) in handles {
                match handle.join() {
                    Ok(res) => outcomes.push((name, res)),
                    Err(_) => return Err(DriverError::TaskPanicked { name }),
                }
            }
            Ok(outcomes)
        })?;
        let elapsed = started.elapsed();

        let mut waited = Vec::with_capacity(outcomes.len());
        for (name, res) in outcomes {
            match res {
                Ok(w) => waited.push(w),
                Err(e) => {
                    tracing::error!(task = %name, error = %e, "task failed");
                    return Err(e.into());
                }
            }
        }

        let observed = monitor.observed();
        let admission_order = observed
            .trace
            .iter()
            .filter(|e| e.kind == TraceKind::Enter)
            .map(|e| e.task)
            .collect();

        let report = RunReport {
            tasks: plan.len(),
            admission_order,
            waited,
            peak_concurrency: observed.peak,
            capacity_violations: observed.capacity_violations,
            direction_violations: observed.direction_violations,
            elapsed,
            trace: observed.trace,
            arbiter: arbiter.snapshot()?,
        };

        tracing::info!(
            tasks = report.tasks,
            peak = report.peak_concurrency,
            cycles = report.arbiter.stats.cycles,
            switches = report.arbiter.stats.direction_switches,
            violations = report.violations(),
            elapsed_ms = elapsed.as_millis() as u64,
            "batch finished"
        );
        Ok(report)
    }
}

fn run_task(
    arbiter: &BusArbiter,
    monitor: &OccupancyMonitor,
    task: &Task,
    transfer: Duration,
) -> Result<bool, ArbiterError> {
    tracing::debug!(task = task.id, name = task.name, "requesting bus");
    let admission = arbiter.acquire(task.direction, task.priority)?;
    let waited = admission.waited();

    monitor.enter(task);
    tracing::debug!(task = task.id, ticket = %admission.ticket(), waited, ?transfer, "transferring");
    thread::sleep(transfer);
    monitor.exit(task);

    arbiter.release_admission(admission)?;
    tracing::debug!(task = task.id, "released bus");
    Ok(waited)
}

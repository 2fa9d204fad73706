//! Task populations and transfer timing for the batch driver.
//!
//! A [`WorkloadCfg`] says how many tasks of each (direction, priority) class to
//! start; [`TransferModel`] says how long each one keeps its slot. Neither
//! knows anything about the arbiter's internals.

use std::path::Path;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use bus_arbiter_core::{ArbiterCfg, Direction, Priority, DEFAULT_CAPACITY};

use crate::error::DriverError;

/// Seed used when none is given, so two runs of the same workload match.
pub const DEFAULT_SEED: u64 = 123_456_789;

/// One batch of tasks sharing a bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadCfg {
    pub capacity: usize,
    pub outbound_normal: usize,
    pub inbound_normal: usize,
    pub outbound_elevated: usize,
    pub inbound_elevated: usize,
    pub seed: u64,
    /// Upper bound (exclusive) of a random transfer, in ticks.
    pub max_ticks: u64,
    pub tick_micros: u64,
    /// Fairness settings. `capacity` above always wins over the one in here.
    pub arbiter: Option<ArbiterCfg>,
}

impl Default for WorkloadCfg {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            outbound_normal: 0,
            inbound_normal: 0,
            outbound_elevated: 0,
            inbound_elevated: 0,
            seed: DEFAULT_SEED,
            max_ticks: 10,
            tick_micros: 1000,
            arbiter: None,
        }
    }
}

/// A single task of a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Task {
    /// Position in the batch; also the spawn order.
    pub id: usize,
    pub name: &'static str,
    pub direction: Direction,
    pub priority: Priority,
}

impl Task {
    /// Thread name, unique within a batch.
    pub fn thread_name(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }
}

fn class_name(direction: Direction, priority: Priority) -> &'static str {
    match (direction, priority) {
        (Direction::Outbound, Priority::Normal) => "sender_task",
        (Direction::Inbound, Priority::Normal) => "receiver_task",
        (Direction::Outbound, Priority::Elevated) => "prio_sender_task",
        (Direction::Inbound, Priority::Elevated) => "prio_receiver_task",
    }
}

impl WorkloadCfg {
    pub fn from_json_str(s: &str) -> Result<Self, DriverError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DriverError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// The arbiter configuration this workload runs under.
    pub fn arbiter_cfg(&self) -> ArbiterCfg {
        ArbiterCfg {
            capacity: self.capacity,
            ..self.arbiter.clone().unwrap_or_default()
        }
    }

    pub fn task_count(&self) -> usize {
        self.outbound_normal + self.inbound_normal + self.outbound_elevated + self.inbound_elevated
    }

    /// Expand the counts into tasks: every outbound-normal task first, then
    /// inbound-normal, outbound-elevated and inbound-elevated.
    pub fn tasks(&self) -> Vec<Task> {
        let batches = [
            (Direction::Outbound, Priority::Normal, self.outbound_normal),
            (Direction::Inbound, Priority::Normal, self.inbound_normal),
            (Direction::Outbound, Priority::Elevated, self.outbound_elevated),
            (Direction::Inbound, Priority::Elevated, self.inbound_elevated),
        ];

        let mut out = Vec::with_capacity(self.task_count());
        for (direction, priority, count) in batches {
            for _ in 0..count {
                out.push(Task {
                    id: out.len(),
                    name: class_name(direction, priority),
                    direction,
                    priority,
                });
            }
        }
        out
    }

    /// Random transfer timing seeded from this workload.
    pub fn random_ticks(&self) -> RandomTicks {
        RandomTicks {
            seed: self.seed,
            max_ticks: self.max_ticks,
            tick: Duration::from_micros(self.tick_micros),
        }
    }
}

/// How long a task holds its slot.
pub trait TransferModel {
    fn duration(&self, task: &Task) -> Duration;
}

/// Uniform random number of ticks in `0..max_ticks`.
///
/// Each task draws from its own generator, seeded from the batch seed and the
/// task id, so a task's duration does not depend on thread start order.
#[derive(Clone, Debug)]
pub struct RandomTicks {
    pub seed: u64,
    pub max_ticks: u64,
    pub tick: Duration,
}

impl TransferModel for RandomTicks {
    fn duration(&self, task: &Task) -> Duration {
        if self.max_ticks == 0 {
            return Duration::ZERO;
        }
        let mix = (task.id as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = StdRng::seed_from_u64(self.seed ^ mix);
        let ticks = rng.random_range(0..self.max_ticks);
        self.tick.saturating_mul(ticks.min(u32::MAX as u64) as u32)
    }
}

/// Every task holds its slot for the same time.
#[derive(Clone, Copy, Debug)]
pub struct FixedDuration(pub Duration);

impl TransferModel for FixedDuration {
    fn duration(&self, _task: &Task) -> Duration {
        self.0
    }
}

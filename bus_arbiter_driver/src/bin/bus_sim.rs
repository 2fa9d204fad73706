use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use bus_arbiter_core::FairnessPolicy;
use bus_arbiter_driver::{BatchScheduler, RunReport, WorkloadCfg};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Fairness {
    /// Serve the direction other than the one served last
    Alternate,
    /// Serve the direction whose oldest waiter arrived first
    OldestFirst,
}

impl From<Fairness> for FairnessPolicy {
    fn from(f: Fairness) -> Self {
        match f {
            Fairness::Alternate => FairnessPolicy::Alternate,
            Fairness::OldestFirst => FairnessPolicy::OldestFirst,
        }
    }
}

/// Run a batch of bus tasks and report how the arbiter scheduled them.
#[derive(Parser, Debug)]
#[clap(name = "bus-sim")]
struct Args {
    /// Outbound tasks at normal priority
    #[clap(long)]
    outbound_normal: Option<usize>,

    /// Inbound tasks at normal priority
    #[clap(long)]
    inbound_normal: Option<usize>,

    /// Outbound tasks at elevated priority
    #[clap(long)]
    outbound_elevated: Option<usize>,

    /// Inbound tasks at elevated priority
    #[clap(long)]
    inbound_elevated: Option<usize>,

    /// Slots on the bus
    #[clap(long)]
    capacity: Option<usize>,

    /// Seed for transfer durations
    #[clap(long)]
    seed: Option<u64>,

    /// Transfers last a random number of ticks below this
    #[clap(long)]
    max_ticks: Option<u64>,

    /// Length of one tick in microseconds
    #[clap(long)]
    tick_micros: Option<u64>,

    /// Direction choice when an idle bus has waiters on both sides
    #[clap(long, value_enum)]
    fairness: Option<Fairness>,

    /// Drain the bus as soon as the other direction is waiting
    #[clap(long, default_value_t = false)]
    yield_to_opposite: bool,

    /// JSON workload file; flags override its fields
    #[clap(long)]
    config: Option<PathBuf>,

    /// Print the full report as JSON
    #[clap(long, default_value_t = false)]
    json: bool,
}

impl Args {
    fn workload(&self) -> Result<WorkloadCfg> {
        let mut w = match &self.config {
            Some(path) => WorkloadCfg::from_json_file(path)
                .with_context(|| format!("loading workload from {}", path.display()))?,
            None => WorkloadCfg::default(),
        };

        if let Some(n) = self.outbound_normal {
            w.outbound_normal = n;
        }
        if let Some(n) = self.inbound_normal {
            w.inbound_normal = n;
        }
        if let Some(n) = self.outbound_elevated {
            w.outbound_elevated = n;
        }
        if let Some(n) = self.inbound_elevated {
            w.inbound_elevated = n;
        }
        if let Some(seed) = self.seed {
            w.seed = seed;
        }
        if let Some(t) = self.max_ticks {
            w.max_ticks = t;
        }
        if let Some(t) = self.tick_micros {
            w.tick_micros = t;
        }

        // Precedence: flags, then environment, then the file.
        let mut arbiter = w.arbiter_cfg().with_env_overrides();
        if let Some(c) = self.capacity {
            arbiter.capacity = c;
        }
        if let Some(f) = self.fairness {
            arbiter.fairness = f.into();
        }
        if self.yield_to_opposite {
            arbiter.yield_to_opposite = true;
        }
        w.capacity = arbiter.capacity;
        w.arbiter = Some(arbiter);
        Ok(w)
    }
}

fn print_summary(report: &RunReport) {
    let stats = &report.arbiter.stats;
    println!("tasks:              {}", report.tasks);
    println!("elapsed:            {:?}", report.elapsed);
    println!("peak concurrency:   {}", report.peak_concurrency);
    println!(
        "admitted:           {} ({} immediately, {} after waiting)",
        stats.admissions, stats.immediate_admissions, stats.queued_admissions
    );
    println!(
        "by class:           outbound {} / inbound {}, elevated {} / normal {}",
        stats.outbound_admissions, stats.inbound_admissions, stats.elevated_admissions, stats.normal_admissions
    );
    println!(
        "cycles:             {} ({} direction switches)",
        stats.cycles, stats.direction_switches
    );
    println!(
        "violations:         {} capacity, {} direction",
        report.capacity_violations, report.direction_violations
    );
    println!("admission order:    {:?}", report.admission_order);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let workload = args.workload()?;
    if workload.task_count() == 0 {
        tracing::warn!("workload has no tasks");
    }

    let model = workload.random_ticks();
    let report = BatchScheduler::run(&workload, &model).context("batch run failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if !report.is_clean() {
        bail!("run finished with {} monitor violations", report.violations());
    }
    Ok(())
}

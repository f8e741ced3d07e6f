//! Simulate command: a thundering herd of callers against a coalescer.
//!
//! Every wave lines up `callers` threads (or tokio tasks) behind a gate
//! and releases them at once onto `keys` distinct keys. Each work invocation
//! sleeps for `work_ms`, so callers arriving while it runs are coalesced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::io;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::Args;
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use oxflight::{
    AsyncCoalescer, Coalescer, CoalescerConfig, CoalescerStatsSnapshot, Execution, Role, WaitError,
};
use serde::Serialize;
use tracing::{debug, info, instrument};

#[derive(Args, Clone, Debug)]
pub struct SimulateArgs {
    /// Concurrent callers per wave
    #[arg(short, long, default_value_t = 64, env = "OXFLIGHT_CALLERS",
          value_parser = clap::value_parser!(u32).range(1..))]
    pub callers: u32,

    /// Number of distinct keys the callers are spread across
    #[arg(short, long, default_value_t = 4, env = "OXFLIGHT_KEYS",
          value_parser = clap::value_parser!(u32).range(1..))]
    pub keys: u32,

    /// Number of waves to run back to back
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub waves: u32,

    /// Duration of each work invocation in milliseconds
    #[arg(long, default_value_t = 50, env = "OXFLIGHT_WORK_MS")]
    pub work_ms: u64,

    /// Make every Nth work invocation return an error
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub fail_every: Option<u64>,

    /// Joiners give up after waiting this many milliseconds
    #[arg(long, value_name = "MS")]
    pub join_timeout_ms: Option<u64>,

    /// Where callers run
    #[arg(long, value_enum, default_value = "threads")]
    pub runtime: Runtime,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// One OS thread per caller, blocking coalescer
    #[default]
    Threads,
    /// One tokio task per caller, async coalescer
    Tokio,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Error produced by a failing work invocation.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("simulated failure loading {key} (invocation {invocation})")]
pub struct SimulatedFailure {
    pub key: String,
    pub invocation: u64,
}

type Loaded = Result<String, Arc<SimulatedFailure>>;
type CallOutcome = Result<Execution<String, Arc<SimulatedFailure>>, WaitError>;

/// The expensive operation being coalesced.
struct Workload {
    invocations: AtomicU64,
    work: Duration,
    fail_every: Option<u64>,
}

impl Workload {
    fn new(args: &SimulateArgs) -> Self {
        Self {
            invocations: AtomicU64::new(0),
            work: Duration::from_millis(args.work_ms),
            fail_every: args.fail_every,
        }
    }

    fn begin(&self) -> u64 {
        self.invocations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn finish(&self, key: &str, invocation: u64) -> Loaded {
        if self.fail_every.is_some_and(|n| invocation % n == 0) {
            Err(Arc::new(SimulatedFailure {
                key: key.to_string(),
                invocation,
            }))
        } else {
            Ok(format!("{key}@{invocation}"))
        }
    }

    fn load(&self, key: &str) -> Loaded {
        let invocation = self.begin();
        thread::sleep(self.work);
        self.finish(key, invocation)
    }

    async fn load_async(&self, key: &str) -> Loaded {
        let invocation = self.begin();
        tokio::time::sleep(self.work).await;
        self.finish(key, invocation)
    }

    fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

fn key_for(caller: u32, keys: u32) -> String {
    format!("key-{}", caller % keys)
}

/// Outcome of a simulation run.
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub runtime: Runtime,
    pub requests: u64,
    pub invocations: u64,
    pub owners: u64,
    pub joiners: u64,
    /// Owners whose result reached at least one joiner.
    pub shared_flights: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub elapsed_ms: u64,
    pub coalescer: CoalescerStatsSnapshot,
}

impl Report {
    fn record(&mut self, outcome: &CallOutcome) {
        self.requests += 1;
        match outcome {
            Ok(execution) => {
                match execution.role {
                    Role::Owner => {
                        self.owners += 1;
                        if execution.shared {
                            self.shared_flights += 1;
                        }
                    }
                    Role::Joiner => self.joiners += 1,
                }
                if execution.result.is_err() {
                    self.failures += 1;
                }
            }
            Err(WaitError::Timeout { .. }) => self.timeouts += 1,
        }
    }

    /// Work invocations avoided by coalescing.
    pub fn saved_invocations(&self) -> u64 {
        self.requests.saturating_sub(self.invocations)
    }
}

#[instrument(level = "info", name = "cmd::simulate", skip_all)]
pub fn run(args: &SimulateArgs) -> Result<()> {
    let report = simulate(args)?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&report),
    }

    Ok(())
}

/// Run the configured herd and collect the report.
pub fn simulate(args: &SimulateArgs) -> Result<Report> {
    let workload = Arc::new(Workload::new(args));
    let config = CoalescerConfig::default()
        .with_name("simulate")
        .with_initial_capacity(args.keys as usize);

    let started = Instant::now();
    let mut report = match args.runtime {
        Runtime::Threads => run_threads(args, &workload, config)?,
        Runtime::Tokio => run_tokio(args, &workload, config)?,
    };
    report.runtime = args.runtime;
    report.invocations = workload.invocations();
    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    info!(
        requests = report.requests,
        invocations = report.invocations,
        elapsed_ms = report.elapsed_ms,
        "simulation finished"
    );
    Ok(report)
}

fn run_threads(args: &SimulateArgs, workload: &Arc<Workload>, config: CoalescerConfig) -> Result<Report> {
    let sf: Arc<Coalescer<String, String, Arc<SimulatedFailure>>> =
        Arc::new(Coalescer::with_config(config));
    let join_timeout = args.join_timeout_ms.map(Duration::from_millis);
    let mut report = Report::default();

    for wave in 0..args.waves {
        let handles = spawn_herd(args.callers, |caller, gate| {
            let sf = Arc::clone(&sf);
            let workload = Arc::clone(workload);
            let key = key_for(caller, args.keys);
            thread::Builder::new()
                .name(format!("caller-{caller}"))
                .spawn(move || -> CallOutcome {
                    drop(gate.read());
                    let work = || workload.load(&key);
                    match join_timeout {
                        Some(timeout) => sf.execute_timeout(key.clone(), timeout, work),
                        None => Ok(sf.execute_shared(key.clone(), work)),
                    }
                })
        })?;

        for handle in handles {
            let outcome = handle.join().map_err(|_| anyhow!("caller thread panicked"))?;
            report.record(&outcome);
        }
        debug!(wave, in_flight = sf.in_flight_count(), "wave finished");
    }

    report.coalescer = sf.stats().snapshot();
    Ok(report)
}

/// Spawn one thread per caller, all held at a start gate until every
/// spawn succeeded.
///
/// The gate opens when this returns, on error too, so callers spawned
/// before a failed spawn still run to completion.
fn spawn_herd<T, S>(callers: u32, mut spawn: S) -> Result<Vec<JoinHandle<T>>>
where
    S: FnMut(u32, Arc<RwLock<()>>) -> io::Result<JoinHandle<T>>,
{
    let gate = Arc::new(RwLock::new(()));
    let held = gate.write().map_err(|_| anyhow!("start gate poisoned"))?;
    let handles = (0..callers)
        .map(|caller| spawn(caller, Arc::clone(&gate)).context("failed to spawn caller thread"))
        .collect::<Result<Vec<_>>>()?;
    drop(held);
    Ok(handles)
}

fn run_tokio(args: &SimulateArgs, workload: &Arc<Workload>, config: CoalescerConfig) -> Result<Report> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .context("failed to start tokio runtime")?;
    let sf: Arc<AsyncCoalescer<String, String, Arc<SimulatedFailure>>> =
        Arc::new(AsyncCoalescer::with_config(config));
    let join_timeout = args.join_timeout_ms.map(Duration::from_millis);
    let mut report = Report::default();

    runtime.block_on(async {
        for wave in 0..args.waves {
            let barrier = Arc::new(tokio::sync::Barrier::new(args.callers as usize));
            let tasks: Vec<_> = (0..args.callers)
                .map(|caller| {
                    let sf = Arc::clone(&sf);
                    let workload = Arc::clone(workload);
                    let barrier = Arc::clone(&barrier);
                    let key = key_for(caller, args.keys);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        let work = || workload.load_async(&key);
                        match join_timeout {
                            Some(timeout) => sf.execute_timeout(key.clone(), timeout, work).await,
                            None => Ok(sf.execute_shared(key.clone(), work).await),
                        }
                    })
                })
                .collect();

            for task in tasks {
                let outcome = task.await.context("caller task panicked")?;
                report.record(&outcome);
            }
            debug!(wave, in_flight = sf.in_flight_count(), "wave finished");
        }
        Ok::<_, anyhow::Error>(())
    })?;

    report.coalescer = sf.stats().snapshot();
    Ok(report)
}

fn print_report(report: &Report) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Metric", "Value"]);

    let runtime = match report.runtime {
        Runtime::Threads => "threads",
        Runtime::Tokio => "tokio",
    };
    table.add_row(vec!["Runtime".to_string(), runtime.to_string()]);
    table.add_row(vec!["Requests".to_string(), report.requests.to_string()]);
    table.add_row(vec!["Work invocations".to_string(), report.invocations.to_string()]);
    table.add_row(vec!["Saved invocations".to_string(), report.saved_invocations().to_string()]);
    table.add_row(vec!["Owners".to_string(), report.owners.to_string()]);
    table.add_row(vec!["Joiners".to_string(), report.joiners.to_string()]);
    table.add_row(vec!["Shared flights".to_string(), report.shared_flights.to_string()]);
    table.add_row(vec!["Failures".to_string(), report.failures.to_string()]);
    table.add_row(vec!["Timeouts".to_string(), report.timeouts.to_string()]);
    table.add_row(vec![
        "Dedup ratio".to_string(),
        format!("{:.1}%", report.coalescer.dedup_ratio() * 100.0),
    ]);
    table.add_row(vec!["Elapsed".to_string(), format!("{} ms", report.elapsed_ms)]);
    println!("{table}");
}

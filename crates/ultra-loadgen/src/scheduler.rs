// Numan Thabit 2025
//! Stage-driven virtual user scheduling.
//!
//! The target concurrency is a piecewise-linear function of elapsed time. On
//! every tick the scheduler grows or shrinks the active pool to match it.
//! Retired users finish their current iteration before exiting; only a run
//! level hard stop interrupts an iteration in flight.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use humantime::format_duration;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::telemetry::EngineMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    start: u32,
    stages: Vec<Stage>,
}

impl StagePlan {
    /// `start` is the level the first stage ramps from.
    pub fn new(start: u32, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn peak(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, u32::max)
    }

    /// Index of the stage running at `elapsed`, `None` once the plan is over.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        for (idx, stage) in self.stages.iter().enumerate() {
            end += stage.duration;
            if elapsed < end {
                return Some(idx);
            }
        }
        None
    }

    /// Linearly interpolated target at `elapsed`.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut from = f64::from(self.start);
        let mut begin = Duration::ZERO;
        for stage in &self.stages {
            let end = begin + stage.duration;
            let to = f64::from(stage.target);
            if elapsed < end {
                let progress = (elapsed - begin).as_secs_f64() / stage.duration.as_secs_f64();
                return from + (to - from) * progress;
            }
            from = to;
            begin = end;
        }
        from
    }

    /// Target rounded to nearest, ties toward more users.
    pub fn vus_at(&self, elapsed: Duration) -> u32 {
        (self.target_at(elapsed) + 0.5).floor().max(0.0) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    Aborted { reason: String },
}

/// One pass of the user workflow. Implementations must not panic.
pub trait IterationRunner: Send + Sync + 'static {
    fn run_iteration(&self, vu: u64, iteration: u64)
        -> impl Future<Output = IterationOutcome> + Send;

    /// Called when a hard stop drops an iteration mid-flight.
    fn on_interrupted(&self, _vu: u64) {}
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub plan: StagePlan,
    pub max_vus: u32,
    pub tick: Duration,
    pub graceful_stop: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSummary {
    pub elapsed: Duration,
    pub completed_iterations: u64,
    pub aborted_iterations: u64,
    pub per_vu_iterations: BTreeMap<u64, u64>,
    pub peak_vus: u32,
    pub interrupted: bool,
    pub forced_stop: bool,
    pub capped: bool,
}

#[derive(Debug, Default)]
pub struct RunCounters {
    completed: AtomicU64,
    aborted: AtomicU64,
    peak: AtomicU64,
}

impl RunCounters {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct PoolState {
    active: Vec<u64>,
    /// Retired users whose task is still finishing an iteration.
    draining: Vec<u64>,
    next_id: u64,
}

/// Virtual users with a live task. Every mutation and count happens under one
/// lock, and a user task only exits after the pool agrees it is retired, so
/// `active + draining` never exceeds the largest size ever requested.
#[derive(Default)]
pub struct VuPool {
    state: Mutex<PoolState>,
}

impl VuPool {
    pub fn active(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn draining(&self) -> usize {
        self.state.lock().draining.len()
    }

    pub fn active_ids(&self) -> Vec<u64> {
        self.state.lock().active.clone()
    }

    /// Grow or shrink to `desired`. Growth revives draining users before
    /// handing new ids to `launch`; the most recently started users are
    /// retired first.
    fn resize<F>(&self, desired: usize, mut launch: F) -> usize
    where
        F: FnMut(u64),
    {
        let mut state = self.state.lock();
        while state.active.len() < desired {
            let id = match state.draining.pop() {
                Some(id) => {
                    debug!(vu = id, "reviving draining virtual user");
                    id
                }
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    launch(id);
                    id
                }
            };
            state.active.push(id);
        }
        while state.active.len() > desired {
            if let Some(id) = state.active.pop() {
                debug!(vu = id, "retiring virtual user");
                state.draining.push(id);
            }
        }
        state.active.len()
    }

    /// Called by a user between iterations. Returns false once the user is
    /// retired, at which point it leaves the pool for good.
    fn keep_running(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        if state.active.contains(&id) {
            return true;
        }
        state.draining.retain(|vu| *vu != id);
        false
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        state.active.retain(|vu| *vu != id);
        state.draining.retain(|vu| *vu != id);
    }
}

pub struct StageScheduler<R: IterationRunner> {
    runner: Arc<R>,
    config: SchedulerConfig,
    pool: Arc<VuPool>,
    counters: Arc<RunCounters>,
    telemetry: Option<Arc<EngineMetrics>>,
}

impl<R: IterationRunner> StageScheduler<R> {
    pub fn new(runner: Arc<R>, config: SchedulerConfig) -> Self {
        Self {
            runner,
            config,
            pool: Arc::new(VuPool::default()),
            counters: Arc::new(RunCounters::default()),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<EngineMetrics>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn pool(&self) -> Arc<VuPool> {
        self.pool.clone()
    }

    pub fn counters(&self) -> Arc<RunCounters> {
        self.counters.clone()
    }

    /// Drive the plan to completion or until `cancel` fires, then drain.
    pub async fn run(&self, cancel: CancellationToken) -> ScheduleSummary {
        let plan = &self.config.plan;
        let total = plan.total_duration();
        let cap = self.config.max_vus;
        let hard_stop = CancellationToken::new();
        let mut tasks: JoinSet<(u64, u64)> = JoinSet::new();
        let mut per_vu = BTreeMap::new();

        info!(
            stages = plan.stages().len(),
            duration = %format_duration(total),
            peak_target = plan.peak(),
            max_vus = cap,
            "starting stage schedule"
        );

        let start = Instant::now();
        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current_stage = None;
        let mut capping = false;
        let mut capped = false;

        let interrupted = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                _ = ticker.tick() => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= total {
                break false;
            }

            let stage = plan.stage_index_at(elapsed);
            if stage != current_stage {
                if let Some(idx) = stage {
                    let spec = plan.stages()[idx];
                    info!(
                        stage = idx,
                        target_vus = spec.target,
                        duration = %format_duration(spec.duration),
                        "entering stage"
                    );
                }
                current_stage = stage;
            }

            let wanted = plan.vus_at(elapsed);
            if wanted > cap {
                if !capping {
                    warn!(
                        target_vus = wanted,
                        max_vus = cap,
                        "target concurrency exceeds max_vus; capping"
                    );
                    capping = true;
                    capped = true;
                }
            } else if capping {
                info!(target_vus = wanted, max_vus = cap, "target concurrency back under max_vus");
                capping = false;
            }

            let active = self.resize(wanted.min(cap) as usize, &mut tasks, &hard_stop);
            self.counters
                .peak
                .fetch_max(active as u64, Ordering::Relaxed);

            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut per_vu);
            }
        };

        if interrupted {
            warn!(elapsed = %format_duration(start.elapsed()), "run cancelled; stopping new iterations");
        }
        self.resize(0, &mut tasks, &hard_stop);

        let grace = self.config.graceful_stop;
        let drained = timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                collect(joined, &mut per_vu);
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                remaining = tasks.len(),
                grace = %format_duration(grace),
                "iterations still running after graceful stop; interrupting"
            );
            hard_stop.cancel();
            while let Some(joined) = tasks.join_next().await {
                collect(joined, &mut per_vu);
            }
        }

        let summary = ScheduleSummary {
            elapsed: start.elapsed(),
            completed_iterations: self.counters.completed(),
            aborted_iterations: self.counters.aborted(),
            per_vu_iterations: per_vu,
            peak_vus: self.counters.peak() as u32,
            interrupted,
            forced_stop: !drained,
            capped,
        };
        info!(
            elapsed = %format_duration(summary.elapsed),
            iterations = summary.completed_iterations,
            aborted = summary.aborted_iterations,
            peak_vus = summary.peak_vus,
            "stage schedule finished"
        );
        summary
    }

    fn resize(
        &self,
        desired: usize,
        tasks: &mut JoinSet<(u64, u64)>,
        hard_stop: &CancellationToken,
    ) -> usize {
        let active = self.pool.resize(desired, |id| {
            let runner = self.runner.clone();
            let pool = self.pool.clone();
            let counters = self.counters.clone();
            let telemetry = self.telemetry.clone();
            let hard_stop = hard_stop.clone();
            tasks.spawn(async move {
                let completed = vu_loop(runner, pool, id, hard_stop, counters, telemetry).await;
                (id, completed)
            });
        });
        if let Some(telemetry) = &self.telemetry {
            telemetry.set_active_vus(active);
        }
        active
    }
}

fn collect(
    joined: Result<(u64, u64), tokio::task::JoinError>,
    per_vu: &mut BTreeMap<u64, u64>,
) {
    match joined {
        Ok((id, completed)) => {
            per_vu.insert(id, completed);
        }
        Err(err) => error!(%err, "virtual user task failed"),
    }
}

async fn vu_loop<R: IterationRunner>(
    runner: Arc<R>,
    pool: Arc<VuPool>,
    id: u64,
    hard_stop: CancellationToken,
    counters: Arc<RunCounters>,
    telemetry: Option<Arc<EngineMetrics>>,
) -> u64 {
    let mut iteration = 0u64;
    let mut completed = 0u64;
    while !hard_stop.is_cancelled() && pool.keep_running(id) {
        let outcome = tokio::select! {
            biased;
            _ = hard_stop.cancelled() => {
                counters.aborted.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &telemetry {
                    telemetry.record_aborted("interrupted");
                }
                runner.on_interrupted(id);
                break;
            }
            outcome = runner.run_iteration(id, iteration) => outcome,
        };
        match outcome {
            IterationOutcome::Completed => {
                completed += 1;
                counters.completed.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &telemetry {
                    telemetry.record_iteration();
                }
            }
            IterationOutcome::Aborted { reason } => {
                counters.aborted.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &telemetry {
                    telemetry.record_aborted(&reason);
                }
            }
        }
        iteration += 1;
    }
    pool.release(id);
    completed
}

//! The fuzzing loop: pick a route, send it, read feedback, mutate.

use crate::catalog::{parse_route_pattern, Catalog};
use crate::coverage::CoverageTracker;
use crate::exceptions::{ExceptionRecord, ExceptionTracker};
use crate::injection::{self, Finding};
use crate::mutator::mutate_route;
use crate::phase::{Phase, RouteScheduler};
use crate::snapshot::{self, Session, SnapshotError};
use crate::stats::FuzzStats;
use log::{debug, error, info, warn};
use rand::Rng;
use routefuzz_target::{ReportError, RequestSender, SendError, Storage, StoreError, TargetAdapter};
use std::error::Error as StdError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Harness failures log, relative to the results directory.
pub const HARNESS_ERRORS_FILE: &str = "fuzzer_exceptions";

/// Highest random suffix of a snapshot directory name.
const SNAPSHOT_SUFFIX_MAX: u32 = 10_000;

/// Errors that end a run.
#[derive(Error, Debug)]
pub enum ExploreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures inside one iteration. These skip the route, never end the run.
#[derive(Error, Debug)]
enum StepError {
    #[error("request failed")]
    Send(#[from] SendError),

    #[error("target feedback unreadable")]
    Report(#[from] ReportError),

    #[error("store access failed")]
    Store(#[from] StoreError),

    #[error("snapshot failed")]
    Snapshot(#[from] SnapshotError),

    #[error("could not write findings")]
    Io(#[from] std::io::Error),

    #[error("interrupted")]
    Interrupted,
}

/// Configuration for a fuzzing run.
#[derive(Debug, Clone)]
pub struct ExplorerConfig {
    /// Host the target application listens on.
    pub hostname: String,
    pub port: u16,
    /// Database the target application uses.
    pub db_name: String,
    /// Where reports, snapshots and stats live.
    pub results_dir: PathBuf,
    /// Only fuzz routes matching `VERB:/path`.
    pub target_route: Option<String>,
    pub stop_after_replay: bool,
    pub stop_after_exhaustive: bool,
    /// Master seed.
    pub seed: u64,
    /// Stop after this many iterations (None = until a stop point or interrupt).
    pub max_iterations: Option<u64>,
    /// Snapshot to restore before the first request.
    pub initial_snapshot: Option<PathBuf>,
    /// Restore only session and PRNG from the initial snapshot.
    pub skip_db_load: bool,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 3000,
            db_name: String::new(),
            results_dir: PathBuf::from("results"),
            target_route: None,
            stop_after_replay: false,
            stop_after_exhaustive: false,
            seed: 0,
            max_iterations: None,
            initial_snapshot: None,
            skip_db_load: false,
        }
    }
}

impl ExplorerConfig {
    /// Fail fast on settings that would break the first iteration.
    pub fn validate(&self, catalog: &Catalog) -> Result<(), ExploreError> {
        if self.port == 0 {
            return Err(ExploreError::Config("target port is not set".into()));
        }
        if self.db_name.is_empty() {
            return Err(ExploreError::Config("database name is not set".into()));
        }
        if catalog.is_empty() {
            return Err(ExploreError::Config("route catalog is empty".into()));
        }
        if let Some(pattern) = &self.target_route {
            parse_route_pattern(pattern).map_err(|e| ExploreError::Config(e.to_string()))?;
            if catalog.find(pattern).is_none() {
                return Err(ExploreError::Config(format!(
                    "route {} is not in the catalog",
                    pattern
                )));
            }
        }
        Ok(())
    }
}

/// What the run produced.
#[derive(Debug, Clone)]
pub struct ExplorationReport {
    pub iterations: u64,
    pub final_phase: Phase,
    pub interrupted: bool,
    pub stats: FuzzStats,
    /// Unique exceptions in first-seen order.
    pub exceptions: Vec<ExceptionRecord>,
    pub injections: Vec<Finding>,
    pub harness_errors: u64,
}

/// Feedback from one request.
#[derive(Debug, Clone, Copy, Default)]
struct StepOutcome {
    src_delta: bool,
    query_delta: bool,
    /// Any non-benign exception, seen before or not.
    exception_delta: bool,
    exceptions: usize,
}

impl StepOutcome {
    fn progress(&self) -> bool {
        self.src_delta || self.query_delta || self.exception_delta
    }
}

/// Snapshot taken when the current route was entered.
#[derive(Debug)]
struct LiveSnapshot {
    dir: PathBuf,
    /// Referenced by a result worth reproducing; never deleted.
    retained: bool,
}

/// The fuzzing engine.
pub struct Explorer {
    config: ExplorerConfig,
    catalog: Catalog,
    scheduler: RouteScheduler,
    sender: Box<dyn RequestSender>,
    target: Box<dyn TargetAdapter>,
    storage: Box<dyn Storage>,
    session: Session,
    coverage: CoverageTracker,
    exceptions: ExceptionTracker,
    stats: FuzzStats,
    injections: Vec<Finding>,
    running: Arc<AtomicBool>,
    iterations: u64,
    harness_errors: u64,
}

impl Explorer {
    /// Validate `config` against `catalog` and build the engine.
    pub fn new(
        config: ExplorerConfig,
        catalog: Catalog,
        sender: Box<dyn RequestSender>,
        target: Box<dyn TargetAdapter>,
        storage: Box<dyn Storage>,
    ) -> Result<Self, ExploreError> {
        config.validate(&catalog)?;
        let scheduler = RouteScheduler::new(
            &catalog,
            config.stop_after_replay,
            config.stop_after_exhaustive,
        );
        let session = Session::new(config.seed);
        Ok(Self {
            config,
            catalog,
            scheduler,
            sender,
            target,
            storage,
            session,
            coverage: CoverageTracker::new(),
            exceptions: ExceptionTracker::new(),
            stats: FuzzStats::new(),
            injections: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            iterations: 0,
            harness_errors: 0,
        })
    }

    /// Cleared by a signal handler to stop the loop.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn stats(&self) -> &FuzzStats {
        &self.stats
    }

    /// Run until a stop point, the iteration limit or an interrupt.
    pub fn run(&mut self) -> Result<ExplorationReport, ExploreError> {
        fs::create_dir_all(self.snapshots_dir())?;
        if let Some(dir) = self.config.initial_snapshot.clone() {
            info!("loading all state from {}", dir.display());
            snapshot::load(
                &dir,
                &mut self.session,
                self.storage.as_mut(),
                self.target.as_mut(),
                &self.config.db_name,
                self.config.skip_db_load,
            )?;
        }

        info!(
            "fuzzing {} routes ({} seeded) on {}:{}, starting in {} phase",
            self.catalog.len(),
            self.catalog.seeds.len(),
            self.config.hostname,
            self.config.port,
            self.scheduler.phase()
        );

        let mut progress = false;
        let mut last_route: Option<usize> = None;
        let mut live: Option<LiveSnapshot> = None;
        let mut interrupted = false;

        loop {
            if !self.running.load(Ordering::Relaxed) {
                interrupted = true;
                break;
            }
            if self
                .config
                .max_iterations
                .map_or(false, |max| self.iterations >= max)
            {
                info!("iteration limit reached");
                break;
            }
            let Some(idx) = self.scheduler.next_route(progress, &mut self.session.rng) else {
                break;
            };
            if let Some(pattern) = &self.config.target_route {
                if !self.catalog.routes[idx].matches(pattern) {
                    progress = false;
                    continue;
                }
            }

            if last_route != Some(idx) {
                info!("*** {} ***", self.catalog.routes[idx].label());
                release(live.take());
                let dir = self.snapshot_name(idx);
                match snapshot::save(
                    &dir,
                    &self.session,
                    self.storage.as_mut(),
                    &self.config.db_name,
                ) {
                    Ok(()) => {
                        live = Some(LiveSnapshot {
                            dir,
                            retained: false,
                        })
                    }
                    Err(e) => {
                        snapshot::delete(&dir);
                        self.harness_error(idx, None, &StepError::from(e));
                        self.scheduler.force_next_route();
                        last_route = Some(idx);
                        progress = false;
                        self.iterations += 1;
                        continue;
                    }
                }
            }
            last_route = Some(idx);
            self.iterations += 1;

            let snapshot_dir = live.as_ref().map(|s| s.dir.clone());
            let result = self.step(idx, snapshot_dir.as_deref());
            if !self.running.load(Ordering::Relaxed) {
                interrupted = true;
                break;
            }

            let keep = match result {
                Ok(outcome) => {
                    progress = outcome.progress();
                    outcome.exceptions > 0
                }
                Err(e) => {
                    self.harness_error(idx, snapshot_dir.as_deref(), &e);
                    self.scheduler.force_next_route();
                    progress = false;
                    true
                }
            };

            let route = &self.catalog.routes[idx];
            let percentage = self.coverage.percentage();
            self.stats.record_coverage(&route.verb, &route.path, percentage);
            info!("cumulative cov: {:.2}%", percentage);
            if let Err(e) = self.stats.save(&self.config.results_dir) {
                warn!("failed to save stats: {}", e);
            }

            if keep {
                if let Some(snap) = live.as_mut() {
                    snap.retained = true;
                }
            }
        }

        if interrupted {
            warn!("interrupted, stopping without a checkpoint");
        } else {
            release(live);
        }
        Ok(self.generate_report(interrupted))
    }

    /// One request against route `idx` and everything learned from it.
    fn step(&mut self, idx: usize, snapshot_dir: Option<&Path>) -> Result<StepOutcome, StepError> {
        let request = self.catalog.routes[idx].to_request(&self.config.hostname, self.config.port);
        debug!("{} {}", request.verb, request.url);
        let code = self.sender.send(&mut self.session.cookies, &request)?;
        if !self.running.load(Ordering::Relaxed) {
            return Err(StepError::Interrupted);
        }

        let src_delta = self.coverage.update(&self.target.report_coverage()?);
        let queries = self.target.report_queries()?;
        let params = self.target.report_params()?;

        let route = &mut self.catalog.routes[idx];
        let query_delta = route.record_queries(queries);
        route.discover_params(&params);

        let findings = injection::detect(route, route.latest_queries());
        injection::append_findings(&self.config.results_dir, &findings)?;
        self.injections.extend(findings);

        let raised = self
            .exceptions
            .update(self.target.as_mut(), &route.verb, &route.path)?;
        let new_exceptions = self.exceptions.merge(raised.clone());

        let outcome = StepOutcome {
            src_delta: !src_delta.is_empty(),
            query_delta,
            exception_delta: !raised.is_empty(),
            exceptions: raised.len(),
        };
        self.stats
            .record_stats(&route.verb, &route.path, code, raised, snapshot_dir);

        match (code, route.seed_status) {
            (Some(got), Some(recorded)) if got != recorded => {
                info!("status {} (recorded {})", got, recorded)
            }
            (None, _) => info!("request timed out"),
            (Some(got), _) => info!("status {}", got),
        }
        info!(
            "new lines: {}, new queries: {}, new exceptions: {}",
            src_delta.len(),
            outcome.query_delta,
            new_exceptions.len()
        );

        let summary = mutate_route(
            route,
            self.scheduler.phase(),
            outcome.src_delta,
            self.storage.as_mut(),
            &mut self.session.rng,
        )?;
        debug!(
            "mutated {} params from store, {} naively",
            summary.from_store, summary.naive
        );
        Ok(outcome)
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.config.results_dir.join("snapshots")
    }

    /// `results/snapshots/<route id>.<0..=10000>`
    fn snapshot_name(&mut self, idx: usize) -> PathBuf {
        let suffix = self.session.rng.gen_range(0..=SNAPSHOT_SUFFIX_MAX);
        let uid = self.catalog.routes[idx].unique_id();
        self.snapshots_dir().join(format!("{}.{}", uid, suffix))
    }

    fn harness_error(&mut self, idx: usize, snapshot_dir: Option<&Path>, err: &dyn StdError) {
        self.harness_errors += 1;
        let route = &self.catalog.routes[idx];
        let chain = error_chain(err);
        let snapshot = snapshot_dir.map_or_else(|| "none".to_string(), |d| d.display().to_string());
        error!(
            "harness error on {} (snapshot {}): {}",
            route.label(),
            snapshot,
            chain
        );

        let path = self.config.results_dir.join(HARNESS_ERRORS_FILE);
        let entry = format!(
            "***{} {}***\nState saved at {}\n{}\n\n",
            route.verb, route.path, snapshot, chain
        );
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(e) = written {
            warn!("failed to append to {}: {}", path.display(), e);
        }
    }

    fn generate_report(&self, interrupted: bool) -> ExplorationReport {
        ExplorationReport {
            iterations: self.iterations,
            final_phase: self.scheduler.phase(),
            interrupted,
            stats: self.stats.clone(),
            exceptions: self.exceptions.unique().to_vec(),
            injections: self.injections.clone(),
            harness_errors: self.harness_errors,
        }
    }
}

/// Drop a route's snapshot once the route is left, unless a result needs it.
fn release(live: Option<LiveSnapshot>) {
    if let Some(snap) = live.filter(|s| !s.retained) {
        snapshot::delete(&snap.dir);
    }
}

/// `err: source: source ...`
pub fn error_chain(err: &dyn StdError) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

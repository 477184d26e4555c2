//! Periodic compile and reconcile jobs on one node.
//!
//! Each job has its own interval and lock. A tick runs every due job to
//! completion in registration order; a job whose lock is held elsewhere
//! (a manual `fleetrepo compile`, say) is skipped until its next interval.

use crate::compiler::{export_public_key, CompileReport, RepositoryCompiler};
use crate::concurrency::StoreLock;
use crate::signing::Keyring;
use crate::CoreError;
use fleetrepo_catalog::{
    announce_resources, open_catalog, CatalogBackend, CatalogCompiler, DeclareOutcome, NodePaths,
    ReconcileReport,
};
use fleetrepo_schema::{NodeSection, RepoConfig, ResourceId};
use fleetrepo_store::RepoLayout;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on one sleep of the run loop, so shutdown requests are seen
/// promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

pub trait Job {
    fn name(&self) -> &'static str;

    /// Lock that must be held while the job runs.
    fn lock_path(&self) -> PathBuf;

    /// Run to completion. Returns the problems that did not stop the job,
    /// such as quarantined files or resources that failed to apply.
    fn run(&mut self) -> Result<Vec<String>, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    /// Finished, but part of the work did not succeed.
    Partial { problems: Vec<String> },
    /// Lock held by someone else.
    Skipped,
    Failed { error: String },
}

impl JobStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Default, Serialize)]
pub struct TickReport {
    pub jobs: Vec<(&'static str, JobStatus)>,
}

impl TickReport {
    pub fn any_failed(&self) -> bool {
        self.jobs.iter().any(|(_, s)| s.is_failed())
    }

    pub fn any_partial(&self) -> bool {
        self.jobs
            .iter()
            .any(|(_, s)| matches!(s, JobStatus::Partial { .. }))
    }
}

struct Scheduled {
    job: Box<dyn Job>,
    interval: Duration,
    next_due: Instant,
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Scheduled>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The compile job, plus the reconcile job when the config has a
    /// `[node]` section. Both are due immediately.
    pub fn from_config(config: &RepoConfig, now: Instant) -> Result<Self, CoreError> {
        let mut scheduler = Self::new();
        let schedule = &config.schedule;
        scheduler.add(
            Box::new(CompileJob::new(config.clone())),
            Duration::from_secs(schedule.compile_interval_secs),
            now,
        );
        if config.node.is_some() {
            scheduler.add(
                Box::new(ReconcileJob::new(config.clone())?),
                Duration::from_secs(schedule.reconcile_interval_secs),
                now,
            );
        }
        Ok(scheduler)
    }

    /// Register `job`, first due at `first_due`.
    pub fn add(&mut self, job: Box<dyn Job>, interval: Duration, first_due: Instant) {
        debug!("scheduling {} every {}s", job.name(), interval.as_secs());
        self.jobs.push(Scheduled {
            job,
            interval,
            next_due: first_due,
        });
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.jobs.iter().map(|s| s.next_due).min()
    }

    /// Run every job due at `now`. A fatal error stops the tick and is
    /// returned; other failures are recorded and retried next interval.
    pub fn tick(&mut self, now: Instant) -> Result<TickReport, CoreError> {
        let mut report = TickReport::default();
        for slot in &mut self.jobs {
            if slot.next_due > now {
                continue;
            }
            slot.next_due = now + slot.interval;
            let name = slot.job.name();

            let Some(_lock) = StoreLock::try_acquire(&slot.job.lock_path())? else {
                info!("{name}: lock held elsewhere, skipping this tick");
                report.jobs.push((name, JobStatus::Skipped));
                continue;
            };
            match slot.job.run() {
                Ok(problems) if problems.is_empty() => {
                    report.jobs.push((name, JobStatus::Completed));
                }
                Ok(problems) => {
                    warn!("{name} finished with {} problem(s)", problems.len());
                    report.jobs.push((name, JobStatus::Partial { problems }));
                }
                Err(e) if e.is_fatal() => {
                    error!("{name}: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!("{name} failed, retrying in {}s: {e}", slot.interval.as_secs());
                    report.jobs.push((name, JobStatus::Failed { error: e.to_string() }));
                }
            }
        }
        Ok(report)
    }

    /// Tick until `should_stop` returns true. A tick in progress always
    /// finishes first.
    pub fn run(&mut self, should_stop: impl Fn() -> bool) -> Result<(), CoreError> {
        info!("scheduler started with {} job(s)", self.jobs.len());
        while !should_stop() {
            self.tick(Instant::now())?;
            while !should_stop() {
                let now = Instant::now();
                let Some(due) = self.next_due() else {
                    return Ok(());
                };
                if due <= now {
                    break;
                }
                std::thread::sleep((due - now).min(SLEEP_SLICE));
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}

/// Compile every configured distribution, then refresh the exported public
/// key.
pub struct CompileJob {
    config: RepoConfig,
    keyring: Keyring,
}

impl CompileJob {
    pub fn new(config: RepoConfig) -> Self {
        let keyring = Keyring::new(config.keyring_dir());
        Self { config, keyring }
    }

    pub fn layout(&self) -> RepoLayout {
        RepoLayout::new(&self.config.repository.basedir)
    }

    /// Compile `dists` (all configured ones when empty). The caller holds the
    /// repository lock.
    ///
    /// A failing distribution does not stop the others unless the failure is
    /// fatal; the first non-fatal error is returned after all were tried.
    pub fn compile(&self, dists: &[String]) -> Result<Vec<CompileReport>, CoreError> {
        let targets = if dists.is_empty() {
            self.config.distributions()
        } else {
            dists
                .iter()
                .map(|d| self.config.distribution(d))
                .collect::<Result<Vec<_>, _>>()?
        };
        let compiler = RepositoryCompiler::new(
            self.layout(),
            &self.keyring,
            self.config.repository.keep_snapshots,
        );

        let mut reports = Vec::with_capacity(targets.len());
        let mut first_error = None;
        for dist in &targets {
            match compiler.compile(dist) {
                Ok(r) => reports.push(r),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("{}: compile failed: {e}", dist.name);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        export_public_key(&self.config, &self.keyring)?;
        Ok(reports)
    }
}

impl Job for CompileJob {
    fn name(&self) -> &'static str {
        "compile"
    }

    fn lock_path(&self) -> PathBuf {
        self.layout().lock_file()
    }

    fn run(&mut self) -> Result<Vec<String>, CoreError> {
        let reports = self.compile(&[])?;
        let mut problems = Vec::new();
        for report in &reports {
            for rej in &report.rejected {
                problems.push(format!(
                    "{}: quarantined {}: {}",
                    report.distribution, rej.filename, rej.reason
                ));
            }
        }
        Ok(problems)
    }
}

/// What one pass declared from `[announce]`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Announced {
    pub declared: Vec<(ResourceId, DeclareOutcome)>,
    pub failed: Vec<(ResourceId, String)>,
}

/// Outcome of one announce-then-reconcile pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRun {
    pub announced: Vec<(ResourceId, DeclareOutcome)>,
    pub announce_failed: Vec<(ResourceId, String)>,
    pub report: ReconcileReport,
}

impl ReconcileRun {
    pub fn is_clean(&self) -> bool {
        self.announce_failed.is_empty() && self.report.is_clean()
    }

    /// One line per export or resource that did not go through.
    pub fn problems(&self) -> Vec<String> {
        self.announce_failed
            .iter()
            .map(|(id, reason)| format!("announce {id}: {reason}"))
            .chain(
                self.report
                    .failed
                    .iter()
                    .map(|(id, reason)| format!("apply {id}: {reason}")),
            )
            .collect()
    }
}

/// Announce this host's exports (if any), then reconcile local
/// configuration against the catalog.
pub struct ReconcileJob {
    config: RepoConfig,
    node: NodeSection,
}

impl ReconcileJob {
    pub fn new(config: RepoConfig) -> Result<Self, CoreError> {
        let node = config.node()?.clone();
        Ok(Self { config, node })
    }

    fn open_catalog(&self) -> Result<Box<dyn CatalogBackend>, CoreError> {
        Ok(open_catalog(&self.node.catalog, self.config.catalog.timeout())?)
    }

    /// Declare the resources from `[announce]`. Nothing is declared when
    /// the config has no such section.
    pub fn announce(&self) -> Result<Announced, CoreError> {
        if self.config.announce.is_none() {
            return Ok(Announced::default());
        }
        let backend = self.open_catalog()?;
        Ok(self.announce_into(backend.as_ref()))
    }

    /// Each export succeeds or fails on its own; a bad one never stops the
    /// others.
    fn announce_into(&self, backend: &dyn CatalogBackend) -> Announced {
        let exports = announce_resources(&self.config, &self.node.id);
        let mut out = Announced {
            declared: Vec::with_capacity(exports.resources.len()),
            failed: exports.failed,
        };
        for resource in &exports.resources {
            match backend.declare(resource) {
                Ok(outcome) => {
                    debug!("announced {}: {outcome:?}", resource.id());
                    out.declared.push((resource.id(), outcome));
                }
                Err(e) => {
                    warn!("failed to announce {}: {e}", resource.id());
                    out.failed.push((resource.id(), e.to_string()));
                }
            }
        }
        out
    }

    /// One full pass. The caller holds the node lock. Announce failures are
    /// reported alongside the reconcile; they never keep the catalog from
    /// being applied.
    pub fn run_once(&self) -> Result<ReconcileRun, CoreError> {
        let backend = self.open_catalog()?;
        let announced = self.announce_into(backend.as_ref());
        let compiler = CatalogCompiler::new(backend.as_ref(), NodePaths::from(&self.node))
            .with_fetch_timeout(self.config.catalog.timeout());
        let report = compiler.reconcile(&self.node.fleet_node())?;
        if !report.is_clean() {
            warn!("{} resource(s) failed to apply", report.failed.len());
        }
        Ok(ReconcileRun {
            announced: announced.declared,
            announce_failed: announced.failed,
            report,
        })
    }
}

impl Job for ReconcileJob {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    fn lock_path(&self) -> PathBuf {
        self.node.state_dir.join(".lock")
    }

    fn run(&mut self) -> Result<Vec<String>, CoreError> {
        Ok(self.run_once()?.problems())
    }
}

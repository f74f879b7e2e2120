//! Background optimization jobs: a registry keyed by job id with an explicit
//! lifecycle, and the controller that schedules runs onto the blocking pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{OptimizationRequest, ServiceConfig};
use crate::consts::{
    PROGRESS_DONE, PROGRESS_GENERATIONS_END, PROGRESS_GENERATIONS_START,
    PROGRESS_PORTFOLIO_LOADED, PROGRESS_PRICES_FETCHED, PROGRESS_RESULTS_ASSEMBLED,
    PROGRESS_STATISTICS_COMPUTED,
};
use crate::error::{ErrorKind, OptimizerError};
use crate::evolution::portfolio_evolution::{EvolutionHooks, GenerationRecord};
use crate::market_data::PriceSource;
use crate::portfolio::PortfolioStore;
use crate::report::{fetch_prices, load_portfolio, run_optimization, OptimizationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled)
    }
}

/// Coarse milestone of a run. Each one owns a progress value or band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    LoadingPortfolio,
    PortfolioLoaded,
    PricesFetched,
    StatisticsComputed,
    Evolving,
    ResultsAssembled,
    Done,
    Failed,
    Cancelled,
}

impl JobStage {
    /// Progress reached when the stage begins.
    pub fn progress(self) -> u8 {
        match self {
            JobStage::Queued | JobStage::LoadingPortfolio => 0,
            JobStage::PortfolioLoaded => PROGRESS_PORTFOLIO_LOADED,
            JobStage::PricesFetched => PROGRESS_PRICES_FETCHED,
            JobStage::StatisticsComputed => PROGRESS_STATISTICS_COMPUTED,
            JobStage::Evolving => PROGRESS_GENERATIONS_START,
            JobStage::ResultsAssembled => PROGRESS_RESULTS_ASSEMBLED,
            JobStage::Done => PROGRESS_DONE,
            JobStage::Failed | JobStage::Cancelled => 0,
        }
    }

    fn message(self) -> &'static str {
        match self {
            JobStage::Queued => "Waiting for a free worker",
            JobStage::LoadingPortfolio => "Loading portfolio",
            JobStage::PortfolioLoaded => "Portfolio loaded",
            JobStage::PricesFetched => "Historical prices fetched",
            JobStage::StatisticsComputed => "Return statistics computed",
            JobStage::Evolving => "Running generations",
            JobStage::ResultsAssembled => "Assembling results",
            JobStage::Done => "Optimization completed",
            JobStage::Failed => "Optimization failed",
            JobStage::Cancelled => "Optimization cancelled",
        }
    }
}

/// Progress inside the generations band, proportional to `generation / total`.
pub(crate) fn generation_progress(generation: usize, total: usize) -> u8 {
    let band = (PROGRESS_GENERATIONS_END - PROGRESS_GENERATIONS_START) as usize;
    let done = generation.min(total);
    let offset = if total == 0 { band } else { band * done / total };
    PROGRESS_GENERATIONS_START + offset as u8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: Uuid,
    pub portfolio_id: u64,
    pub status: JobStatus,
    pub stage: JobStage,
    /// 0..=100, never decreasing.
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<usize>,
    pub total_generations: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("Job `{0}` was not found")]
    NotFound(Uuid),
    #[error("Job `{job_id}` is {status:?} ({progress}%)")]
    NotFinished {
        job_id: Uuid,
        status: JobStatus,
        progress: u8,
    },
    #[error("Job `{job_id}` failed: {message}")]
    Failed {
        job_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    #[error("Job `{job_id}` was cancelled: {message}")]
    Cancelled { job_id: Uuid, message: String },
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::NotFound(_) => ErrorKind::JobNotFound,
            JobError::NotFinished { .. } => ErrorKind::JobNotFinished,
            JobError::Failed { kind, .. } => *kind,
            JobError::Cancelled { .. } => ErrorKind::JobCancelled,
        }
    }
}

struct JobRecord {
    progress: JobProgress,
    result: Option<Arc<OptimizationReport>>,
    cancel: Arc<AtomicBool>,
    finished_at: Option<Instant>,
}

/// Job records from creation until their TTL runs out after a terminal state.
/// Terminal records are never modified again.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a pending job and returns its id plus its cancel flag.
    pub fn create(&self, portfolio_id: u64, total_generations: usize) -> (Uuid, Arc<AtomicBool>) {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let record = JobRecord {
            progress: JobProgress {
                job_id,
                portfolio_id,
                status: JobStatus::Pending,
                stage: JobStage::Queued,
                progress: 0,
                message: JobStage::Queued.message().into(),
                error_kind: None,
                generation: None,
                total_generations,
                created_at: now,
                updated_at: now,
            },
            result: None,
            cancel: cancel.clone(),
            finished_at: None,
        };
        self.jobs.write().insert(job_id, record);
        (job_id, cancel)
    }

    pub fn progress(&self, job_id: Uuid) -> Result<JobProgress, JobError> {
        self.jobs
            .read()
            .get(&job_id)
            .map(|r| r.progress.clone())
            .ok_or(JobError::NotFound(job_id))
    }

    pub fn is_terminal(&self, job_id: Uuid) -> bool {
        self.jobs
            .read()
            .get(&job_id)
            .map_or(true, |r| r.progress.status.is_terminal())
    }

    /// Applies `update` unless the job is unknown or already terminal.
    fn update<F>(&self, job_id: Uuid, update: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&job_id) {
            Some(record) if !record.progress.status.is_terminal() => {
                update(record);
                record.progress.updated_at = Utc::now();
                if record.progress.status.is_terminal() {
                    record.finished_at = Some(Instant::now());
                }
                true
            }
            _ => false,
        }
    }

    /// Moves a running job forward. Progress never goes backwards.
    pub fn advance(
        &self,
        job_id: Uuid,
        stage: JobStage,
        progress: u8,
        message: impl Into<String>,
        generation: Option<usize>,
    ) {
        let message = message.into();
        self.update(job_id, |record| {
            let p = &mut record.progress;
            p.status = JobStatus::Running;
            p.stage = stage;
            p.progress = p.progress.max(progress.min(PROGRESS_DONE));
            p.message = message;
            if generation.is_some() {
                p.generation = generation;
            }
        });
    }

    pub fn complete(&self, job_id: Uuid, report: OptimizationReport) {
        let report = Arc::new(report);
        self.update(job_id, |record| {
            let p = &mut record.progress;
            p.status = JobStatus::Completed;
            p.stage = JobStage::Done;
            p.progress = PROGRESS_DONE;
            p.message = JobStage::Done.message().into();
            record.result = Some(report);
        });
    }

    pub fn fail(&self, job_id: Uuid, err: &OptimizerError) {
        let message = err.to_string();
        let kind = err.kind();
        self.update(job_id, |record| {
            let p = &mut record.progress;
            p.status = JobStatus::Error;
            p.stage = JobStage::Failed;
            p.message = message;
            p.error_kind = Some(kind);
        });
    }

    pub fn mark_cancelled(&self, job_id: Uuid, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(job_id, |record| set_cancelled(record, message))
    }

    /// Raises the job's cancel flag. A job still waiting for a worker is
    /// cancelled on the spot; a running one stops at its next generation
    /// boundary. Terminal jobs are left as they are.
    pub fn request_cancel(&self, job_id: Uuid) -> Result<JobProgress, JobError> {
        let mut jobs = self.jobs.write();
        let record = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        match record.progress.status {
            JobStatus::Pending => {
                set_cancelled(record, "Cancelled before it started".into());
                record.progress.updated_at = Utc::now();
                record.finished_at = Some(Instant::now());
            }
            JobStatus::Running => {
                record.cancel.store(true, Ordering::SeqCst);
                record.progress.message = "Cancellation requested".into();
                record.progress.updated_at = Utc::now();
            }
            _ => {}
        }
        Ok(record.progress.clone())
    }

    /// Report of a completed job. Reads are idempotent until the record expires.
    pub fn result(&self, job_id: Uuid) -> Result<Arc<OptimizationReport>, JobError> {
        let jobs = self.jobs.read();
        let record = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
        let p = &record.progress;
        match (p.status, &record.result) {
            (JobStatus::Completed, Some(report)) => Ok(report.clone()),
            (JobStatus::Error, _) => Err(JobError::Failed {
                job_id,
                kind: p.error_kind.unwrap_or(ErrorKind::Computation),
                message: p.message.clone(),
            }),
            (JobStatus::Cancelled, _) => Err(JobError::Cancelled {
                job_id,
                message: p.message.clone(),
            }),
            (status, _) => Err(JobError::NotFinished {
                job_id,
                status,
                progress: p.progress,
            }),
        }
    }

    /// Drops terminal records finished more than `ttl` before `now`.
    pub fn purge_expired(&self, ttl: Duration, now: Instant) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, record| {
            record
                .finished_at
                .map_or(true, |finished| now.saturating_duration_since(finished) <= ttl)
        });
        before - jobs.len()
    }
}

fn set_cancelled(record: &mut JobRecord, message: String) {
    record.cancel.store(true, Ordering::SeqCst);
    let p = &mut record.progress;
    p.status = JobStatus::Cancelled;
    p.stage = JobStage::Cancelled;
    p.message = message;
    p.error_kind = Some(ErrorKind::JobCancelled);
}

/// Shared pieces a running job needs; cheap to clone into a task.
#[derive(Clone)]
struct JobContext {
    registry: Arc<JobRegistry>,
    prices: Arc<dyn PriceSource>,
    store: Arc<dyn PortfolioStore>,
    lookback_days: usize,
    frontier_samples: usize,
}

pub struct OptimizationController {
    context: JobContext,
    permits: Arc<Semaphore>,
    config: ServiceConfig,
}

impl OptimizationController {
    pub fn new(
        prices: Arc<dyn PriceSource>,
        store: Arc<dyn PortfolioStore>,
        config: ServiceConfig,
    ) -> Self {
        OptimizationController {
            context: JobContext {
                registry: Arc::new(JobRegistry::new()),
                prices,
                store,
                lookback_days: config.lookback_days,
                frontier_samples: config.frontier_samples,
            },
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PortfolioStore> {
        &self.context.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.context.registry
    }

    /// Validates the request and schedules the run. Returns as soon as the job
    /// is registered; callers poll for progress.
    pub fn start(
        &self,
        portfolio_id: u64,
        request: OptimizationRequest,
    ) -> Result<Uuid, OptimizerError> {
        let evolution_config = request.evolution_config()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| OptimizerError::InvalidConfig(format!("no async runtime to run jobs on: {e}")))?;

        let (job_id, cancel) = self
            .context
            .registry
            .create(portfolio_id, evolution_config.generations);
        let timeout = request.timeout(self.config.job_timeout);
        info!(%job_id, portfolio_id, generations = evolution_config.generations, ?timeout, "optimization job accepted");

        let context = self.context.clone();
        let permits = self.permits.clone();
        runtime.spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    context.registry.fail(
                        job_id,
                        &OptimizerError::Collaborator("job scheduler is shutting down".into()),
                    );
                    return;
                }
            };
            if context.registry.is_terminal(job_id) {
                return;
            }

            let work = execute(context.clone(), job_id, portfolio_id, request, cancel.clone(), permit);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        cancel.store(true, Ordering::SeqCst);
                        warn!(%job_id, ?limit, "optimization job timed out");
                        context
                            .registry
                            .mark_cancelled(job_id, format!("Timed out after {}s", limit.as_secs()));
                        return;
                    }
                },
                None => work.await,
            };

            match outcome {
                Ok(report) => {
                    info!(%job_id, "optimization job completed");
                    context.registry.complete(job_id, report);
                }
                Err(OptimizerError::JobCancelled(message)) => {
                    info!(%job_id, %message, "optimization job cancelled");
                    context.registry.mark_cancelled(job_id, message);
                }
                Err(err) => {
                    error!(%job_id, kind = ?err.kind(), error = %err, "optimization job failed");
                    context.registry.fail(job_id, &err);
                }
            }
        });

        Ok(job_id)
    }

    pub fn poll_progress(&self, job_id: Uuid) -> Result<JobProgress, JobError> {
        self.context.registry.progress(job_id)
    }

    pub fn result(&self, job_id: Uuid) -> Result<Arc<OptimizationReport>, JobError> {
        self.context.registry.result(job_id)
    }

    pub fn cancel(&self, job_id: Uuid) -> Result<JobProgress, JobError> {
        self.context.registry.request_cancel(job_id)
    }

    pub fn purge_expired(&self) -> usize {
        self.context
            .registry
            .purge_expired(self.config.job_ttl, Instant::now())
    }

    /// Periodically removes expired job records.
    pub fn spawn_janitor(&self, period: Duration) -> JoinHandle<()> {
        let registry = self.context.registry.clone();
        let ttl = self.config.job_ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let purged = registry.purge_expired(ttl, Instant::now());
                if purged > 0 {
                    debug!(purged, remaining = registry.len(), "expired jobs purged");
                }
            }
        })
    }
}

async fn execute(
    context: JobContext,
    job_id: Uuid,
    portfolio_id: u64,
    request: OptimizationRequest,
    cancel: Arc<AtomicBool>,
    permit: OwnedSemaphorePermit,
) -> Result<OptimizationReport, OptimizerError> {
    let registry = context.registry.clone();
    let loading = JobStage::LoadingPortfolio;
    registry.advance(job_id, loading, loading.progress(), loading.message(), None);

    let portfolio = load_portfolio(context.store.as_ref(), portfolio_id).await?;
    registry.advance(
        job_id,
        JobStage::PortfolioLoaded,
        JobStage::PortfolioLoaded.progress(),
        format!("Portfolio loaded with {} assets", portfolio.assets.len()),
        None,
    );

    let prices = fetch_prices(context.prices.as_ref(), &portfolio, context.lookback_days).await?;
    registry.advance(
        job_id,
        JobStage::PricesFetched,
        JobStage::PricesFetched.progress(),
        format!("Fetched {} days of prices", prices.number_of_days()),
        None,
    );

    if cancel.load(Ordering::SeqCst) {
        return Err(OptimizerError::JobCancelled("cancelled before evolution".into()));
    }

    let frontier_samples = context.frontier_samples;
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let on_generation = |record: &GenerationRecord, total: usize| {
            registry.advance(
                job_id,
                JobStage::Evolving,
                generation_progress(record.generation, total),
                format!("Generation {}/{}", record.generation, total),
                Some(record.generation),
            );
        };
        let on_stage = |stage: JobStage| {
            registry.advance(job_id, stage, stage.progress(), stage.message(), None);
        };
        let hooks = EvolutionHooks {
            cancel_flag: Some(cancel.as_ref()),
            on_generation: Some(&on_generation),
        };
        run_optimization(&portfolio, &prices, &request, frontier_samples, &hooks, &on_stage)
    })
    .await
    .map_err(|e| OptimizerError::Computation(format!("optimization worker stopped: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::demo_collaborators;
    use crate::portfolio::{InMemoryPortfolioStore, PortfolioSnapshot, StoreError};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn controller(config: ServiceConfig) -> OptimizationController {
        let (prices, store) = demo_collaborators();
        OptimizationController::new(prices, store, config)
    }

    fn quick_request() -> OptimizationRequest {
        OptimizationRequest {
            population_size: 24,
            generations: 10,
            seed: Some(5),
            frontier_samples: Some(200),
            ..Default::default()
        }
    }

    /// Request that keeps a worker busy until it is stopped.
    fn endless_request() -> OptimizationRequest {
        OptimizationRequest {
            population_size: 40,
            generations: 1_000_000,
            include_frontier: false,
            ..Default::default()
        }
    }

    async fn wait_terminal(controller: &OptimizationController, job_id: Uuid) -> JobProgress {
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            let progress = controller.poll_progress(job_id).unwrap();
            if progress.status.is_terminal() {
                return progress;
            }
            assert!(Instant::now() < deadline, "job {job_id} never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_generation_progress_stays_in_band() {
        assert_eq!(generation_progress(0, 10), PROGRESS_GENERATIONS_START);
        assert_eq!(generation_progress(5, 10), 70);
        assert_eq!(generation_progress(10, 10), PROGRESS_GENERATIONS_END);
        assert_eq!(generation_progress(12, 10), PROGRESS_GENERATIONS_END);
        assert_eq!(generation_progress(0, 0), PROGRESS_GENERATIONS_END);
    }

    #[tokio::test]
    async fn test_job_completes_and_result_is_stable() {
        let controller = controller(ServiceConfig::default());
        let job_id = controller.start(1, quick_request()).unwrap();

        let progress = wait_terminal(&controller, job_id).await;
        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(progress.stage, JobStage::Done);
        assert_eq!(progress.progress, 100);
        assert_eq!(progress.total_generations, 10);

        let first = controller.result(job_id).unwrap();
        let second = controller.result(job_id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(controller.poll_progress(job_id).unwrap(), progress);
        assert_eq!(first.optimized_weights.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let controller = controller(ServiceConfig::default());
        let job_id = Uuid::new_v4();
        assert_eq!(controller.poll_progress(job_id), Err(JobError::NotFound(job_id)));
        assert_eq!(
            controller.result(job_id).unwrap_err().kind(),
            ErrorKind::JobNotFound
        );
        assert!(controller.cancel(job_id).is_err());
    }

    #[tokio::test]
    async fn test_failures_keep_their_kind() {
        let controller = controller(ServiceConfig::default());

        let missing = controller.start(404, quick_request()).unwrap();
        let progress = wait_terminal(&controller, missing).await;
        assert_eq!(progress.status, JobStatus::Error);
        assert_eq!(progress.error_kind, Some(ErrorKind::InvalidPortfolio));
        assert!(matches!(
            controller.result(missing),
            Err(JobError::Failed { kind: ErrorKind::InvalidPortfolio, .. })
        ));

        let single = controller.start(2, quick_request()).unwrap();
        let progress = wait_terminal(&controller, single).await;
        assert_eq!(progress.error_kind, Some(ErrorKind::InsufficientData));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_up_front() {
        let controller = controller(ServiceConfig::default());
        let err = controller
            .start(
                1,
                OptimizationRequest {
                    population_size: 1,
                    ..quick_request()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_a_running_job() {
        let controller = controller(ServiceConfig::default());
        let job_id = controller.start(1, endless_request()).unwrap();

        // Let it reach the generation loop before cancelling.
        let deadline = Instant::now() + Duration::from_secs(30);
        while controller.poll_progress(job_id).unwrap().progress < PROGRESS_GENERATIONS_START {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller.cancel(job_id).unwrap();

        let progress = wait_terminal(&controller, job_id).await;
        assert_eq!(progress.status, JobStatus::Cancelled);
        assert!(matches!(controller.result(job_id), Err(JobError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_timeout_cancels_the_job() {
        let controller = controller(ServiceConfig::default());
        let job_id = controller
            .start(
                1,
                OptimizationRequest {
                    timeout_secs: Some(1),
                    ..endless_request()
                },
            )
            .unwrap();

        let progress = wait_terminal(&controller, job_id).await;
        assert_eq!(progress.status, JobStatus::Cancelled);
        assert!(progress.message.contains("Timed out"));
    }

    #[tokio::test]
    async fn test_queued_job_is_cancelled_immediately() {
        let controller = controller(ServiceConfig {
            max_concurrent_jobs: 1,
            ..ServiceConfig::default()
        });
        let busy = controller.start(1, endless_request()).unwrap();
        let queued = controller.start(1, quick_request()).unwrap();

        let progress = controller.cancel(queued).unwrap();
        assert_eq!(progress.status, JobStatus::Cancelled);

        controller.cancel(busy).unwrap();
        assert_eq!(wait_terminal(&controller, busy).await.status, JobStatus::Cancelled);
        // The worker slot is released and the cancelled job never runs.
        assert_eq!(
            controller.poll_progress(queued).unwrap().stage,
            JobStage::Cancelled
        );
    }

    /// Holds `get_portfolio` open until the test releases it.
    struct GatedStore {
        inner: Arc<InMemoryPortfolioStore>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl PortfolioStore for GatedStore {
        async fn get_portfolio(&self, portfolio_id: u64) -> Result<PortfolioSnapshot, StoreError> {
            self.gate.notified().await;
            self.inner.get_portfolio(portfolio_id).await
        }

        async fn update_asset_weight(
            &self,
            portfolio_id: u64,
            asset_id: u64,
            weight: f64,
        ) -> Result<(), StoreError> {
            self.inner.update_asset_weight(portfolio_id, asset_id, weight).await
        }
    }

    #[tokio::test]
    async fn test_running_job_reports_loading_stage() {
        let (prices, inner) = demo_collaborators();
        let gate = Arc::new(Notify::new());
        let store = Arc::new(GatedStore {
            inner,
            gate: gate.clone(),
        });
        let controller = OptimizationController::new(prices, store, ServiceConfig::default());
        let job_id = controller.start(1, quick_request()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(30);
        let loading = loop {
            let progress = controller.poll_progress(job_id).unwrap();
            if progress.status == JobStatus::Running {
                break progress;
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(loading.stage, JobStage::LoadingPortfolio);
        assert_eq!(loading.message, "Loading portfolio");
        assert_eq!(loading.progress, 0);

        gate.notify_one();
        assert_eq!(wait_terminal(&controller, job_id).await.status, JobStatus::Completed);
    }

    #[test]
    fn test_terminal_state_is_never_overwritten() {
        let registry = JobRegistry::new();
        let (job_id, cancel) = registry.create(1, 10);

        registry.advance(job_id, JobStage::StatisticsComputed, 40, "stats", None);
        registry.advance(job_id, JobStage::PricesFetched, 15, "late", None);
        assert_eq!(registry.progress(job_id).unwrap().progress, 40);

        registry.fail(job_id, &OptimizerError::Computation("singular".into()));
        assert!(!registry.mark_cancelled(job_id, "too late"));
        registry.advance(job_id, JobStage::Evolving, 60, "ghost", Some(3));

        let progress = registry.progress(job_id).unwrap();
        assert_eq!(progress.status, JobStatus::Error);
        assert_eq!(progress.error_kind, Some(ErrorKind::Computation));
        assert_eq!(progress.progress, 40);
        assert!(!cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_purge_only_drops_expired_terminal_jobs() {
        let registry = JobRegistry::new();
        let (finished, _) = registry.create(1, 10);
        let (running, _) = registry.create(1, 10);
        registry.advance(running, JobStage::PortfolioLoaded, 5, "loaded", None);
        registry.mark_cancelled(finished, "stopped");

        let ttl = Duration::from_secs(60);
        assert_eq!(registry.purge_expired(ttl, Instant::now()), 0);
        assert_eq!(
            registry.purge_expired(ttl, Instant::now() + Duration::from_secs(61)),
            1
        );
        assert_eq!(registry.progress(finished), Err(JobError::NotFound(finished)));
        assert!(registry.progress(running).is_ok());
    }
}

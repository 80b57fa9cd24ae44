// 🧭 Job Tracker - the surface callers use
//
// map_request  -> run synchronously, get the full MappingResult
// start_job    -> run in the background, get a job id to poll
// get_progress -> snapshot of a running or recently finished job
//
// Also owns the per-job context (identifier maps + lookup cache). Contexts live
// only while their job runs, so concurrent jobs never share cached lookups.

use crate::config::MigrationConfig;
use crate::creator::LookupCache;
use crate::error::MigrationError;
use crate::events::{EventBus, InProcessBus, LINKING_TOPIC};
use crate::id_map::IdentifierMap;
use crate::model::{MappingRequest, MappingResult, OwnerId};
use crate::orchestrator::{request_owners, BulkOrchestrator, ExecutionMode};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::reconciler::LinkReconciler;
use crate::store::EntityStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// State scoped to one mapping job.
#[derive(Debug)]
pub struct JobContext {
    pub job_id: String,
    /// Old ids are only unique per source owner, so each target owner of the
    /// job gets its own identifier map.
    ids: DashMap<OwnerId, Arc<IdentifierMap>>,
    pub lookups: LookupCache,
}

impl JobContext {
    pub fn new(job_id: &str) -> Self {
        JobContext {
            job_id: job_id.to_string(),
            ids: DashMap::new(),
            lookups: LookupCache::new(),
        }
    }

    /// The identifier map of `owner_id`, created on first use.
    pub fn ids_for(&self, owner_id: &str) -> Arc<IdentifierMap> {
        Arc::clone(self.ids.entry(owner_id.to_string()).or_default().value())
    }

    /// The identifier map of `owner_id`, if anything was created for it.
    pub fn ids_of(&self, owner_id: &str) -> Option<Arc<IdentifierMap>> {
        self.ids.get(owner_id).map(|ids| Arc::clone(ids.value()))
    }
}

/// Contexts of the jobs currently running, by job id.
pub type ActiveJobs = DashMap<String, Arc<JobContext>>;

pub struct MigrationService {
    orchestrator: Arc<BulkOrchestrator>,
    tracker: Arc<ProgressTracker>,
    bus: Arc<InProcessBus>,
    reconciler: JoinHandle<()>,
    evictor: JoinHandle<()>,
}

impl MigrationService {
    /// Wire up bus, reconciler and tracker around `store`. Must be called
    /// from inside a tokio runtime.
    pub fn start(store: Arc<dyn EntityStore>, config: MigrationConfig) -> Self {
        let bus = Arc::new(InProcessBus::new());
        let tracker = Arc::new(ProgressTracker::new(
            config.recent_items_limit,
            config.progress_retention,
        ));
        let jobs = Arc::new(ActiveJobs::new());

        let reconciler = Arc::new(LinkReconciler::new(
            Arc::clone(&store),
            Arc::clone(&jobs),
            Arc::clone(&tracker),
            config.link_retry,
        ));
        let reconciler = reconciler.spawn(bus.subscribe(LINKING_TOPIC));

        let sweep_every = (config.progress_retention / 4).max(Duration::from_secs(1));
        let evictor = tracker.spawn_evictor(sweep_every);

        let event_bus: Arc<dyn EventBus> = bus.clone();
        let orchestrator = Arc::new(BulkOrchestrator::new(
            store,
            event_bus,
            Arc::clone(&tracker),
            jobs,
            config,
        ));

        info!(
            workers = orchestrator.config().max_workers,
            "migration service started"
        );

        MigrationService {
            orchestrator,
            tracker,
            bus,
            reconciler,
            evictor,
        }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// The bus the service publishes on; extra subscribers get every event.
    pub fn bus(&self) -> &Arc<InProcessBus> {
        &self.bus
    }

    /// Run `request` and wait for the full result, links included.
    pub async fn map_request(
        &self,
        owner_id: Option<&str>,
        request: MappingRequest,
    ) -> Result<MappingResult, MigrationError> {
        let job_id = new_job_id();
        self.orchestrator
            .run(&job_id, owner_id, request, ExecutionMode::Synchronous)
            .await
    }

    /// Validate `request`, then run it in the background. The returned id can
    /// be polled right away.
    pub fn start_job(
        &self,
        owner_id: Option<String>,
        request: MappingRequest,
    ) -> Result<String, MigrationError> {
        request_owners(owner_id.as_deref(), &request)?;

        let job_id = new_job_id();
        self.tracker.register(&job_id, request.total_items());

        let orchestrator = Arc::clone(&self.orchestrator);
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator
                .run(&id, owner_id.as_deref(), request, ExecutionMode::Background)
                .await
            {
                warn!(job_id = %id, error = %e, "background job ended without a result");
            }
        });

        info!(%job_id, "background job accepted");
        Ok(job_id)
    }

    pub fn get_progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.tracker.get(job_id)
    }

    pub fn progress(&self, job_id: &str) -> Result<ProgressSnapshot, MigrationError> {
        self.get_progress(job_id)
            .ok_or_else(|| MigrationError::UnknownJob(job_id.to_string()))
    }
}

impl Drop for MigrationService {
    fn drop(&mut self) {
        self.reconciler.abort();
        self.evictor.abort();
    }
}

fn new_job_id() -> String {
    format!("job-{}", uuid::Uuid::new_v4())
}

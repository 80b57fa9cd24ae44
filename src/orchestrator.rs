// 🎼 Bulk Orchestrator - drives a mapping request from records to report
//
// Per mapping group:
//   Phase 1: budgets   (split -> bounded parallel batches -> create -> publish)
//   Phase 2: expenses  (same, or the bulk-insert path for very large requests)
// Then wait for the reconciler to settle every published linking event and
// assemble the per-record report.
//
// Batches run on blocking worker threads; a shared semaphore caps how many are
// in flight across all jobs. A batch is one unit of work in the store: events
// and progress for it are only emitted after it commits. A transient store
// failure discards the whole batch and retries it, never item by item.

use crate::batch::{split, Batch};
use crate::config::MigrationConfig;
use crate::creator::{describe_failure, EntityCreator};
use crate::error::{CreationError, MigrationError, StoreError};
use crate::events::{event_for_budget, event_for_expense, EventBus, LinkPublisher};
use crate::id_map::{EntityKind, IdentifierMap};
use crate::jobs::{ActiveJobs, JobContext};
use crate::model::{
    BudgetMapping, BudgetRecord, BudgetResult, EntityId, ExpenseRecord, ExpenseResult, ItemStatus,
    MappingRequest, MappingResult, OldId,
};
use crate::progress::ProgressTracker;
use crate::store::{EntityStore, NewExpense};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Caller waits for the result (small batches) or polls a job (large ones).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Synchronous,
    Background,
}

/// Outcome of one record inside a batch.
#[derive(Debug, Clone, PartialEq)]
enum ItemOutcome {
    Created(EntityId),
    /// Already created for this owner (earlier in the job, or by a
    /// resubmitted request); carries the existing id
    Duplicate(EntityId),
    Failed { status: ItemStatus, message: String },
}

struct BatchReport {
    committed: bool,
    failure: Option<String>,
    outcomes: Vec<(usize, ItemOutcome)>,
}

type Indexed<R> = (usize, R);

/// Batch commits and the last store failure across a whole job.
#[derive(Default)]
struct Tally {
    committed: usize,
    last_failure: Option<String>,
}

impl Tally {
    fn absorb(&mut self, reports: Vec<BatchReport>, outcomes: &mut [Option<ItemOutcome>]) {
        for report in reports {
            if report.committed {
                self.committed += 1;
            }
            if report.failure.is_some() {
                self.last_failure = report.failure;
            }
            for (index, outcome) in report.outcomes {
                if let Some(slot) = outcomes.get_mut(index) {
                    *slot = Some(outcome);
                }
            }
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct BulkOrchestrator {
    store: Arc<dyn EntityStore>,
    bus: Arc<dyn EventBus>,
    tracker: Arc<ProgressTracker>,
    jobs: Arc<ActiveJobs>,
    workers: Arc<Semaphore>,
    config: MigrationConfig,
}

impl BulkOrchestrator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        bus: Arc<dyn EventBus>,
        tracker: Arc<ProgressTracker>,
        jobs: Arc<ActiveJobs>,
        config: MigrationConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        BulkOrchestrator {
            store,
            bus,
            tracker,
            jobs,
            workers,
            config,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Run `request` as job `job_id` and return the full report.
    ///
    /// Per-record failures are part of the report. `Err` means the job could
    /// not proceed at all (no owner, or no batch could ever be committed); the
    /// progress record is marked failed in that case.
    pub async fn run(
        &self,
        job_id: &str,
        owner_id: Option<&str>,
        request: MappingRequest,
        mode: ExecutionMode,
    ) -> Result<MappingResult, MigrationError> {
        let total = request.total_items();
        if self.tracker.contains(job_id) {
            self.tracker.set_total(job_id, total);
        } else {
            self.tracker.register(job_id, total);
        }

        let owners = match request_owners(owner_id, &request) {
            Ok(owners) => owners,
            Err(e) => {
                self.tracker.fail(job_id, &e.to_string());
                return Err(e);
            }
        };

        info!(job_id, groups = request.mappings.len(), total, ?mode, "mapping job started");

        let ctx = Arc::new(JobContext::new(job_id));
        self.jobs.insert(job_id.to_string(), Arc::clone(&ctx));

        let executed = self.execute(&ctx, owners, request, mode).await;

        // Links may still be in flight for whatever did get created.
        self.tracker.update_stage(job_id, "reconciling links");
        self.tracker.wait_for_links(job_id).await;
        self.jobs.remove(job_id);

        match executed {
            Ok(mut result) => {
                result.warnings = self.tracker.warnings(job_id);
                let summary = result.summary();
                info!(job_id, "{}", summary);
                self.tracker.complete(job_id, &summary);
                Ok(result)
            }
            Err(e) => {
                error!(job_id, error = %e, "mapping job failed");
                self.tracker.fail(job_id, &e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &Arc<JobContext>,
        owners: Vec<String>,
        request: MappingRequest,
        mode: ExecutionMode,
    ) -> Result<MappingResult, MigrationError> {
        let job_id = ctx.job_id.as_str();
        let batch_size = match mode {
            ExecutionMode::Synchronous => self.config.sync_batch_size,
            ExecutionMode::Background => self.config.async_batch_size,
        };
        let bulk = request.total_items() >= self.config.bulk_threshold;
        if bulk {
            info!(job_id, threshold = self.config.bulk_threshold, "using bulk insert path for expenses");
        }

        let group_count = request.mappings.len();
        let mut result = MappingResult {
            job_id: job_id.to_string(),
            ..MappingResult::default()
        };
        let mut tally = Tally::default();

        for (g, (group, owner)) in request.mappings.into_iter().zip(owners).enumerate() {
            let ids = ctx.ids_for(&owner);
            let worker = BatchWorker {
                job_id: Arc::from(job_id),
                owner_id: Arc::from(owner.as_str()),
                store: Arc::clone(&self.store),
                bus: Arc::clone(&self.bus),
                tracker: Arc::clone(&self.tracker),
                ctx: Arc::clone(ctx),
                ids: Arc::clone(&ids),
                retries: self.config.batch_retries,
                retry_delay: self.config.batch_retry_delay,
                done: Arc::new(AtomicUsize::new(0)),
            };

            // Phase 1: budgets
            self.tracker.update_stage(
                job_id,
                &format!("group {}/{}: creating budgets", g + 1, group_count),
            );
            let budget_outcomes = self
                .run_records(
                    &worker,
                    EntityKind::Budget,
                    &group.budgets,
                    |b| &b.old_id,
                    batch_size,
                    &mut tally,
                    |w, batch| w.budget_batch(batch),
                )
                .await?;

            // Phase 2: expenses
            self.tracker.update_stage(
                job_id,
                &format!("group {}/{}: creating expenses", g + 1, group_count),
            );
            let expense_outcomes = if bulk {
                self.run_records(
                    &worker,
                    EntityKind::Expense,
                    &group.expenses,
                    |e| &e.old_id,
                    batch_size,
                    &mut tally,
                    |w, batch| w.bulk_expense_batch(batch),
                )
                .await?
            } else {
                self.run_records(
                    &worker,
                    EntityKind::Expense,
                    &group.expenses,
                    |e| &e.old_id,
                    batch_size,
                    &mut tally,
                    |w, batch| w.expense_batch(batch),
                )
                .await?
            };

            // Report
            for (record, outcome) in group.budgets.iter().zip(budget_outcomes) {
                result.budget_results.push(budget_result(record, outcome));
            }
            for (record, outcome) in group.expenses.iter().zip(expense_outcomes) {
                result.results.push(expense_result(&ids, record, outcome));
            }
        }

        if tally.committed == 0 {
            if let Some(reason) = tally.last_failure {
                return Err(MigrationError::JobFailed {
                    job_id: job_id.to_string(),
                    reason: format!("no batch could be committed: {}", reason),
                });
            }
        }

        let statuses = result
            .budget_results
            .iter()
            .map(|r| r.status)
            .chain(result.results.iter().map(|r| r.status));
        for status in statuses {
            result.total_processed += 1;
            match status {
                ItemStatus::Created => result.success_count += 1,
                ItemStatus::DuplicateSkipped => {
                    result.success_count += 1;
                    result.skipped_count += 1;
                }
                ItemStatus::ValidationFailed | ItemStatus::StoreFailed => {
                    result.failure_count += 1
                }
            }
        }
        result.success = result.failure_count == 0;
        Ok(result)
    }

    /// Create one phase's records, in rounds. Each round attempts the first
    /// occurrence of every old id not yet created for this owner; repeats of
    /// an old id wait for the next round, where they are settled as
    /// duplicates if it was created and attempted themselves if it was not.
    #[allow(clippy::too_many_arguments)]
    async fn run_records<R, F>(
        &self,
        worker: &BatchWorker,
        kind: EntityKind,
        records: &[R],
        old_id: impl Fn(&R) -> &OldId,
        batch_size: usize,
        tally: &mut Tally,
        work: F,
    ) -> Result<Vec<Option<ItemOutcome>>, MigrationError>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(&BatchWorker, &Batch<Indexed<R>>) -> BatchReport + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; records.len()];
        let mut pending: Vec<Indexed<R>> = records.iter().cloned().enumerate().collect();
        let mut round = 0;

        while !pending.is_empty() {
            let (fresh, deferred) =
                self.dedupe(&worker.job_id, &worker.ids, kind, pending, &old_id, &mut outcomes);
            if round > 0 && !fresh.is_empty() {
                debug!(
                    job_id = %worker.job_id,
                    kind = kind.as_str(),
                    records = fresh.len(),
                    "retrying repeated old ids whose earlier occurrence was not created"
                );
            }

            let batches = split(fresh, batch_size);
            let reports = self
                .run_phase(worker.with_fresh_counter(), batches, Arc::clone(&work))
                .await?;
            tally.absorb(reports, &mut outcomes);

            pending = deferred;
            round += 1;
        }
        Ok(outcomes)
    }

    /// Split `pending` into records to attempt now and repeats to hold back.
    /// Old ids already in the owner's identifier map are settled right away
    /// as duplicates of the entity created for them.
    fn dedupe<R>(
        &self,
        job_id: &str,
        ids: &IdentifierMap,
        kind: EntityKind,
        pending: Vec<Indexed<R>>,
        old_id: impl Fn(&R) -> &OldId,
        outcomes: &mut [Option<ItemOutcome>],
    ) -> (Vec<Indexed<R>>, Vec<Indexed<R>>) {
        let mut seen: HashSet<OldId> = HashSet::new();
        let mut fresh = Vec::with_capacity(pending.len());
        let mut deferred = Vec::new();

        for (index, record) in pending {
            let id = old_id(&record);
            if let Some(existing) = ids.get(kind, id) {
                debug!(job_id, kind = kind.as_str(), old_id = %id, "old id already created, skipping");
                self.tracker.increment(job_id, 1);
                self.tracker.record_skipped(job_id, 1);
                self.tracker.add_recent_item(
                    job_id,
                    &format!("{} {} already migrated as {}", kind.as_str(), id, existing),
                );
                if let Some(slot) = outcomes.get_mut(index) {
                    *slot = Some(ItemOutcome::Duplicate(existing));
                }
            } else if seen.insert(id.clone()) {
                fresh.push((index, record));
            } else {
                deferred.push((index, record));
            }
        }
        (fresh, deferred)
    }

    /// Run every batch of one phase on the worker pool and collect reports.
    async fn run_phase<R, F>(
        &self,
        worker: BatchWorker,
        batches: Vec<Batch<Indexed<R>>>,
        work: Arc<F>,
    ) -> Result<Vec<BatchReport>, MigrationError>
    where
        R: Send + 'static,
        F: Fn(&BatchWorker, &Batch<Indexed<R>>) -> BatchReport + Send + Sync + 'static,
    {
        let mut tasks = JoinSet::new();
        let mut reports = Vec::with_capacity(batches.len());

        for batch in batches {
            // Acquire before spawning so at most `max_workers` batches exist
            // as tasks at any time.
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|e| MigrationError::Worker(e.to_string()))?;
            let worker = worker.clone();
            let work = Arc::clone(&work);
            tasks.spawn_blocking(move || {
                let _permit = permit;
                work(&worker, &batch)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let report = joined.map_err(|e| MigrationError::Worker(e.to_string()))?;
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Owner for each group: the group's own, else the request's, else the
/// caller's. Empty groups need no owner.
pub(crate) fn request_owners(
    owner_id: Option<&str>,
    request: &MappingRequest,
) -> Result<Vec<String>, MigrationError> {
    let fallback = request.owner_id.as_deref().or(owner_id);
    request
        .mappings
        .iter()
        .map(|group| {
            match group.owner_id.as_deref().or(fallback).filter(|o| !o.trim().is_empty()) {
                Some(owner) => Ok(owner.to_string()),
                None if group.item_count() == 0 => Ok(String::new()),
                None => Err(MigrationError::MissingOwner),
            }
        })
        .collect()
}

fn budget_result(record: &BudgetRecord, outcome: Option<ItemOutcome>) -> BudgetResult {
    let (status, new_id, error_message) = settle_outcome(outcome);
    BudgetResult {
        old_budget_id: record.old_id.clone(),
        new_budget_id: new_id,
        success: status.is_success(),
        status,
        error_message,
    }
}

fn expense_result(
    ids: &IdentifierMap,
    record: &ExpenseRecord,
    outcome: Option<ItemOutcome>,
) -> ExpenseResult {
    let (status, new_id, error_message) = settle_outcome(outcome);

    let budget_mappings = record
        .budget_ids
        .iter()
        .map(|old_budget_id| {
            let new_budget_id = ids.get(EntityKind::Budget, old_budget_id);
            BudgetMapping {
                old_budget_id: old_budget_id.clone(),
                success: status.is_success() && new_budget_id.is_some(),
                new_budget_id,
            }
        })
        .collect();

    ExpenseResult {
        old_expense_id: record.old_id.clone(),
        new_expense_id: new_id,
        budget_mappings,
        success: status.is_success(),
        status,
        error_message,
    }
}

fn settle_outcome(outcome: Option<ItemOutcome>) -> (ItemStatus, Option<EntityId>, Option<String>) {
    match outcome {
        Some(ItemOutcome::Created(id)) => (ItemStatus::Created, Some(id), None),
        Some(ItemOutcome::Duplicate(id)) => (ItemStatus::DuplicateSkipped, Some(id), None),
        Some(ItemOutcome::Failed { status, message }) => (status, None, Some(message)),
        None => (
            ItemStatus::StoreFailed,
            None,
            Some("StoreError: record was never processed".to_string()),
        ),
    }
}

// ============================================================================
// BATCH WORKER (runs on blocking threads)
// ============================================================================

#[derive(Clone)]
struct BatchWorker {
    job_id: Arc<str>,
    owner_id: Arc<str>,
    store: Arc<dyn EntityStore>,
    bus: Arc<dyn EventBus>,
    tracker: Arc<ProgressTracker>,
    ctx: Arc<JobContext>,
    /// Identifier map of this worker's owner
    ids: Arc<IdentifierMap>,
    retries: u32,
    retry_delay: Duration,
    /// Finished batches in the current phase
    done: Arc<AtomicUsize>,
}

impl BatchWorker {
    fn with_fresh_counter(&self) -> Self {
        BatchWorker {
            done: Arc::new(AtomicUsize::new(0)),
            ..self.clone()
        }
    }

    fn creator(&self) -> EntityCreator<'_> {
        EntityCreator::new(self.store.as_ref(), &self.ctx.lookups)
    }

    // ------------------------------------------------------------------------
    // Phase work
    // ------------------------------------------------------------------------

    fn budget_batch(&self, batch: &Batch<Indexed<BudgetRecord>>) -> BatchReport {
        let creator = self.creator();
        let drafts: Vec<_> = batch
            .items
            .iter()
            .map(|(_, record)| creator.prepare_budget(&self.owner_id, record))
            .collect();

        let attempt = self.with_retries(batch.number, || {
            let mut unit = self.store.begin_batch()?;
            let mut outcomes = Vec::with_capacity(batch.len());
            for ((index, _), draft) in batch.items.iter().zip(&drafts) {
                let created = match draft {
                    Ok(draft) => unit.create_budget(draft).map_err(CreationError::from),
                    Err(v) => Err(CreationError::Validation(v.clone())),
                };
                outcomes.push((*index, classify(created)?));
            }
            unit.commit()?;
            Ok(outcomes)
        });

        match attempt {
            Ok(outcomes) => {
                self.register_ids(EntityKind::Budget, batch.items.iter().map(|(_, r)| &r.old_id), &outcomes);
                let publisher = self.publisher();
                for ((_, record), (_, outcome)) in batch.items.iter().zip(&outcomes) {
                    if let ItemOutcome::Created(id) = outcome {
                        if let Some(event) = event_for_budget(&self.ids, id, record) {
                            publisher.publish(event);
                        }
                    }
                }
                self.record_progress(EntityKind::Budget, batch, |r| &r.old_id, &outcomes);
                BatchReport {
                    committed: true,
                    failure: None,
                    outcomes,
                }
            }
            Err(e) => self.abandon(EntityKind::Budget, batch, |r| &r.old_id, e),
        }
    }

    fn expense_batch(&self, batch: &Batch<Indexed<ExpenseRecord>>) -> BatchReport {
        let creator = self.creator();
        let drafts: Vec<_> = batch
            .items
            .iter()
            .map(|(_, record)| creator.prepare_expense(&self.owner_id, record))
            .collect();

        let attempt = self.with_retries(batch.number, || {
            let mut unit = self.store.begin_batch()?;
            let mut outcomes = Vec::with_capacity(batch.len());
            for ((index, _), draft) in batch.items.iter().zip(&drafts) {
                let created = match draft {
                    Ok(draft) => unit.create_expense(draft).map_err(CreationError::from),
                    Err(v) => Err(CreationError::Validation(v.clone())),
                };
                outcomes.push((*index, classify(created)?));
            }
            unit.commit()?;
            Ok(outcomes)
        });

        match attempt {
            Ok(outcomes) => {
                self.after_expenses(batch, &outcomes);
                BatchReport {
                    committed: true,
                    failure: None,
                    outcomes,
                }
            }
            Err(e) => self.abandon(EntityKind::Expense, batch, |r| &r.old_id, e),
        }
    }

    /// Validate every record, then insert the valid ones in one bulk pass.
    fn bulk_expense_batch(&self, batch: &Batch<Indexed<ExpenseRecord>>) -> BatchReport {
        let attempt = self.with_retries(batch.number, || {
            let creator = self.creator();
            let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; batch.len()];
            let mut positions = Vec::new();
            let mut rows: Vec<NewExpense> = Vec::new();

            for (pos, (_, record)) in batch.items.iter().enumerate() {
                match creator.prepare_expense(&self.owner_id, record) {
                    Ok(row) => {
                        positions.push(pos);
                        rows.push(row);
                    }
                    Err(v) => {
                        outcomes[pos] = Some(ItemOutcome::Failed {
                            status: ItemStatus::ValidationFailed,
                            message: describe_failure(&CreationError::Validation(v)),
                        });
                    }
                }
            }

            if !rows.is_empty() {
                let inserted = self.store.bulk_insert_expenses(&rows)?;
                for (pos, row) in positions.into_iter().zip(inserted) {
                    outcomes[pos] = Some(if row.created {
                        ItemOutcome::Created(row.id)
                    } else {
                        ItemOutcome::Duplicate(row.id)
                    });
                }
            }

            Ok(batch
                .items
                .iter()
                .zip(outcomes)
                .map(|((index, _), outcome)| {
                    let outcome = outcome.unwrap_or_else(|| ItemOutcome::Failed {
                        status: ItemStatus::StoreFailed,
                        message: "StoreError: bulk insert returned no row".to_string(),
                    });
                    (*index, outcome)
                })
                .collect::<Vec<_>>())
        });

        match attempt {
            Ok(outcomes) => {
                self.after_expenses(batch, &outcomes);
                BatchReport {
                    committed: true,
                    failure: None,
                    outcomes,
                }
            }
            Err(e) => self.abandon(EntityKind::Expense, batch, |r| &r.old_id, e),
        }
    }

    fn after_expenses(&self, batch: &Batch<Indexed<ExpenseRecord>>, outcomes: &[(usize, ItemOutcome)]) {
        self.register_ids(EntityKind::Expense, batch.items.iter().map(|(_, r)| &r.old_id), outcomes);
        let publisher = self.publisher();
        for ((_, record), (_, outcome)) in batch.items.iter().zip(outcomes) {
            if let ItemOutcome::Created(id) = outcome {
                if let Some(event) = event_for_expense(&self.ids, id, record) {
                    publisher.publish(event);
                }
            }
        }
        self.record_progress(EntityKind::Expense, batch, |r| &r.old_id, outcomes);
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Run `attempt` until it succeeds, fails permanently, or transient
    /// failures exhaust the retry budget.
    fn with_retries<T>(
        &self,
        batch_number: usize,
        mut attempt: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut retry = 0;
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.retries => {
                    retry += 1;
                    warn!(
                        job_id = %self.job_id,
                        batch = batch_number,
                        retry,
                        error = %e,
                        "batch discarded, retrying"
                    );
                    std::thread::sleep(self.retry_delay * retry);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publisher(&self) -> LinkPublisher<'_> {
        LinkPublisher::new(self.bus.as_ref(), &self.tracker, &self.job_id, &self.owner_id)
    }

    /// Make committed ids visible to the rest of the job before any event for
    /// this batch goes out.
    fn register_ids<'r>(
        &self,
        kind: EntityKind,
        old_ids: impl Iterator<Item = &'r OldId>,
        outcomes: &[(usize, ItemOutcome)],
    ) {
        for (old_id, (_, outcome)) in old_ids.zip(outcomes) {
            if let ItemOutcome::Created(id) | ItemOutcome::Duplicate(id) = outcome {
                if !self.ids.put(kind, old_id, id) {
                    debug!(job_id = %self.job_id, kind = kind.as_str(), %old_id, "old id already mapped");
                }
            }
        }
    }

    fn record_progress<R>(
        &self,
        kind: EntityKind,
        batch: &Batch<Indexed<R>>,
        old_id: impl Fn(&R) -> &OldId,
        outcomes: &[(usize, ItemOutcome)],
    ) {
        let job_id: &str = &self.job_id;
        let (mut created, mut skipped, mut failed) = (0, 0, 0);

        for ((_, record), (_, outcome)) in batch.items.iter().zip(outcomes) {
            let old = old_id(record);
            let line = match outcome {
                ItemOutcome::Created(id) => {
                    created += 1;
                    format!("{} {} -> {}", kind.as_str(), old, id)
                }
                ItemOutcome::Duplicate(id) => {
                    skipped += 1;
                    format!("{} {} already migrated as {}", kind.as_str(), old, id)
                }
                ItemOutcome::Failed { message, .. } => {
                    failed += 1;
                    format!("{} {} failed: {}", kind.as_str(), old, message)
                }
            };
            self.tracker.add_recent_item(job_id, &line);
        }

        self.tracker.increment(job_id, batch.len());
        self.tracker.record_success(job_id, created);
        self.tracker.record_skipped(job_id, skipped);
        self.tracker.record_failure(job_id, failed);

        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.update_batch(job_id, done, batch.of);
        debug!(job_id, kind = kind.as_str(), batch = batch.number, of = batch.of, created, skipped, failed, "batch committed");
    }

    /// The batch could not be committed: every record in it failed.
    fn abandon<R>(
        &self,
        kind: EntityKind,
        batch: &Batch<Indexed<R>>,
        old_id: impl Fn(&R) -> &OldId,
        err: StoreError,
    ) -> BatchReport {
        error!(
            job_id = %self.job_id,
            kind = kind.as_str(),
            batch = batch.number,
            error = %err,
            "batch abandoned"
        );
        let message = describe_failure(&CreationError::Store(err.clone()));
        let outcomes: Vec<(usize, ItemOutcome)> = batch
            .items
            .iter()
            .map(|(index, _)| {
                (
                    *index,
                    ItemOutcome::Failed {
                        status: ItemStatus::StoreFailed,
                        message: message.clone(),
                    },
                )
            })
            .collect();

        self.record_progress(kind, batch, old_id, &outcomes);
        BatchReport {
            committed: false,
            failure: Some(err.to_string()),
            outcomes,
        }
    }
}

/// Per-record result, or the transient error that aborts the whole unit.
fn classify(created: Result<EntityId, CreationError>) -> Result<ItemOutcome, StoreError> {
    match created {
        Ok(id) => Ok(ItemOutcome::Created(id)),
        Err(CreationError::Store(e)) if e.is_transient() => Err(e),
        Err(CreationError::Store(StoreError::Duplicate { existing_id })) => {
            Ok(ItemOutcome::Duplicate(existing_id))
        }
        Err(CreationError::Validation(v)) => Ok(ItemOutcome::Failed {
            status: ItemStatus::ValidationFailed,
            message: describe_failure(&CreationError::Validation(v)),
        }),
        Err(err @ CreationError::Store(_)) => Ok(ItemOutcome::Failed {
            status: ItemStatus::StoreFailed,
            message: describe_failure(&err),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InProcessBus, LINKING_TOPIC};
    use crate::model::{ExpenseDetails, MappingGroup};
    use crate::store::InMemoryStore;
    use chrono::NaiveDate;

    fn budget(old_id: &str) -> BudgetRecord {
        BudgetRecord {
            old_id: old_id.to_string(),
            name: Some(format!("Budget {}", old_id)),
            description: None,
            amount: Some(500.0),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31),
            remaining_amount: None,
            expense_ids: Default::default(),
        }
    }

    fn expense(old_id: &str, budgets: &[&str]) -> ExpenseRecord {
        ExpenseRecord {
            old_id: old_id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 2, 1),
            category: None,
            expense: ExpenseDetails {
                expense_name: Some(format!("Expense {}", old_id)),
                amount: Some(12.5),
                expense_type: None,
                payment_method: Some("cash".to_string()),
                net_amount: None,
                comments: None,
                credit_due: None,
            },
            budget_ids: budgets.iter().map(|s| s.to_string()).collect(),
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        tracker: Arc<ProgressTracker>,
        orchestrator: BulkOrchestrator,
    }

    /// Orchestrator with a bus that only has a counting tap (no reconciler);
    /// every published event is settled by the tap.
    fn harness(config: MigrationConfig) -> (Harness, tokio::task::JoinHandle<usize>) {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InProcessBus::new());
        let tracker = Arc::new(ProgressTracker::new(50, Duration::from_secs(60)));
        let jobs = Arc::new(ActiveJobs::new());

        let mut tap = bus.subscribe(LINKING_TOPIC);
        let settle = Arc::clone(&tracker);
        let counter = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(envelope) = tap.recv().await {
                seen += 1;
                settle.link_settled(&envelope.job_id, &envelope.event_id);
            }
            seen
        });

        let dyn_store: Arc<dyn EntityStore> = store.clone();
        let orchestrator = BulkOrchestrator::new(dyn_store, bus, Arc::clone(&tracker), jobs, config);
        (
            Harness {
                store,
                tracker,
                orchestrator,
            },
            counter,
        )
    }

    fn fast_config() -> MigrationConfig {
        MigrationConfig::new()
            .with_workers(4)
            .with_batch_sizes(2, 2)
            .with_batch_retries(3, Duration::from_millis(1))
    }

    #[test]
    fn test_request_owners() {
        let mut request = MappingRequest {
            owner_id: None,
            mappings: vec![MappingGroup {
                owner_id: None,
                expenses: vec![expense("E1", &[])],
                budgets: vec![],
            }],
        };
        assert!(matches!(request_owners(None, &request), Err(MigrationError::MissingOwner)));
        assert_eq!(request_owners(Some("caller"), &request).unwrap(), vec!["caller"]);

        request.owner_id = Some("request".to_string());
        assert_eq!(request_owners(Some("caller"), &request).unwrap(), vec!["request"]);

        request.mappings[0].owner_id = Some("group".to_string());
        assert_eq!(request_owners(Some("caller"), &request).unwrap(), vec!["group"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_budgets_then_expenses_with_fast_path() {
        let (h, _counter) = harness(fast_config());
        let request = MappingRequest {
            owner_id: Some("owner".to_string()),
            mappings: vec![MappingGroup {
                owner_id: None,
                budgets: vec![budget("B1"), budget("B2"), budget("B3")],
                expenses: vec![expense("E1", &["B1"]), expense("E2", &["B1", "B2"])],
            }],
        };

        let result = h
            .orchestrator
            .run("job", None, request, ExecutionMode::Synchronous)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.total_processed, 5);
        assert_eq!(result.success_count, 5);
        assert_eq!(h.store.budget_count(), 3);
        assert_eq!(h.store.expense_count(), 2);

        // budgets exist before expenses, so expense results map every budget
        let e2 = &result.results[1];
        assert_eq!(e2.budget_mappings.len(), 2);
        assert!(e2.budget_mappings.iter().all(|m| m.success && m.new_budget_id.is_some()));

        let snap = h.tracker.get("job").unwrap();
        assert_eq!(snap.processed, 5);
        assert_eq!(snap.status, crate::progress::JobStatus::Completed);

        println!("✅ Two-phase orchestration test passed: {}", result.summary());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_validation_failure_does_not_abort_batch() {
        let (h, _counter) = harness(fast_config());
        let mut bad = expense("E2", &[]);
        bad.expense.amount = Some(-3.0);

        let request = MappingRequest {
            owner_id: Some("owner".to_string()),
            mappings: vec![MappingGroup {
                owner_id: None,
                budgets: vec![],
                expenses: vec![expense("E1", &[]), bad, expense("E3", &[])],
            }],
        };

        let result = h
            .orchestrator
            .run("job", None, request, ExecutionMode::Synchronous)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.results[1].status, ItemStatus::ValidationFailed);
        assert!(result.results[1]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("ValidationError"));
        assert_eq!(h.store.expense_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repeated_old_ids_are_skipped() {
        let (h, _counter) = harness(fast_config());
        let request = MappingRequest {
            owner_id: Some("owner".to_string()),
            mappings: vec![
                MappingGroup {
                    owner_id: None,
                    budgets: vec![budget("B1"), budget("B1")],
                    expenses: vec![],
                },
                MappingGroup {
                    owner_id: None,
                    budgets: vec![budget("B1")],
                    expenses: vec![],
                },
            ],
        };

        let result = h
            .orchestrator
            .run("job", None, request, ExecutionMode::Synchronous)
            .await
            .unwrap();

        assert_eq!(h.store.budget_count(), 1);
        assert_eq!(result.skipped_count, 2);
        let first = result.budget_results[0].new_budget_id.clone();
        assert!(first.is_some());
        assert!(result.budget_results.iter().all(|r| r.new_budget_id == first));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_down_fails_job() {
        let (h, _counter) = harness(fast_config().with_batch_retries(2, Duration::from_millis(1)));
        h.store.set_unavailable(true);

        let request = MappingRequest {
            owner_id: Some("owner".to_string()),
            mappings: vec![MappingGroup {
                owner_id: None,
                budgets: vec![budget("B1")],
                expenses: vec![expense("E1", &["B1"])],
            }],
        };

        let err = h
            .orchestrator
            .run("job", None, request, ExecutionMode::Background)
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::JobFailed { .. }));
        let snap = h.tracker.get("job").unwrap();
        assert_eq!(snap.status, crate::progress::JobStatus::Failed);
        assert_eq!(snap.failed, 2);
        assert!(snap.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bulk_path_reports_duplicates() {
        let config = fast_config().with_bulk_threshold(1);
        let (h, _counter) = harness(config);

        let request = || MappingRequest {
            owner_id: Some("owner".to_string()),
            mappings: vec![MappingGroup {
                owner_id: None,
                budgets: vec![],
                expenses: vec![expense("E1", &[]), expense("E2", &[]), expense("E3", &[])],
            }],
        };

        let first = h
            .orchestrator
            .run("job-1", None, request(), ExecutionMode::Background)
            .await
            .unwrap();
        assert_eq!(first.success_count, 3);
        assert_eq!(h.store.expense_count(), 3);

        let second = h
            .orchestrator
            .run("job-2", None, request(), ExecutionMode::Background)
            .await
            .unwrap();
        assert_eq!(second.skipped_count, 3);
        assert!(second.results.iter().all(|r| r.status == ItemStatus::DuplicateSkipped));
        assert_eq!(h.store.expense_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repeat_is_attempted_when_first_occurrence_fails() {
        let (h, _counter) = harness(fast_config());
        let mut invalid = expense("E1", &[]);
        invalid.expense.amount = Some(-5.0);
        let mut valid = expense("E1", &[]);
        valid.expense.amount = Some(5.0);

        let request = MappingRequest {
            owner_id: Some("owner".to_string()),
            mappings: vec![MappingGroup {
                owner_id: None,
                budgets: vec![],
                expenses: vec![invalid, valid],
            }],
        };

        let result = h
            .orchestrator
            .run("job", None, request, ExecutionMode::Synchronous)
            .await
            .unwrap();

        assert_eq!(h.store.expense_count(), 1);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.skipped_count, 0);

        assert_eq!(result.results[0].status, ItemStatus::ValidationFailed);
        assert!(!result.results[0].success);
        assert_eq!(result.results[1].status, ItemStatus::Created);
        assert!(result.results[1].success);
        assert!(result.results[1].new_expense_id.is_some());

        let snap = h.tracker.get("job").unwrap();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 1);

        println!("✅ Repeated old id retry test passed");
    }
}

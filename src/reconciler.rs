// 🔗 Link Reconciler - turns linking events into link-set updates
//
// Long-lived consumer of LINKING_TOPIC. Each event is handled on its own task,
// so one event waiting out its backoff never holds up the others.
//
// Per event:
// 1. Link every counterpart that is already known by new id
// 2. Resolve pending old ids through the identifier map of the event's owner
// 3. Re-check the store for the counterpart, link it if present
// 4. Whatever is still missing is retried with bounded exponential backoff,
//    then reported as a LinkResolutionTimeout warning on the job
//
// Old ids of a job that is no longer running can never resolve; they are
// reported at once instead of waiting out the backoff.
//
// Link sets are sets, so re-applying an event (at-least-once delivery) is a
// no-op.

use crate::config::RetryPolicy;
use crate::error::StoreError;
use crate::events::LinkEnvelope;
use crate::id_map::EntityKind;
use crate::jobs::ActiveJobs;
use crate::model::{EntityId, LinkWarning, OldId};
use crate::progress::ProgressTracker;
use crate::store::EntityStore;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A counterpart reference carried by an event.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference {
    /// Already remapped when the event was published
    New(EntityId),
    /// Still a source-system id
    Old(OldId),
}

impl Reference {
    fn id(&self) -> &str {
        match self {
            Reference::New(id) | Reference::Old(id) => id,
        }
    }
}

/// What handling one event achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkOutcome {
    /// Counterparts (new ids) now linked to the event's entity
    pub linked: Vec<EntityId>,
    /// How many of those links were not present before
    pub changed: usize,
    /// References abandoned after the retry budget ran out
    pub timed_out: Vec<String>,
    /// Retries made after the first resolution attempt
    pub retries: u32,
}

pub struct LinkReconciler {
    store: Arc<dyn EntityStore>,
    jobs: Arc<ActiveJobs>,
    tracker: Arc<ProgressTracker>,
    policy: RetryPolicy,
}

impl LinkReconciler {
    pub fn new(
        store: Arc<dyn EntityStore>,
        jobs: Arc<ActiveJobs>,
        tracker: Arc<ProgressTracker>,
        policy: RetryPolicy,
    ) -> Self {
        LinkReconciler {
            store,
            jobs,
            tracker,
            policy,
        }
    }

    /// Drain `events` until every sender is gone.
    pub fn spawn(self: Arc<Self>, events: UnboundedReceiver<LinkEnvelope>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<LinkEnvelope>) {
        info!("link reconciler started");
        while let Some(envelope) = events.recv().await {
            let reconciler = Arc::clone(&self);
            tokio::spawn(async move {
                reconciler.handle(envelope).await;
            });
        }
        info!("linking event stream closed, reconciler stopping");
    }

    /// Handle one event to completion, including backoff. Settles the event
    /// on the job's progress record exactly once.
    pub async fn handle(&self, envelope: LinkEnvelope) -> LinkOutcome {
        let outcome = self.reconcile(&envelope).await;
        self.tracker.link_settled(&envelope.job_id, &envelope.event_id);
        outcome
    }

    async fn reconcile(&self, envelope: &LinkEnvelope) -> LinkOutcome {
        let (kind, source_id) = envelope.event.source();
        let mut outcome = LinkOutcome::default();

        let mut pending: Vec<Reference> = envelope
            .event
            .resolved_counterparts()
            .iter()
            .cloned()
            .map(Reference::New)
            .chain(
                envelope
                    .event
                    .pending_counterparts()
                    .iter()
                    .cloned()
                    .map(Reference::Old),
            )
            .collect();

        if !self.jobs.contains_key(&envelope.job_id) {
            let (orphaned, known): (Vec<Reference>, Vec<Reference>) = pending
                .into_iter()
                .partition(|reference| matches!(reference, Reference::Old(_)));
            for reference in orphaned {
                self.give_up(
                    envelope,
                    kind,
                    source_id,
                    reference.id(),
                    &format!("cannot be resolved, job {} is not running", envelope.job_id),
                );
                outcome.timed_out.push(reference.id().to_string());
            }
            pending = known;
        }

        let mut retry = 0;
        loop {
            let mut unresolved = Vec::new();
            for reference in pending {
                match self.try_link(envelope, kind, source_id, &reference).await {
                    Some((counterpart, changed)) => {
                        if changed {
                            outcome.changed += 1;
                        }
                        outcome.linked.push(counterpart);
                    }
                    None => unresolved.push(reference),
                }
            }
            pending = unresolved;

            if pending.is_empty() || retry == self.policy.max_retries {
                break;
            }

            retry += 1;
            let delay = self.policy.delay_for(retry);
            debug!(
                job_id = %envelope.job_id,
                entity_id = source_id,
                unresolved = pending.len(),
                retry,
                delay_ms = delay.as_millis() as u64,
                "counterparts not yet present, backing off"
            );
            tokio::time::sleep(delay).await;
        }
        outcome.retries = retry;

        for reference in pending {
            self.give_up(
                envelope,
                kind,
                source_id,
                reference.id(),
                &format!("still unresolved after {} retries", retry),
            );
            outcome.timed_out.push(reference.id().to_string());
        }

        if outcome.changed > 0 {
            debug!(job_id = %envelope.job_id, entity_id = source_id, links = outcome.changed, "links applied");
        }
        outcome
    }

    fn give_up(
        &self,
        envelope: &LinkEnvelope,
        kind: EntityKind,
        source_id: &str,
        unresolved: &str,
        reason: &str,
    ) {
        warn!(
            job_id = %envelope.job_id,
            entity_id = source_id,
            unresolved,
            reason,
            "link resolution timed out"
        );
        self.tracker.add_warning(
            &envelope.job_id,
            LinkWarning {
                entity_id: source_id.to_string(),
                unresolved_old_id: unresolved.to_string(),
                message: format!(
                    "LinkResolutionTimeout: {} {} {}",
                    kind.counterpart().as_str(),
                    unresolved,
                    reason
                ),
            },
        );
    }

    /// One resolution attempt. `Some((counterpart, changed))` once linked.
    async fn try_link(
        &self,
        envelope: &LinkEnvelope,
        kind: EntityKind,
        source_id: &str,
        reference: &Reference,
    ) -> Option<(EntityId, bool)> {
        let job_id = envelope.job_id.as_str();
        let counterpart = match reference {
            Reference::New(id) => id.clone(),
            Reference::Old(old_id) => {
                let ids = self.jobs.get(job_id)?.ids_of(&envelope.owner_id)?;
                ids.get(kind.counterpart(), old_id)?
            }
        };

        let store = Arc::clone(&self.store);
        let source = source_id.to_string();
        let target = counterpart.clone();
        let applied = tokio::task::spawn_blocking(move || {
            apply_link(store.as_ref(), kind, &source, &target)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("link task failed: {}", e)))
        .and_then(|result| result);

        match applied {
            Ok(Some(changed)) => Some((counterpart, changed)),
            Ok(None) => None,
            Err(e) => {
                warn!(job_id, entity_id = source_id, counterpart = %counterpart, error = %e, "link update failed, will retry");
                None
            }
        }
    }
}

/// Link `source_id` (of `source_kind`) and `counterpart_id` on both sides.
/// `Ok(None)` when either entity is not in the store, in which case nothing
/// is written; otherwise whether either link set changed.
///
/// A failure between the two writes leaves only the expense side linked.
/// The caller retries, and set semantics make the repeated expense write a
/// no-op, so a retried link always ends up symmetric.
pub fn apply_link(
    store: &dyn EntityStore,
    source_kind: EntityKind,
    source_id: &str,
    counterpart_id: &str,
) -> Result<Option<bool>, StoreError> {
    if !store.exists(source_kind, source_id)?
        || !store.exists(source_kind.counterpart(), counterpart_id)?
    {
        return Ok(None);
    }

    let (expense_id, budget_id) = match source_kind {
        EntityKind::Expense => (source_id, counterpart_id),
        EntityKind::Budget => (counterpart_id, source_id),
    };

    let expense_changed = store.update_expense_links(expense_id, &[budget_id.to_string()])?;
    let budget_changed = store.update_budget_links(budget_id, &[expense_id.to_string()])?;
    Ok(Some(expense_changed || budget_changed))
}

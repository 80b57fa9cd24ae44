// 📨 Linking events - asynchronous cross-reference notifications
//
// Every created expense or budget that carries cross-references announces
// them with exactly one event. Old ids that are already in the identifier map
// are remapped at publish time; the rest are left for the reconciler.
//
// Following the audit-trail idea: "Every change is an event".

use crate::error::BusError;
use crate::id_map::{EntityKind, IdentifierMap};
use crate::model::{BudgetRecord, EntityId, ExpenseRecord, LinkWarning, OldId, OwnerId};
use crate::progress::ProgressTracker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

pub const LINKING_TOPIC: &str = "finance.linking";

// ============================================================================
// EVENT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LinkEvent {
    /// A budget was created and lists expenses it should link to.
    #[serde(rename_all = "camelCase")]
    BudgetCreatedWithOldExpenses {
        new_budget_id: EntityId,
        old_budget_id: OldId,
        /// Expenses already known at publish time
        resolved_expense_ids: Vec<EntityId>,
        /// Expenses not created yet (by old id)
        old_expense_ids: Vec<OldId>,
    },

    /// An expense was created while some of its budgets were still unknown.
    #[serde(rename_all = "camelCase")]
    ExpenseCreatedWithOldBudgets {
        new_expense_id: EntityId,
        old_expense_id: OldId,
        resolved_budget_ids: Vec<EntityId>,
        old_budget_ids: Vec<OldId>,
    },

    /// Fast path: every budget of the expense was already created.
    #[serde(rename_all = "camelCase")]
    ExpenseCreatedWithExistingBudgets {
        new_expense_id: EntityId,
        budget_ids: Vec<EntityId>,
    },
}

impl LinkEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LinkEvent::BudgetCreatedWithOldExpenses { .. } => "BudgetCreatedWithOldExpenses",
            LinkEvent::ExpenseCreatedWithOldBudgets { .. } => "ExpenseCreatedWithOldBudgets",
            LinkEvent::ExpenseCreatedWithExistingBudgets { .. } => {
                "ExpenseCreatedWithExistingBudgets"
            }
        }
    }

    /// The entity this event was published for.
    pub fn source(&self) -> (EntityKind, &str) {
        match self {
            LinkEvent::BudgetCreatedWithOldExpenses { new_budget_id, .. } => {
                (EntityKind::Budget, new_budget_id.as_str())
            }
            LinkEvent::ExpenseCreatedWithOldBudgets { new_expense_id, .. }
            | LinkEvent::ExpenseCreatedWithExistingBudgets { new_expense_id, .. } => {
                (EntityKind::Expense, new_expense_id.as_str())
            }
        }
    }

    /// Counterparts already known as new ids.
    pub fn resolved_counterparts(&self) -> &[EntityId] {
        match self {
            LinkEvent::BudgetCreatedWithOldExpenses { resolved_expense_ids, .. } => {
                resolved_expense_ids
            }
            LinkEvent::ExpenseCreatedWithOldBudgets { resolved_budget_ids, .. } => {
                resolved_budget_ids
            }
            LinkEvent::ExpenseCreatedWithExistingBudgets { budget_ids, .. } => budget_ids,
        }
    }

    /// Counterparts still referenced by old id.
    pub fn pending_counterparts(&self) -> &[OldId] {
        match self {
            LinkEvent::BudgetCreatedWithOldExpenses { old_expense_ids, .. } => old_expense_ids,
            LinkEvent::ExpenseCreatedWithOldBudgets { old_budget_ids, .. } => old_budget_ids,
            LinkEvent::ExpenseCreatedWithExistingBudgets { .. } => &[],
        }
    }
}

/// Event plus the job it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEnvelope {
    pub event_id: String,
    pub job_id: String,
    pub owner_id: OwnerId,
    pub published_at: DateTime<Utc>,
    pub event: LinkEvent,
}

impl LinkEnvelope {
    pub fn new(job_id: &str, owner_id: &str, event: LinkEvent) -> Self {
        LinkEnvelope {
            event_id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            owner_id: owner_id.to_string(),
            published_at: Utc::now(),
            event,
        }
    }
}

// ============================================================================
// EVENT CONSTRUCTION
// ============================================================================

/// Event for a freshly created budget, or `None` if it lists no expenses.
pub fn event_for_budget(
    ids: &IdentifierMap,
    new_budget_id: &str,
    record: &BudgetRecord,
) -> Option<LinkEvent> {
    if record.expense_ids.is_empty() {
        return None;
    }

    let (resolved, pending) = ids.resolve_all(EntityKind::Expense, &record.expense_ids);
    Some(LinkEvent::BudgetCreatedWithOldExpenses {
        new_budget_id: new_budget_id.to_string(),
        old_budget_id: record.old_id.clone(),
        resolved_expense_ids: resolved,
        old_expense_ids: pending,
    })
}

/// Event for a freshly created expense, or `None` if it lists no budgets.
pub fn event_for_expense(
    ids: &IdentifierMap,
    new_expense_id: &str,
    record: &ExpenseRecord,
) -> Option<LinkEvent> {
    if record.budget_ids.is_empty() {
        return None;
    }

    let (resolved, pending) = ids.resolve_all(EntityKind::Budget, &record.budget_ids);
    if pending.is_empty() {
        Some(LinkEvent::ExpenseCreatedWithExistingBudgets {
            new_expense_id: new_expense_id.to_string(),
            budget_ids: resolved,
        })
    } else {
        Some(LinkEvent::ExpenseCreatedWithOldBudgets {
            new_expense_id: new_expense_id.to_string(),
            old_expense_id: record.old_id.clone(),
            resolved_budget_ids: resolved,
            old_budget_ids: pending,
        })
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

/// At-least-once, unordered delivery.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, envelope: LinkEnvelope) -> Result<(), BusError>;
}

/// Fan-out bus over tokio channels; every subscriber of a topic gets a copy.
#[derive(Default)]
pub struct InProcessBus {
    subscribers: DashMap<String, Vec<UnboundedSender<LinkEnvelope>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> UnboundedReceiver<LinkEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

impl EventBus for InProcessBus {
    fn publish(&self, topic: &str, envelope: LinkEnvelope) -> Result<(), BusError> {
        let mut subscribers = self
            .subscribers
            .get_mut(topic)
            .ok_or_else(|| BusError::NoSubscribers(topic.to_string()))?;

        subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());

        if subscribers.is_empty() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

// ============================================================================
// PUBLISHER
// ============================================================================

/// Publishes linking events for one job and registers each as pending on the
/// job, so the job can wait for its links to settle. Exactly one consumer
/// (the link reconciler) settles a published event.
pub struct LinkPublisher<'a> {
    bus: &'a dyn EventBus,
    tracker: &'a ProgressTracker,
    job_id: &'a str,
    owner_id: &'a str,
}

impl<'a> LinkPublisher<'a> {
    pub fn new(
        bus: &'a dyn EventBus,
        tracker: &'a ProgressTracker,
        job_id: &'a str,
        owner_id: &'a str,
    ) -> Self {
        LinkPublisher {
            bus,
            tracker,
            job_id,
            owner_id,
        }
    }

    /// Returns whether the event reached the bus. A failed publish is
    /// recorded as a link warning on the job; the entity stays created.
    pub fn publish(&self, event: LinkEvent) -> bool {
        let (kind, entity_id) = event.source();
        let entity_id = entity_id.to_string();
        let kind_name = event.kind_name();

        let envelope = LinkEnvelope::new(self.job_id, self.owner_id, event);
        let event_id = envelope.event_id.clone();
        self.tracker.link_published(self.job_id, &event_id);

        match self.bus.publish(LINKING_TOPIC, envelope) {
            Ok(()) => {
                debug!(job_id = self.job_id, kind = kind_name, %entity_id, "published linking event");
                true
            }
            Err(e) => {
                warn!(job_id = self.job_id, kind = kind_name, %entity_id, error = %e, "linking event not published");
                self.tracker.add_warning(
                    self.job_id,
                    LinkWarning {
                        entity_id,
                        unresolved_old_id: String::new(),
                        message: format!("{} links for this {} were not published: {}", kind_name, kind.as_str(), e),
                    },
                );
                self.tracker.link_settled(self.job_id, &event_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn budget(old_id: &str, expenses: &[&str]) -> BudgetRecord {
        BudgetRecord {
            old_id: old_id.to_string(),
            name: Some(old_id.to_string()),
            description: None,
            amount: Some(100.0),
            start_date: None,
            end_date: None,
            remaining_amount: None,
            expense_ids: expenses.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn expense(old_id: &str, budgets: &[&str]) -> ExpenseRecord {
        ExpenseRecord {
            old_id: old_id.to_string(),
            date: None,
            category: None,
            expense: crate::model::ExpenseDetails {
                expense_name: None,
                amount: None,
                expense_type: None,
                payment_method: None,
                net_amount: None,
                comments: None,
                credit_due: None,
            },
            budget_ids: budgets.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn test_no_cross_references_no_event() {
        let ids = IdentifierMap::new();
        assert!(event_for_budget(&ids, "nb", &budget("B1", &[])).is_none());
        assert!(event_for_expense(&ids, "ne", &expense("E1", &[])).is_none());
    }

    #[test]
    fn test_expense_event_kind_depends_on_resolution() {
        let ids = IdentifierMap::new();
        ids.put(EntityKind::Budget, "B1", "nb1");

        let fast = event_for_expense(&ids, "ne1", &expense("E1", &["B1"])).unwrap();
        assert_eq!(
            fast,
            LinkEvent::ExpenseCreatedWithExistingBudgets {
                new_expense_id: "ne1".to_string(),
                budget_ids: vec!["nb1".to_string()],
            }
        );

        let slow = event_for_expense(&ids, "ne2", &expense("E2", &["B1", "B2"])).unwrap();
        assert_eq!(slow.resolved_counterparts(), &["nb1".to_string()]);
        assert_eq!(slow.pending_counterparts(), &["B2".to_string()]);
        assert_eq!(slow.kind_name(), "ExpenseCreatedWithOldBudgets");

        println!("✅ Expense event construction test passed");
    }

    #[test]
    fn test_budget_event_remaps_opportunistically() {
        let ids = IdentifierMap::new();
        ids.put(EntityKind::Expense, "E1", "ne1");

        let event = event_for_budget(&ids, "nb1", &budget("B1", &["E1", "E2"])).unwrap();
        assert_eq!(event.source(), (EntityKind::Budget, "nb1"));
        assert_eq!(event.resolved_counterparts(), &["ne1".to_string()]);
        assert_eq!(event.pending_counterparts(), &["E2".to_string()]);
    }

    #[test]
    fn test_event_wire_tag() {
        let event = LinkEvent::ExpenseCreatedWithExistingBudgets {
            new_expense_id: "ne".to_string(),
            budget_ids: vec!["nb".to_string()],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "ExpenseCreatedWithExistingBudgets");
        assert_eq!(value["newExpenseId"], "ne");
    }

    #[tokio::test]
    async fn test_bus_fans_out_to_subscribers() {
        let bus = InProcessBus::new();
        let mut a = bus.subscribe(LINKING_TOPIC);
        let mut b = bus.subscribe(LINKING_TOPIC);

        let envelope = LinkEnvelope::new(
            "job",
            "owner",
            LinkEvent::ExpenseCreatedWithExistingBudgets {
                new_expense_id: "ne".to_string(),
                budget_ids: vec![],
            },
        );
        bus.publish(LINKING_TOPIC, envelope.clone()).unwrap();

        let got_a = tokio::time::timeout(Duration::from_secs(1), a.recv()).await.unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(1), b.recv()).await.unwrap();
        assert_eq!(got_a, Some(envelope.clone()));
        assert_eq!(got_b, Some(envelope));
    }

    #[test]
    fn test_publish_without_subscribers_records_warning() {
        let bus = InProcessBus::new();
        let tracker = ProgressTracker::new(5, Duration::from_secs(60));
        tracker.register("job", 1);

        let publisher = LinkPublisher::new(&bus, &tracker, "job", "owner");
        let delivered = publisher.publish(LinkEvent::ExpenseCreatedWithExistingBudgets {
            new_expense_id: "ne".to_string(),
            budget_ids: vec!["nb".to_string()],
        });

        assert!(!delivered);
        assert_eq!(tracker.pending_links("job"), 0);
        assert_eq!(tracker.warnings("job").len(), 1);
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe(LINKING_TOPIC);
        drop(rx);

        let envelope = LinkEnvelope::new(
            "job",
            "owner",
            LinkEvent::ExpenseCreatedWithExistingBudgets {
                new_expense_id: "ne".to_string(),
                budget_ids: vec![],
            },
        );
        assert_eq!(bus.publish(LINKING_TOPIC, envelope), Err(BusError::Closed));
        assert_eq!(bus.subscriber_count(LINKING_TOPIC), 0);
    }
}

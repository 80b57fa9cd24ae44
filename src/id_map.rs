// 🔁 Identifier Map - old (source) id -> new (store) id
//
// One map per mapping request. Writers are the batch workers of both phases,
// readers are the workers and the link reconciler. DashMap shards the key
// space so unrelated batches never contend on a single lock.

use crate::model::{EntityId, OldId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Expense,
    Budget,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Expense => "expense",
            EntityKind::Budget => "budget",
        }
    }

    pub fn counterpart(&self) -> EntityKind {
        match self {
            EntityKind::Expense => EntityKind::Budget,
            EntityKind::Budget => EntityKind::Expense,
        }
    }
}

#[derive(Debug, Default)]
pub struct IdentifierMap {
    expenses: DashMap<OldId, EntityId>,
    budgets: DashMap<OldId, EntityId>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: EntityKind) -> &DashMap<OldId, EntityId> {
        match kind {
            EntityKind::Expense => &self.expenses,
            EntityKind::Budget => &self.budgets,
        }
    }

    /// Record `old -> new`. First writer wins; returns whether this call was
    /// the first writer. A losing write leaves the existing mapping untouched.
    pub fn put(&self, kind: EntityKind, old_id: &str, new_id: &str) -> bool {
        match self.table(kind).entry(old_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(new_id.to_string());
                true
            }
        }
    }

    /// `None` means "not created yet", which is an expected transient state.
    pub fn get(&self, kind: EntityKind, old_id: &str) -> Option<EntityId> {
        self.table(kind).get(old_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, kind: EntityKind, old_id: &str) -> bool {
        self.table(kind).contains_key(old_id)
    }

    /// Split `old_ids` into (resolved new ids, still-unknown old ids).
    pub fn resolve_all<'a, I>(&self, kind: EntityKind, old_ids: I) -> (Vec<EntityId>, Vec<OldId>)
    where
        I: IntoIterator<Item = &'a OldId>,
    {
        let mut resolved = Vec::new();
        let mut pending = Vec::new();

        for old_id in old_ids {
            match self.get(kind, old_id) {
                Some(new_id) => resolved.push(new_id),
                None => pending.push(old_id.clone()),
            }
        }

        (resolved, pending)
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.table(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.expenses.is_empty() && self.budgets.is_empty()
    }
}

// 🗄️ Entity Store - where migrated expenses and budgets land
//
// The pipeline only needs a narrow surface: create inside a transactional
// batch, bulk insert, read back, merge link sets, look up categories.
// Two backends:
// - InMemoryStore: sharded maps + fault injection (tests, dry runs)
// - SqliteStore: rusqlite, WAL mode, link table with set semantics

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::id_map::EntityKind;
use crate::model::{EntityId, ExpenseType, OwnerId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

// ============================================================================
// RECORDS
// ============================================================================

/// A validated expense ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExpense {
    pub owner_id: OwnerId,
    pub date: NaiveDate,
    pub category: String,
    pub name: String,
    pub amount: f64,
    pub expense_type: ExpenseType,
    pub payment_method: String,
    pub net_amount: f64,
    pub comments: Option<String>,
    pub credit_due: f64,
    /// Dedup key, see [`fingerprint`]
    pub fingerprint: String,
}

/// A validated budget ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBudget {
    pub owner_id: OwnerId,
    pub name: String,
    pub description: Option<String>,
    pub amount: f64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub remaining_amount: f64,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExpense {
    pub id: EntityId,
    pub owner_id: OwnerId,
    pub date: NaiveDate,
    pub category: String,
    pub name: String,
    pub amount: f64,
    pub expense_type: ExpenseType,
    pub payment_method: String,
    pub net_amount: f64,
    pub comments: Option<String>,
    pub credit_due: f64,
    pub budget_ids: BTreeSet<EntityId>,
}

impl StoredExpense {
    pub(crate) fn from_new(id: EntityId, record: &NewExpense) -> Self {
        StoredExpense {
            id,
            owner_id: record.owner_id.clone(),
            date: record.date,
            category: record.category.clone(),
            name: record.name.clone(),
            amount: record.amount,
            expense_type: record.expense_type,
            payment_method: record.payment_method.clone(),
            net_amount: record.net_amount,
            comments: record.comments.clone(),
            credit_due: record.credit_due,
            budget_ids: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBudget {
    pub id: EntityId,
    pub owner_id: OwnerId,
    pub name: String,
    pub description: Option<String>,
    pub amount: f64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub remaining_amount: f64,
    pub expense_ids: BTreeSet<EntityId>,
}

impl StoredBudget {
    pub(crate) fn from_new(id: EntityId, record: &NewBudget) -> Self {
        StoredBudget {
            id,
            owner_id: record.owner_id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            amount: record.amount,
            start_date: record.start_date,
            end_date: record.end_date,
            remaining_amount: record.remaining_amount,
            expense_ids: BTreeSet::new(),
        }
    }
}

/// Outcome of one row of a bulk insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inserted {
    pub id: EntityId,
    /// false when the fingerprint already existed and `id` is the existing row
    pub created: bool,
}

// ============================================================================
// TRAITS
// ============================================================================

/// A transactional unit of work. Nothing created through it is visible until
/// `commit` succeeds; dropping it uncommitted discards everything.
pub trait BatchUnit {
    fn create_expense(&mut self, record: &NewExpense) -> Result<EntityId, StoreError>;

    fn create_budget(&mut self, record: &NewBudget) -> Result<EntityId, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

pub trait EntityStore: Send + Sync {
    fn begin_batch(&self) -> Result<Box<dyn BatchUnit + '_>, StoreError>;

    /// Single-record create in its own unit of work.
    fn create_expense(&self, record: &NewExpense) -> Result<EntityId, StoreError> {
        let mut unit = self.begin_batch()?;
        let id = unit.create_expense(record)?;
        unit.commit()?;
        Ok(id)
    }

    fn create_budget(&self, record: &NewBudget) -> Result<EntityId, StoreError> {
        let mut unit = self.begin_batch()?;
        let id = unit.create_budget(record)?;
        unit.commit()?;
        Ok(id)
    }

    /// Throughput path: one statement-level pass with no per-record unit of
    /// work. All rows land or none do.
    fn bulk_insert_expenses(&self, records: &[NewExpense]) -> Result<Vec<Inserted>, StoreError>;

    fn get_expense(&self, id: &str) -> Result<Option<StoredExpense>, StoreError>;

    fn get_budget(&self, id: &str) -> Result<Option<StoredBudget>, StoreError>;

    /// Merge `budget_ids` into the expense's link set. Returns whether
    /// anything changed.
    fn update_expense_links(&self, id: &str, budget_ids: &[EntityId]) -> Result<bool, StoreError>;

    /// Merge `expense_ids` into the budget's link set. Returns whether
    /// anything changed.
    fn update_budget_links(&self, id: &str, expense_ids: &[EntityId]) -> Result<bool, StoreError>;

    /// Case-insensitive lookup of an owner's category by name.
    fn lookup_category(&self, owner_id: &str, name: &str) -> Result<Option<String>, StoreError>;

    fn exists(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        match kind {
            EntityKind::Expense => Ok(self.get_expense(id)?.is_some()),
            EntityKind::Budget => Ok(self.get_budget(id)?.is_some()),
        }
    }
}

/// Dedup key for a migrated record: SHA-256 over owner, kind and old id.
/// Recreating the same source record for the same owner yields the same key,
/// so a resubmitted request is detected by the store even across jobs.
pub fn fingerprint(owner_id: &str, kind: EntityKind, old_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}\u{1f}{}\u{1f}{}", owner_id, kind.as_str(), old_id));
    format!("{:x}", hasher.finalize())
}

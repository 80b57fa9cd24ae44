// 🧠 In-memory entity store
//
// Sharded maps for entities, a fingerprint index for dedup, and a commit lock
// so two units never publish the same fingerprint. Fault injection knobs
// simulate an unreachable or flaky store.

use super::{BatchUnit, EntityStore, Inserted, NewBudget, NewExpense, StoredBudget, StoredExpense};
use crate::error::StoreError;
use crate::model::{EntityId, OwnerId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct InMemoryStore {
    expenses: DashMap<EntityId, StoredExpense>,
    budgets: DashMap<EntityId, StoredBudget>,
    fingerprints: DashMap<String, EntityId>,
    /// owner -> (lowercased name -> canonical name)
    categories: DashMap<OwnerId, HashMap<String, String>>,
    commit_lock: Mutex<()>,

    // fault injection
    unavailable: AtomicBool,
    create_countdown: AtomicUsize,
    failing_commits: AtomicUsize,
    failing_budget_links: AtomicUsize,

    create_calls: AtomicUsize,
    commits: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            expenses: DashMap::new(),
            budgets: DashMap::new(),
            fingerprints: DashMap::new(),
            categories: DashMap::new(),
            commit_lock: Mutex::new(()),
            unavailable: AtomicBool::new(false),
            create_countdown: AtomicUsize::new(0),
            failing_commits: AtomicUsize::new(0),
            failing_budget_links: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    pub fn add_category(&self, owner_id: &str, name: &str) {
        self.categories
            .entry(owner_id.to_string())
            .or_default()
            .insert(name.to_lowercase(), name.to_string());
    }

    // ========================================================================
    // FAULT INJECTION
    // ========================================================================

    /// Every operation fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The `n`-th create call from now fails with `Unavailable`, once.
    pub fn fail_nth_create(&self, n: usize) {
        self.create_countdown.store(n, Ordering::SeqCst);
    }

    /// The next `n` commits fail with `Unavailable`.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// The next `n` budget-side link updates fail with `Unavailable`.
    pub fn fail_next_budget_link_updates(&self, n: usize) {
        self.failing_budget_links.store(n, Ordering::SeqCst);
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn expense_count(&self) -> usize {
        self.expenses.len()
    }

    pub fn budget_count(&self) -> usize {
        self.budgets.len()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Total number of (expense, budget) links, counted from the expense side.
    pub fn link_count(&self) -> usize {
        self.expenses.iter().map(|e| e.budget_ids.len()).sum()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn trip_create_fault(&self) -> bool {
        self.create_countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .unwrap_or(false)
    }

    fn trip_commit_fault(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(&self, staged: Vec<Staged>) -> Result<(), StoreError> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("commit lock poisoned".to_string()))?;

        // Another unit may have committed the same source record meanwhile.
        if staged.iter().any(|s| self.fingerprints.contains_key(s.fingerprint())) {
            return Err(StoreError::Unavailable(
                "conflicting concurrent commit".to_string(),
            ));
        }

        for item in staged {
            match item {
                Staged::Expense(expense, fp) => {
                    self.fingerprints.insert(fp, expense.id.clone());
                    self.expenses.insert(expense.id.clone(), expense);
                }
                Staged::Budget(budget, fp) => {
                    self.fingerprints.insert(fp, budget.id.clone());
                    self.budgets.insert(budget.id.clone(), budget);
                }
            }
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

enum Staged {
    Expense(StoredExpense, String),
    Budget(StoredBudget, String),
}

impl Staged {
    fn fingerprint(&self) -> &str {
        match self {
            Staged::Expense(_, fp) | Staged::Budget(_, fp) => fp,
        }
    }
}

struct MemoryUnit<'a> {
    store: &'a InMemoryStore,
    staged: Vec<Staged>,
}

impl MemoryUnit<'_> {
    fn precheck(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.store.check_available()?;
        self.store.create_calls.fetch_add(1, Ordering::SeqCst);

        if self.store.trip_create_fault() {
            return Err(StoreError::Unavailable("injected create failure".to_string()));
        }

        if let Some(existing) = self.store.fingerprints.get(fingerprint) {
            return Err(StoreError::Duplicate {
                existing_id: existing.value().clone(),
            });
        }

        if let Some(staged) = self.staged.iter().find(|s| s.fingerprint() == fingerprint) {
            let existing_id = match staged {
                Staged::Expense(e, _) => e.id.clone(),
                Staged::Budget(b, _) => b.id.clone(),
            };
            return Err(StoreError::Duplicate { existing_id });
        }

        Ok(())
    }
}

impl BatchUnit for MemoryUnit<'_> {
    fn create_expense(&mut self, record: &NewExpense) -> Result<EntityId, StoreError> {
        self.precheck(&record.fingerprint)?;

        let id = uuid::Uuid::new_v4().to_string();
        self.staged.push(Staged::Expense(
            StoredExpense::from_new(id.clone(), record),
            record.fingerprint.clone(),
        ));
        Ok(id)
    }

    fn create_budget(&mut self, record: &NewBudget) -> Result<EntityId, StoreError> {
        self.precheck(&record.fingerprint)?;

        let id = uuid::Uuid::new_v4().to_string();
        self.staged.push(Staged::Budget(
            StoredBudget::from_new(id.clone(), record),
            record.fingerprint.clone(),
        ));
        Ok(id)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.store.check_available()?;
        if self.store.trip_commit_fault() {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        let unit = *self;
        unit.store.apply(unit.staged)
    }
}

impl EntityStore for InMemoryStore {
    fn begin_batch(&self) -> Result<Box<dyn BatchUnit + '_>, StoreError> {
        self.check_available()?;
        Ok(Box::new(MemoryUnit {
            store: self,
            staged: Vec::new(),
        }))
    }

    fn bulk_insert_expenses(&self, records: &[NewExpense]) -> Result<Vec<Inserted>, StoreError> {
        self.check_available()?;

        let mut staged = Vec::new();
        let mut outcome = Vec::with_capacity(records.len());

        for record in records {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.trip_create_fault() {
                return Err(StoreError::Unavailable("injected create failure".to_string()));
            }

            let existing = self
                .fingerprints
                .get(&record.fingerprint)
                .map(|e| e.value().clone())
                .or_else(|| {
                    staged.iter().find_map(|s| match s {
                        Staged::Expense(e, fp) if *fp == record.fingerprint => Some(e.id.clone()),
                        _ => None,
                    })
                });
            if let Some(id) = existing {
                outcome.push(Inserted { id, created: false });
                continue;
            }

            let id = uuid::Uuid::new_v4().to_string();
            staged.push(Staged::Expense(
                StoredExpense::from_new(id.clone(), record),
                record.fingerprint.clone(),
            ));
            outcome.push(Inserted { id, created: true });
        }

        self.apply(staged)?;
        Ok(outcome)
    }

    fn get_expense(&self, id: &str) -> Result<Option<StoredExpense>, StoreError> {
        self.check_available()?;
        Ok(self.expenses.get(id).map(|e| e.value().clone()))
    }

    fn get_budget(&self, id: &str) -> Result<Option<StoredBudget>, StoreError> {
        self.check_available()?;
        Ok(self.budgets.get(id).map(|b| b.value().clone()))
    }

    fn update_expense_links(&self, id: &str, budget_ids: &[EntityId]) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut expense = self.expenses.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "expense",
            id: id.to_string(),
        })?;

        let mut changed = false;
        for budget_id in budget_ids {
            changed |= expense.budget_ids.insert(budget_id.clone());
        }
        Ok(changed)
    }

    fn update_budget_links(&self, id: &str, expense_ids: &[EntityId]) -> Result<bool, StoreError> {
        self.check_available()?;
        if self
            .failing_budget_links
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("budget link update failed".to_string()));
        }
        let mut budget = self.budgets.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "budget",
            id: id.to_string(),
        })?;

        let mut changed = false;
        for expense_id in expense_ids {
            changed |= budget.expense_ids.insert(expense_id.clone());
        }
        Ok(changed)
    }

    fn lookup_category(&self, owner_id: &str, name: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self
            .categories
            .get(owner_id)
            .and_then(|names| names.get(&name.to_lowercase()).cloned()))
    }
}

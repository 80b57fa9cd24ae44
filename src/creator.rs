// 🏗️ Entity Creator - validate one source record and persist it
//
// Required fields: name, amount, date, payment method (expenses) and a sane
// date range (budgets). Amounts must be non-negative. Category and payment
// method are resolved best-effort and fall back to "Others"; resolution never
// fails a creation.

use crate::error::{CreationError, StoreError, ValidationError};
use crate::id_map::EntityKind;
use crate::model::{BudgetRecord, EntityId, ExpenseRecord, ExpenseType};
use crate::store::{fingerprint, EntityStore, NewBudget, NewExpense};
use dashmap::DashMap;
use tracing::{debug, warn};

pub const DEFAULT_CATEGORY: &str = "Others";
pub const DEFAULT_PAYMENT_METHOD: &str = "Others";

/// Canonical payment methods understood by the target system.
const KNOWN_PAYMENT_METHODS: [&str; 8] = [
    "cash",
    "creditCard",
    "debitCard",
    "upi",
    "netBanking",
    "bankTransfer",
    "cheque",
    "wallet",
];

// ============================================================================
// JOB-SCOPED LOOKUP CACHE
// ============================================================================

/// Category resolutions for one job. Lives in the job context and is
/// dropped with it, so concurrent jobs never see each other's entries.
#[derive(Debug, Default)]
pub struct LookupCache {
    /// (owner, lowercased hint) -> resolved category name
    categories: DashMap<(String, String), String>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

// ============================================================================
// ENTITY CREATOR
// ============================================================================

pub struct EntityCreator<'a> {
    store: &'a dyn EntityStore,
    cache: &'a LookupCache,
}

impl<'a> EntityCreator<'a> {
    pub fn new(store: &'a dyn EntityStore, cache: &'a LookupCache) -> Self {
        EntityCreator { store, cache }
    }

    /// Validate and create one expense in its own unit of work.
    pub fn create_expense(
        &self,
        owner_id: &str,
        record: &ExpenseRecord,
    ) -> Result<EntityId, CreationError> {
        let draft = self.prepare_expense(owner_id, record)?;
        Ok(self.store.create_expense(&draft)?)
    }

    /// Validate and create one budget in its own unit of work.
    pub fn create_budget(
        &self,
        owner_id: &str,
        record: &BudgetRecord,
    ) -> Result<EntityId, CreationError> {
        let draft = self.prepare_budget(owner_id, record)?;
        Ok(self.store.create_budget(&draft)?)
    }

    /// Validate an expense and resolve its lookups. Batches prepare every
    /// record before opening their unit of work, so lookups never run while
    /// the unit holds the store.
    pub fn prepare_expense(
        &self,
        owner_id: &str,
        record: &ExpenseRecord,
    ) -> Result<NewExpense, ValidationError> {
        let details = &record.expense;

        let name = required_text("expense.expenseName", details.expense_name.as_deref())?;
        let amount = non_negative("expense.amount", details.amount)?;
        let date = record.date.ok_or_else(|| ValidationError::missing("date"))?;
        let payment_method =
            required_text("expense.paymentMethod", details.payment_method.as_deref())?;

        Ok(NewExpense {
            owner_id: owner_id.to_string(),
            date,
            category: self.resolve_category(owner_id, record.category.as_deref()),
            name,
            amount,
            expense_type: details.expense_type.unwrap_or(ExpenseType::Loss),
            payment_method: normalize_payment_method(&payment_method),
            net_amount: details.net_amount.unwrap_or(amount),
            comments: details.comments.clone().filter(|c| !c.trim().is_empty()),
            credit_due: details.credit_due.unwrap_or(0.0),
            fingerprint: fingerprint(owner_id, EntityKind::Expense, &record.old_id),
        })
    }

    pub fn prepare_budget(
        &self,
        owner_id: &str,
        record: &BudgetRecord,
    ) -> Result<NewBudget, ValidationError> {
        let name = required_text("name", record.name.as_deref())?;
        let amount = non_negative("amount", record.amount)?;
        let start_date = record
            .start_date
            .ok_or_else(|| ValidationError::missing("startDate"))?;
        let end_date = record
            .end_date
            .ok_or_else(|| ValidationError::missing("endDate"))?;

        if end_date < start_date {
            return Err(ValidationError::new(
                "endDate",
                format!("{} is before start date {}", end_date, start_date),
            ));
        }

        Ok(NewBudget {
            owner_id: owner_id.to_string(),
            name,
            description: record.description.clone().filter(|d| !d.trim().is_empty()),
            amount,
            start_date,
            end_date,
            remaining_amount: record.remaining_amount.unwrap_or(amount),
            fingerprint: fingerprint(owner_id, EntityKind::Budget, &record.old_id),
        })
    }

    /// Resolve a category hint for `owner_id`, falling back to "Others".
    /// Store errors are logged and not cached, so a later record may retry.
    pub fn resolve_category(&self, owner_id: &str, hint: Option<&str>) -> String {
        let hint = match hint.map(str::trim).filter(|h| !h.is_empty()) {
            Some(h) => h,
            None => return DEFAULT_CATEGORY.to_string(),
        };

        let key = (owner_id.to_string(), hint.to_lowercase());
        if let Some(cached) = self.cache.categories.get(&key) {
            return cached.value().clone();
        }

        let resolved = match self.store.lookup_category(owner_id, hint) {
            Ok(Some(name)) => name,
            Ok(None) => {
                debug!(owner_id, hint, "unknown category, using default");
                DEFAULT_CATEGORY.to_string()
            }
            Err(e) => {
                warn!(owner_id, hint, error = %e, "category lookup failed, using default");
                return DEFAULT_CATEGORY.to_string();
            }
        };

        self.cache.categories.insert(key, resolved.clone());
        resolved
    }
}

fn required_text(field: &str, value: Option<&str>) -> Result<String, ValidationError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ValidationError::missing(field)),
    }
}

fn non_negative(field: &str, value: Option<f64>) -> Result<f64, ValidationError> {
    let value = value.ok_or_else(|| ValidationError::missing(field))?;
    if !value.is_finite() {
        return Err(ValidationError::new(field, "must be a finite number"));
    }
    if value < 0.0 {
        return Err(ValidationError::new(field, format!("must not be negative (got {})", value)));
    }
    Ok(value)
}

/// Map free-text payment methods onto the canonical list ("Credit Card",
/// "credit_card" -> "creditCard"); anything unknown becomes "Others".
pub fn normalize_payment_method(raw: &str) -> String {
    let squashed: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    KNOWN_PAYMENT_METHODS
        .iter()
        .find(|known| known.to_lowercase() == squashed)
        .map(|known| known.to_string())
        .unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string())
}

/// Classify a creation failure for reporting.
pub fn describe_failure(err: &CreationError) -> String {
    match err {
        CreationError::Validation(v) => format!("ValidationError: {}", v),
        CreationError::Store(StoreError::Duplicate { existing_id }) => {
            format!("DuplicateSkipped: already migrated as {}", existing_id)
        }
        CreationError::Store(s) => format!("StoreError: {}", s),
    }
}

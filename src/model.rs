// 📦 Mapping request / result wire types
//
// A mapping request is a previously exported set of expenses and budgets
// that must be recreated under a new owner. Cross-references between the two
// use OLD (source-system) ids and say nothing about creation order.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Source-system identifier, only meaningful for remapping.
pub type OldId = String;

/// Identifier assigned by the entity store.
pub type EntityId = String;

pub type OwnerId = String;

// ============================================================================
// SOURCE RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseType {
    Gain,
    Loss,
}

impl ExpenseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseType::Gain => "gain",
            ExpenseType::Loss => "loss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseDetails {
    #[serde(default)]
    pub expense_name: Option<String>,

    #[serde(default)]
    pub amount: Option<f64>,

    #[serde(rename = "type", default)]
    pub expense_type: Option<ExpenseType>,

    #[serde(default)]
    pub payment_method: Option<String>,

    #[serde(default)]
    pub net_amount: Option<f64>,

    #[serde(default)]
    pub comments: Option<String>,

    #[serde(default)]
    pub credit_due: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseRecord {
    #[serde(rename = "id")]
    pub old_id: OldId,

    #[serde(default)]
    pub date: Option<NaiveDate>,

    /// Free-text category from the source system (resolved best-effort)
    #[serde(default)]
    pub category: Option<String>,

    pub expense: ExpenseDetails,

    /// Budgets this expense belonged to, by OLD budget id
    #[serde(default)]
    pub budget_ids: BTreeSet<OldId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetRecord {
    #[serde(rename = "id")]
    pub old_id: OldId,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub amount: Option<f64>,

    /// Inclusive
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    /// Inclusive
    #[serde(default)]
    pub end_date: Option<NaiveDate>,

    #[serde(default)]
    pub remaining_amount: Option<f64>,

    /// Expenses linked to this budget, by OLD expense id
    #[serde(default)]
    pub expense_ids: BTreeSet<OldId>,
}

// ============================================================================
// REQUEST
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingGroup {
    /// Overrides the request-level owner for this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,

    #[serde(default)]
    pub expenses: Vec<ExpenseRecord>,

    #[serde(default)]
    pub budgets: Vec<BudgetRecord>,
}

impl MappingGroup {
    pub fn item_count(&self) -> usize {
        self.expenses.len() + self.budgets.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,

    #[serde(default)]
    pub mappings: Vec<MappingGroup>,
}

impl MappingRequest {
    pub fn total_items(&self) -> usize {
        self.mappings.iter().map(MappingGroup::item_count).sum()
    }

    pub fn total_expenses(&self) -> usize {
        self.mappings.iter().map(|g| g.expenses.len()).sum()
    }
}

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    Created,
    DuplicateSkipped,
    ValidationFailed,
    StoreFailed,
}

impl ItemStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemStatus::Created | ItemStatus::DuplicateSkipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetMapping {
    pub old_budget_id: OldId,
    pub new_budget_id: Option<EntityId>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseResult {
    pub old_expense_id: OldId,
    pub new_expense_id: Option<EntityId>,
    pub budget_mappings: Vec<BudgetMapping>,
    pub success: bool,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetResult {
    pub old_budget_id: OldId,
    pub new_budget_id: Option<EntityId>,
    pub success: bool,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkWarning {
    /// Entity whose link could not be completed
    pub entity_id: EntityId,
    /// The old id that never resolved
    pub unresolved_old_id: OldId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingResult {
    pub job_id: String,
    pub success: bool,
    pub total_processed: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub results: Vec<ExpenseResult>,
    pub budget_results: Vec<BudgetResult>,
    pub warnings: Vec<LinkWarning>,
}

impl MappingResult {
    pub fn summary(&self) -> String {
        format!(
            "Mapped {} records: {} succeeded ({} skipped as duplicates), {} failed, {} link warnings",
            self.total_processed,
            self.success_count,
            self.skipped_count,
            self.failure_count,
            self.warnings.len()
        )
    }
}

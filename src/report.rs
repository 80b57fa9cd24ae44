// 📄 Result export - JSON and CSV renditions of a MappingResult

use crate::model::{ItemStatus, MappingResult};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// One flattened row per migrated record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub kind: &'static str,
    pub old_id: String,
    pub new_id: String,
    pub status: ItemStatus,
    pub success: bool,
    /// `;`-separated new budget ids (expenses only)
    pub linked_budgets: String,
    pub error_message: String,
}

pub fn rows(result: &MappingResult) -> Vec<ReportRow> {
    let budgets = result.budget_results.iter().map(|b| ReportRow {
        kind: "budget",
        old_id: b.old_budget_id.clone(),
        new_id: b.new_budget_id.clone().unwrap_or_default(),
        status: b.status,
        success: b.success,
        linked_budgets: String::new(),
        error_message: b.error_message.clone().unwrap_or_default(),
    });

    let expenses = result.results.iter().map(|e| ReportRow {
        kind: "expense",
        old_id: e.old_expense_id.clone(),
        new_id: e.new_expense_id.clone().unwrap_or_default(),
        status: e.status,
        success: e.success,
        linked_budgets: e
            .budget_mappings
            .iter()
            .filter_map(|m| m.new_budget_id.as_deref())
            .collect::<Vec<_>>()
            .join(";"),
        error_message: e.error_message.clone().unwrap_or_default(),
    });

    budgets.chain(expenses).collect()
}

pub fn write_csv<W: Write>(writer: W, result: &MappingResult) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for row in rows(result) {
        csv.serialize(row).context("Failed to write CSV row")?;
    }
    csv.flush().context("Failed to flush CSV output")?;
    Ok(())
}

pub fn export_csv(path: &Path, result: &MappingResult) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_csv(file, result)
}

pub fn export_json(path: &Path, result: &MappingResult) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, result)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BudgetMapping, BudgetResult, ExpenseResult};

    fn sample() -> MappingResult {
        MappingResult {
            job_id: "job".to_string(),
            success: false,
            total_processed: 2,
            success_count: 1,
            failure_count: 1,
            skipped_count: 0,
            budget_results: vec![BudgetResult {
                old_budget_id: "B1".to_string(),
                new_budget_id: Some("nb1".to_string()),
                success: true,
                status: ItemStatus::Created,
                error_message: None,
            }],
            results: vec![ExpenseResult {
                old_expense_id: "E1".to_string(),
                new_expense_id: None,
                budget_mappings: vec![BudgetMapping {
                    old_budget_id: "B1".to_string(),
                    new_budget_id: Some("nb1".to_string()),
                    success: false,
                }],
                success: false,
                status: ItemStatus::ValidationFailed,
                error_message: Some("ValidationError: date: is required".to_string()),
            }],
            warnings: vec![],
        }
    }

    #[test]
    fn test_csv_export() {
        let mut out = Vec::new();
        write_csv(&mut out, &sample()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "kind,old_id,new_id,status,success,linked_budgets,error_message"
        );
        assert_eq!(lines[1], "budget,B1,nb1,created,true,,");
        assert!(lines[2].starts_with("expense,E1,,validationFailed,false,nb1,"));

        println!("✅ CSV export test passed");
    }
}

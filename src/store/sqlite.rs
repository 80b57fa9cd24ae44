// 🗃️ SQLite entity store
//
// Same conventions as the rest of the schema work: WAL mode for crash
// recovery, an idempotency_hash column with a UNIQUE constraint for duplicate
// detection, and a link table whose composite primary key gives set
// semantics for expense <-> budget relationships.

use super::{BatchUnit, EntityStore, Inserted, NewBudget, NewExpense, StoredBudget, StoredExpense};
use crate::error::StoreError;
use crate::model::{EntityId, ExpenseType};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn).context("Failed to set up migration schema")?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn add_category(&self, owner_id: &str, name: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO categories (owner_id, name) VALUES (?1, ?2)",
            params![owner_id, name],
        )?;
        Ok(())
    }

    pub fn count(&self, table: Table) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Expenses,
    Budgets,
    Links,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Expenses => "expenses",
            Table::Budgets => "budgets",
            Table::Links => "expense_budget_links",
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (no-op for in-memory databases)
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS expenses (
            id TEXT PRIMARY KEY,
            idempotency_hash TEXT UNIQUE NOT NULL,
            owner_id TEXT NOT NULL,
            date TEXT NOT NULL,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            amount REAL NOT NULL,
            expense_type TEXT NOT NULL,
            payment_method TEXT NOT NULL,
            net_amount REAL NOT NULL,
            comments TEXT,
            credit_due REAL NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS budgets (
            id TEXT PRIMARY KEY,
            idempotency_hash TEXT UNIQUE NOT NULL,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            amount REAL NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            remaining_amount REAL NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS expense_budget_links (
            expense_id TEXT NOT NULL REFERENCES expenses(id),
            budget_id TEXT NOT NULL REFERENCES budgets(id),
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (expense_id, budget_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS categories (
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (owner_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_budget ON expense_budget_links(budget_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_owner ON expenses(owner_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

const INSERT_EXPENSE: &str = "INSERT INTO expenses (
        id, idempotency_hash, owner_id, date, category, name, amount,
        expense_type, payment_method, net_amount, comments, credit_due
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const INSERT_BUDGET: &str = "INSERT INTO budgets (
        id, idempotency_hash, owner_id, name, description, amount,
        start_date, end_date, remaining_amount
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn existing_id(conn: &Connection, table: Table, hash: &str) -> Result<Option<EntityId>, StoreError> {
    let sql = format!("SELECT id FROM {} WHERE idempotency_hash = ?1", table.name());
    let id = conn
        .query_row(&sql, params![hash], |row| row.get(0))
        .optional()?;
    Ok(id)
}

fn insert_expense(conn: &Connection, record: &NewExpense) -> Result<EntityId, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let result = conn.prepare_cached(INSERT_EXPENSE)?.execute(params![
        id,
        record.fingerprint,
        record.owner_id,
        record.date.to_string(),
        record.category,
        record.name,
        record.amount,
        record.expense_type.as_str(),
        record.payment_method,
        record.net_amount,
        record.comments,
        record.credit_due,
    ]);

    match result {
        Ok(_) => Ok(id),
        Err(e) if is_constraint_violation(&e) => {
            match existing_id(conn, Table::Expenses, &record.fingerprint)? {
                Some(existing_id) => Err(StoreError::Duplicate { existing_id }),
                None => Err(StoreError::Rejected(e.to_string())),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn insert_budget(conn: &Connection, record: &NewBudget) -> Result<EntityId, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let result = conn.prepare_cached(INSERT_BUDGET)?.execute(params![
        id,
        record.fingerprint,
        record.owner_id,
        record.name,
        record.description,
        record.amount,
        record.start_date.to_string(),
        record.end_date.to_string(),
        record.remaining_amount,
    ]);

    match result {
        Ok(_) => Ok(id),
        Err(e) if is_constraint_violation(&e) => {
            match existing_id(conn, Table::Budgets, &record.fingerprint)? {
                Some(existing_id) => Err(StoreError::Duplicate { existing_id }),
                None => Err(StoreError::Rejected(e.to_string())),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_date(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    raw.parse::<NaiveDate>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_expense_type(idx: usize, raw: String) -> rusqlite::Result<ExpenseType> {
    match raw.as_str() {
        "gain" => Ok(ExpenseType::Gain),
        "loss" => Ok(ExpenseType::Loss),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown expense type {}", other).into(),
        )),
    }
}

fn linked_ids(conn: &Connection, sql: &str, id: &str) -> Result<BTreeSet<EntityId>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let ids = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

// ============================================================================
// BATCH UNIT
// ============================================================================

struct SqliteUnit<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl BatchUnit for SqliteUnit<'_> {
    fn create_expense(&mut self, record: &NewExpense) -> Result<EntityId, StoreError> {
        insert_expense(&self.conn, record)
    }

    fn create_budget(&mut self, record: &NewBudget) -> Result<EntityId, StoreError> {
        insert_budget(&self.conn, record)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| StoreError::Unavailable(format!("commit failed: {}", e)))?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteUnit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "rollback of abandoned batch failed");
            }
        }
    }
}

// ============================================================================
// ENTITY STORE
// ============================================================================

impl EntityStore for SqliteStore {
    fn begin_batch(&self) -> Result<Box<dyn BatchUnit + '_>, StoreError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| StoreError::Unavailable(format!("begin failed: {}", e)))?;
        Ok(Box::new(SqliteUnit {
            conn,
            finished: false,
        }))
    }

    fn bulk_insert_expenses(&self, records: &[NewExpense]) -> Result<Vec<Inserted>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Unavailable(format!("begin failed: {}", e)))?;

        let mut outcome = Vec::with_capacity(records.len());
        for record in records {
            if let Some(id) = existing_id(&tx, Table::Expenses, &record.fingerprint)? {
                outcome.push(Inserted { id, created: false });
                continue;
            }
            let id = insert_expense(&tx, record)?;
            outcome.push(Inserted { id, created: true });
        }

        tx.commit()
            .map_err(|e| StoreError::Unavailable(format!("commit failed: {}", e)))?;
        Ok(outcome)
    }

    fn get_expense(&self, id: &str) -> Result<Option<StoredExpense>, StoreError> {
        let conn = self.lock()?;
        let expense = conn
            .query_row(
                "SELECT id, owner_id, date, category, name, amount, expense_type,
                        payment_method, net_amount, comments, credit_due
                 FROM expenses WHERE id = ?1",
                params![id],
                |row| {
                    Ok(StoredExpense {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        date: parse_date(2, row.get(2)?)?,
                        category: row.get(3)?,
                        name: row.get(4)?,
                        amount: row.get(5)?,
                        expense_type: parse_expense_type(6, row.get(6)?)?,
                        payment_method: row.get(7)?,
                        net_amount: row.get(8)?,
                        comments: row.get(9)?,
                        credit_due: row.get(10)?,
                        budget_ids: BTreeSet::new(),
                    })
                },
            )
            .optional()?;

        match expense {
            Some(mut expense) => {
                expense.budget_ids = linked_ids(
                    &conn,
                    "SELECT budget_id FROM expense_budget_links WHERE expense_id = ?1",
                    id,
                )?;
                Ok(Some(expense))
            }
            None => Ok(None),
        }
    }

    fn get_budget(&self, id: &str) -> Result<Option<StoredBudget>, StoreError> {
        let conn = self.lock()?;
        let budget = conn
            .query_row(
                "SELECT id, owner_id, name, description, amount, start_date, end_date,
                        remaining_amount
                 FROM budgets WHERE id = ?1",
                params![id],
                |row| {
                    Ok(StoredBudget {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        amount: row.get(4)?,
                        start_date: parse_date(5, row.get(5)?)?,
                        end_date: parse_date(6, row.get(6)?)?,
                        remaining_amount: row.get(7)?,
                        expense_ids: BTreeSet::new(),
                    })
                },
            )
            .optional()?;

        match budget {
            Some(mut budget) => {
                budget.expense_ids = linked_ids(
                    &conn,
                    "SELECT expense_id FROM expense_budget_links WHERE budget_id = ?1",
                    id,
                )?;
                Ok(Some(budget))
            }
            None => Ok(None),
        }
    }

    fn update_expense_links(&self, id: &str, budget_ids: &[EntityId]) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        if existing_row(&conn, Table::Expenses, id)?.is_none() {
            return Err(StoreError::NotFound {
                kind: "expense",
                id: id.to_string(),
            });
        }

        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO expense_budget_links (expense_id, budget_id) VALUES (?1, ?2)",
        )?;
        let mut inserted = 0;
        for budget_id in budget_ids {
            inserted += stmt.execute(params![id, budget_id])?;
        }
        Ok(inserted > 0)
    }

    fn update_budget_links(&self, id: &str, expense_ids: &[EntityId]) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        if existing_row(&conn, Table::Budgets, id)?.is_none() {
            return Err(StoreError::NotFound {
                kind: "budget",
                id: id.to_string(),
            });
        }

        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO expense_budget_links (expense_id, budget_id) VALUES (?1, ?2)",
        )?;
        let mut inserted = 0;
        for expense_id in expense_ids {
            inserted += stmt.execute(params![expense_id, id])?;
        }
        Ok(inserted > 0)
    }

    fn lookup_category(&self, owner_id: &str, name: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT name FROM categories WHERE owner_id = ?1 AND lower(name) = lower(?2)",
                params![owner_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found)
    }
}

fn existing_row(conn: &Connection, table: Table, id: &str) -> Result<Option<i64>, StoreError> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1", table.name());
    let found = conn
        .query_row(&sql, params![id], |row| row.get(0))
        .optional()?;
    Ok(found)
}

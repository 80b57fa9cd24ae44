// End-to-end migration scenarios against the in-memory and SQLite stores.

use chrono::NaiveDate;
use finance_migration::store::sqlite::Table;
use finance_migration::{
    BudgetRecord, EntityStore, ExpenseDetails, ExpenseRecord, InMemoryStore, ItemStatus,
    JobStatus, LinkEvent, MappingGroup, MappingRequest, MappingResult, MigrationConfig,
    MigrationService, RetryPolicy, SqliteStore, LINKING_TOPIC,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

const OWNER: &str = "owner-42";

fn budget(old_id: &str, expenses: &[&str]) -> BudgetRecord {
    BudgetRecord {
        old_id: old_id.to_string(),
        name: Some(format!("Budget {}", old_id)),
        description: Some("imported".to_string()),
        amount: Some(1000.0),
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
        end_date: NaiveDate::from_ymd_opt(2024, 12, 31),
        remaining_amount: Some(750.0),
        expense_ids: expenses.iter().map(|s| s.to_string()).collect(),
    }
}

fn expense(old_id: &str, budgets: &[&str]) -> ExpenseRecord {
    ExpenseRecord {
        old_id: old_id.to_string(),
        date: NaiveDate::from_ymd_opt(2024, 4, 15),
        category: Some("food".to_string()),
        expense: ExpenseDetails {
            expense_name: Some(format!("Expense {}", old_id)),
            amount: Some(42.0),
            expense_type: None,
            payment_method: Some("Credit Card".to_string()),
            net_amount: None,
            comments: None,
            credit_due: None,
        },
        budget_ids: budgets.iter().map(|s| s.to_string()).collect(),
    }
}

fn config() -> MigrationConfig {
    MigrationConfig::new()
        .with_workers(4)
        .with_batch_sizes(2, 2)
        .with_batch_retries(3, Duration::from_millis(1))
        .with_link_retry(RetryPolicy::with_delays(3, Duration::from_millis(100)))
}

/// B1..B3 and five expenses; B3 also declares E4, which is not in the request.
fn scenario() -> MappingRequest {
    MappingRequest {
        owner_id: None,
        mappings: vec![MappingGroup {
            owner_id: None,
            budgets: vec![
                budget("B1", &["E1", "E2"]),
                budget("B2", &["E3"]),
                budget("B3", &["E3", "E4"]),
            ],
            expenses: vec![
                expense("E1", &["B1"]),
                expense("E2", &["B1"]),
                expense("E3", &["B2", "B3"]),
                expense("E5", &[]),
                expense("E6", &[]),
            ],
        }],
    }
}

fn new_budget_id(result: &MappingResult, old_id: &str) -> String {
    result
        .budget_results
        .iter()
        .find(|b| b.old_budget_id == old_id)
        .and_then(|b| b.new_budget_id.clone())
        .unwrap()
}

fn new_expense_id(result: &MappingResult, old_id: &str) -> String {
    result
        .results
        .iter()
        .find(|e| e.old_expense_id == old_id)
        .and_then(|e| e.new_expense_id.clone())
        .unwrap()
}

fn set(ids: &[&String]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_links_and_single_timeout() {
    let store = Arc::new(InMemoryStore::new());
    let service = MigrationService::start(store.clone(), config());

    let result = service.map_request(Some(OWNER), scenario()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.total_processed, 8);
    assert_eq!(result.success_count, 8);
    assert_eq!(result.failure_count, 0);

    assert_eq!(result.warnings.len(), 1);
    let warning = &result.warnings[0];
    assert_eq!(warning.entity_id, new_budget_id(&result, "B3"));
    assert_eq!(warning.unresolved_old_id, "E4");
    assert!(warning.message.starts_with("LinkResolutionTimeout"));
    assert!(warning.message.contains("after 3 retries"));

    let (b1, b2, b3) = (
        new_budget_id(&result, "B1"),
        new_budget_id(&result, "B2"),
        new_budget_id(&result, "B3"),
    );
    let (e1, e2, e3) = (
        new_expense_id(&result, "E1"),
        new_expense_id(&result, "E2"),
        new_expense_id(&result, "E3"),
    );

    let expense_links = |id: &str| store.get_expense(id).unwrap().unwrap().budget_ids;
    let budget_links = |id: &str| store.get_budget(id).unwrap().unwrap().expense_ids;

    assert_eq!(expense_links(&e1), set(&[&b1]));
    assert_eq!(expense_links(&e2), set(&[&b1]));
    assert_eq!(expense_links(&e3), set(&[&b2, &b3]));
    assert_eq!(budget_links(&b1), set(&[&e1, &e2]));
    assert_eq!(budget_links(&b2), set(&[&e3]));
    assert_eq!(budget_links(&b3), set(&[&e3]));
    assert!(expense_links(&new_expense_id(&result, "E5")).is_empty());

    let e3_result = result.results.iter().find(|e| e.old_expense_id == "E3").unwrap();
    assert_eq!(e3_result.budget_mappings.len(), 2);
    assert!(e3_result.budget_mappings.iter().all(|m| m.success));

    println!("✅ Scenario test passed: {}", result.summary());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_submission_is_skipped() {
    let store = Arc::new(InMemoryStore::new());
    let service = MigrationService::start(store.clone(), config());

    let first = service.map_request(Some(OWNER), scenario()).await.unwrap();
    let budgets = store.budget_count();
    let expenses = store.expense_count();
    let links = store.link_count();

    let second = service.map_request(Some(OWNER), scenario()).await.unwrap();

    assert_eq!(second.success_count, 8);
    assert_eq!(second.skipped_count, 8);
    assert!(second.results.iter().all(|r| r.status == ItemStatus::DuplicateSkipped));
    assert!(second
        .budget_results
        .iter()
        .all(|r| r.status == ItemStatus::DuplicateSkipped));
    assert!(second.warnings.is_empty());

    assert_eq!(store.budget_count(), budgets);
    assert_eq!(store.expense_count(), expenses);
    assert_eq!(store.link_count(), links);

    // skipped records report the ids created by the first run
    assert_eq!(new_budget_id(&first, "B1"), new_budget_id(&second, "B1"));
    assert_eq!(new_expense_id(&first, "E3"), new_expense_id(&second, "E3"));

    println!("✅ Duplicate submission test passed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expense_created_before_its_budget() {
    let store = Arc::new(InMemoryStore::new());
    let service = MigrationService::start(store.clone(), config());

    // E9 is created in the first group, its budget only in the second
    let request = MappingRequest {
        owner_id: Some(OWNER.to_string()),
        mappings: vec![
            MappingGroup {
                owner_id: None,
                budgets: vec![],
                expenses: vec![expense("E9", &["B9"])],
            },
            MappingGroup {
                owner_id: None,
                budgets: vec![budget("B9", &[])],
                expenses: vec![],
            },
        ],
    };

    let result = service.map_request(None, request).await.unwrap();

    assert!(result.success);
    assert!(result.warnings.is_empty());
    let e9 = new_expense_id(&result, "E9");
    let b9 = new_budget_id(&result, "B9");
    assert_eq!(store.get_expense(&e9).unwrap().unwrap().budget_ids, set(&[&b9]));
    assert_eq!(store.get_budget(&b9).unwrap().unwrap().expense_ids, set(&[&e9]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_batch_is_retried_whole() {
    let store = Arc::new(InMemoryStore::new());
    let service = MigrationService::start(
        store.clone(),
        config().with_batch_sizes(4, 4),
    );
    let mut tap = service.bus().subscribe(LINKING_TOPIC);

    let request = MappingRequest {
        owner_id: Some(OWNER.to_string()),
        mappings: vec![MappingGroup {
            owner_id: None,
            budgets: vec![budget("B1", &[])],
            expenses: vec![
                expense("E1", &["B1"]),
                expense("E2", &["B1"]),
                expense("E3", &["B1"]),
                expense("E4", &["B1"]),
            ],
        }],
    };

    // create #1 is B1, #2 is E1, #3 (E2) fails mid-batch
    store.fail_nth_create(3);
    let result = service.map_request(None, request).await.unwrap();

    assert!(result.success);
    assert_eq!(store.expense_count(), 4);
    assert_eq!(store.create_calls(), 7);
    assert_eq!(store.link_count(), 4);

    let mut events = Vec::new();
    while let Ok(envelope) = tap.try_recv() {
        events.push(envelope.event);
    }
    assert_eq!(events.len(), 4);

    let mut announced = HashSet::new();
    for event in &events {
        match event {
            LinkEvent::ExpenseCreatedWithExistingBudgets { new_expense_id, .. } => {
                assert!(store.get_expense(new_expense_id).unwrap().is_some());
                announced.insert(new_expense_id.clone());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(announced.len(), 4);

    let snap = service.get_progress(&result.job_id).unwrap();
    assert_eq!(snap.processed, 5);
    assert_eq!(snap.succeeded, 5);
    assert_eq!(snap.failed, 0);
    assert_eq!(snap.status, JobStatus::Completed);

    println!("✅ Batch atomicity test passed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_store_fails_background_job() {
    let store = Arc::new(InMemoryStore::new());
    let service = MigrationService::start(store.clone(), config());
    store.set_unavailable(true);

    let job_id = service
        .start_job(Some(OWNER.to_string()), scenario())
        .unwrap();

    let mut snap = service.get_progress(&job_id).unwrap();
    for _ in 0..300 {
        if snap.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        snap = service.get_progress(&job_id).unwrap();
    }

    assert_eq!(snap.status, JobStatus::Failed);
    assert_eq!(snap.failed, 8);
    assert!(snap.error.unwrap().contains("no batch could be committed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_end_to_end() {
    let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
    sqlite.add_category(OWNER, "Food").unwrap();
    let store: Arc<dyn EntityStore> = sqlite.clone();
    let service = MigrationService::start(store.clone(), config());

    let request = MappingRequest {
        owner_id: Some(OWNER.to_string()),
        mappings: vec![MappingGroup {
            owner_id: None,
            budgets: vec![budget("B1", &["E1"]), budget("B2", &[])],
            expenses: vec![expense("E1", &["B1", "B2"]), expense("E2", &["B2"])],
        }],
    };

    let result = service.map_request(None, request.clone()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.success_count, 4);
    assert_eq!(sqlite.count(Table::Links).unwrap(), 3);

    let e1 = store.get_expense(&new_expense_id(&result, "E1")).unwrap().unwrap();
    assert_eq!(e1.category, "Food");
    assert_eq!(e1.payment_method, "creditCard");
    assert_eq!(e1.budget_ids.len(), 2);

    let again = service.map_request(None, request).await.unwrap();
    assert_eq!(again.skipped_count, 4);
    assert_eq!(sqlite.count(Table::Expenses).unwrap(), 2);
    assert_eq!(sqlite.count(Table::Budgets).unwrap(), 2);
    assert_eq!(sqlite.count(Table::Links).unwrap(), 3);

    println!("✅ SQLite end-to-end test passed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_groups_for_different_owners_keep_their_own_ids() {
    let store = Arc::new(InMemoryStore::new());
    let service = MigrationService::start(store.clone(), config());

    let group = |owner: &str| MappingGroup {
        owner_id: Some(owner.to_string()),
        budgets: vec![budget("B1", &["E1"])],
        expenses: vec![expense("E1", &["B1"])],
    };
    let request = MappingRequest {
        owner_id: None,
        mappings: vec![group("alice"), group("bob")],
    };

    let result = service.map_request(None, request).await.unwrap();

    assert!(result.success);
    assert_eq!(result.success_count, 4);
    assert_eq!(result.skipped_count, 0);
    assert!(result.warnings.is_empty());
    assert_eq!(store.budget_count(), 2);
    assert_eq!(store.expense_count(), 2);

    let new_id = |id: &Option<String>| id.clone().unwrap();
    let alice_budget = new_id(&result.budget_results[0].new_budget_id);
    let bob_budget = new_id(&result.budget_results[1].new_budget_id);
    let alice_expense = new_id(&result.results[0].new_expense_id);
    let bob_expense = new_id(&result.results[1].new_expense_id);
    assert_ne!(alice_expense, bob_expense);

    let alice = store.get_expense(&alice_expense).unwrap().unwrap();
    let bob = store.get_expense(&bob_expense).unwrap().unwrap();
    assert_eq!(alice.owner_id, "alice");
    assert_eq!(bob.owner_id, "bob");
    assert_eq!(alice.budget_ids, set(&[&alice_budget]));
    assert_eq!(bob.budget_ids, set(&[&bob_budget]));
    assert_eq!(
        store.get_budget(&bob_budget).unwrap().unwrap().expense_ids,
        set(&[&bob_expense])
    );
    assert_eq!(
        result.results[1].budget_mappings[0].new_budget_id.as_deref(),
        Some(bob_budget.as_str())
    );

    println!("✅ Per-owner identifier map test passed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulk_path_publishes_linking_events() {
    let store = Arc::new(InMemoryStore::new());
    let service = MigrationService::start(store.clone(), config().with_bulk_threshold(1));
    let mut tap = service.bus().subscribe(LINKING_TOPIC);

    let request = MappingRequest {
        owner_id: Some(OWNER.to_string()),
        mappings: vec![MappingGroup {
            owner_id: None,
            budgets: vec![budget("B1", &[])],
            expenses: vec![expense("E1", &["B1"]), expense("E2", &["B1"])],
        }],
    };

    let result = service.map_request(None, request).await.unwrap();

    assert!(result.success);
    assert_eq!(result.success_count, 3);
    assert_eq!(store.link_count(), 2);

    let b1 = new_budget_id(&result, "B1");
    let (e1, e2) = (new_expense_id(&result, "E1"), new_expense_id(&result, "E2"));
    assert_eq!(store.get_budget(&b1).unwrap().unwrap().expense_ids, set(&[&e1, &e2]));

    let mut events = Vec::new();
    while let Ok(envelope) = tap.try_recv() {
        events.push(envelope.event);
    }
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| matches!(e, LinkEvent::ExpenseCreatedWithExistingBudgets { .. })));

    let snap = service.get_progress(&result.job_id).unwrap();
    assert_eq!(snap.processed, 3);
    assert_eq!(snap.succeeded, 3);
    assert_eq!(snap.pending_links, 0);

    println!("✅ Bulk path linking test passed");
}


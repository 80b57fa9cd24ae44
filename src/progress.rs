// 📊 Progress Tracker - per-job counters exposed for polling
//
// One record per job, stored in a sharded map so jobs never contend with each
// other. Counters are atomics; labels and lists sit behind per-job mutexes.
// Readers get an immutable snapshot. Finished jobs stay pollable for the
// retention window, then `evict_expired` drops them.

use crate::model::LinkWarning;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug)]
struct Terminal {
    status: JobStatus,
    summary: Option<String>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct JobProgress {
    total: AtomicUsize,
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    current_batch: AtomicUsize,
    total_batches: AtomicUsize,
    /// Event ids published but not yet settled
    pending_links: Mutex<HashSet<String>>,
    stage: Mutex<String>,
    recent: Mutex<VecDeque<String>>,
    warnings: Mutex<Vec<LinkWarning>>,
    terminal: Mutex<Terminal>,
    links_settled: Notify,
    started_at: DateTime<Utc>,
}

impl JobProgress {
    fn new(total: usize) -> Self {
        JobProgress {
            total: AtomicUsize::new(total),
            processed: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            current_batch: AtomicUsize::new(0),
            total_batches: AtomicUsize::new(0),
            pending_links: Mutex::new(HashSet::new()),
            stage: Mutex::new("queued".to_string()),
            recent: Mutex::new(VecDeque::new()),
            warnings: Mutex::new(Vec::new()),
            terminal: Mutex::new(Terminal {
                status: JobStatus::Running,
                summary: None,
                error: None,
                finished_at: None,
            }),
            links_settled: Notify::new(),
            started_at: Utc::now(),
        }
    }
}

// Poisoned per-job mutexes only hold display data; keep going with it.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub stage: String,
    pub total_items: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub pending_links: usize,
    pub percent: f64,
    pub recent_items: Vec<String>,
    pub warnings: Vec<LinkWarning>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
}

// ============================================================================
// TRACKER
// ============================================================================

pub struct ProgressTracker {
    jobs: DashMap<String, Arc<JobProgress>>,
    recent_limit: usize,
    retention: Duration,
}

impl ProgressTracker {
    pub fn new(recent_limit: usize, retention: Duration) -> Self {
        ProgressTracker {
            jobs: DashMap::new(),
            recent_limit: recent_limit.max(1),
            retention,
        }
    }

    fn job(&self, job_id: &str) -> Option<Arc<JobProgress>> {
        let job = self.jobs.get(job_id).map(|j| Arc::clone(j.value()));
        if job.is_none() {
            debug!(job_id, "progress update for unknown or evicted job");
        }
        job
    }

    /// Create (or reset) the record for `job_id`.
    pub fn register(&self, job_id: &str, total_items: usize) {
        self.jobs
            .insert(job_id.to_string(), Arc::new(JobProgress::new(total_items)));
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn update_stage(&self, job_id: &str, label: &str) {
        if let Some(job) = self.job(job_id) {
            debug!(job_id, stage = label, "stage changed");
            *lock(&job.stage) = label.to_string();
        }
    }

    pub fn update_batch(&self, job_id: &str, current: usize, total: usize) {
        if let Some(job) = self.job(job_id) {
            job.current_batch.store(current, Ordering::SeqCst);
            job.total_batches.store(total, Ordering::SeqCst);
        }
    }

    pub fn set_total(&self, job_id: &str, total_items: usize) {
        if let Some(job) = self.job(job_id) {
            job.total.store(total_items, Ordering::SeqCst);
        }
    }

    /// Count `n` items as processed.
    pub fn increment(&self, job_id: &str, n: usize) {
        if let Some(job) = self.job(job_id) {
            job.processed.fetch_add(n, Ordering::SeqCst);
        }
    }

    pub fn record_success(&self, job_id: &str, n: usize) {
        if let Some(job) = self.job(job_id) {
            job.succeeded.fetch_add(n, Ordering::SeqCst);
        }
    }

    pub fn record_failure(&self, job_id: &str, n: usize) {
        if let Some(job) = self.job(job_id) {
            job.failed.fetch_add(n, Ordering::SeqCst);
        }
    }

    /// Skipped duplicates also count as successes.
    pub fn record_skipped(&self, job_id: &str, n: usize) {
        if let Some(job) = self.job(job_id) {
            job.skipped.fetch_add(n, Ordering::SeqCst);
            job.succeeded.fetch_add(n, Ordering::SeqCst);
        }
    }

    pub fn add_recent_item(&self, job_id: &str, description: &str) {
        if let Some(job) = self.job(job_id) {
            let mut recent = lock(&job.recent);
            if recent.len() == self.recent_limit {
                recent.pop_front();
            }
            recent.push_back(description.to_string());
        }
    }

    pub fn add_warning(&self, job_id: &str, warning: LinkWarning) {
        if let Some(job) = self.job(job_id) {
            lock(&job.warnings).push(warning);
        }
    }

    pub fn warnings(&self, job_id: &str) -> Vec<LinkWarning> {
        self.job(job_id)
            .map(|job| lock(&job.warnings).clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // LINK SETTLEMENT
    // ========================================================================

    /// Linking event `event_id` for this job is now in flight.
    pub fn link_published(&self, job_id: &str, event_id: &str) {
        if let Some(job) = self.job(job_id) {
            lock(&job.pending_links).insert(event_id.to_string());
        }
    }

    /// Linking event `event_id` reached a final outcome. Settling an event
    /// that is not pending (a redelivery, or a second consumer) is ignored.
    pub fn link_settled(&self, job_id: &str, event_id: &str) {
        if let Some(job) = self.job(job_id) {
            let drained = {
                let mut pending = lock(&job.pending_links);
                pending.remove(event_id) && pending.is_empty()
            };
            if drained {
                job.links_settled.notify_waiters();
            }
        }
    }

    pub fn pending_links(&self, job_id: &str) -> usize {
        self.job(job_id)
            .map(|job| lock(&job.pending_links).len())
            .unwrap_or(0)
    }

    /// Resolve once every linking event published for this job has settled.
    pub async fn wait_for_links(&self, job_id: &str) {
        let job = match self.job(job_id) {
            Some(job) => job,
            None => return,
        };

        loop {
            let notified = job.links_settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if lock(&job.pending_links).is_empty() {
                return;
            }
            notified.await;
        }
    }

    // ========================================================================
    // TERMINAL STATES
    // ========================================================================

    pub fn complete(&self, job_id: &str, summary: &str) {
        self.finish(job_id, JobStatus::Completed, Some(summary.to_string()), None);
    }

    pub fn fail(&self, job_id: &str, reason: &str) {
        self.finish(job_id, JobStatus::Failed, None, Some(reason.to_string()));
    }

    fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        summary: Option<String>,
        error: Option<String>,
    ) {
        if let Some(job) = self.job(job_id) {
            *lock(&job.stage) = status_label(status).to_string();
            let mut terminal = lock(&job.terminal);
            terminal.status = status;
            terminal.summary = summary;
            terminal.error = error;
            terminal.finished_at = Some(Utc::now());
            info!(job_id, status = status_label(status), "job finished");
        }
    }

    // ========================================================================
    // READ / EVICT
    // ========================================================================

    pub fn get(&self, job_id: &str) -> Option<ProgressSnapshot> {
        let job = self.jobs.get(job_id).map(|j| Arc::clone(j.value()))?;

        let total_items = job.total.load(Ordering::SeqCst);
        let processed = job.processed.load(Ordering::SeqCst);
        let (status, summary, error, finished_at) = {
            let terminal = lock(&job.terminal);
            (
                terminal.status,
                terminal.summary.clone(),
                terminal.error.clone(),
                terminal.finished_at,
            )
        };
        let stage = lock(&job.stage).clone();
        let pending_links = lock(&job.pending_links).len();
        let recent_items: Vec<String> = lock(&job.recent).iter().cloned().collect();
        let warnings = lock(&job.warnings).clone();
        let elapsed = finished_at.unwrap_or_else(Utc::now) - job.started_at;

        let percent = if total_items == 0 {
            if status.is_terminal() { 100.0 } else { 0.0 }
        } else {
            (processed as f64 / total_items as f64 * 100.0).min(100.0)
        };

        let snapshot = ProgressSnapshot {
            job_id: job_id.to_string(),
            status,
            stage,
            total_items,
            processed,
            succeeded: job.succeeded.load(Ordering::SeqCst),
            failed: job.failed.load(Ordering::SeqCst),
            skipped: job.skipped.load(Ordering::SeqCst),
            current_batch: job.current_batch.load(Ordering::SeqCst),
            total_batches: job.total_batches.load(Ordering::SeqCst),
            pending_links,
            percent,
            recent_items,
            warnings,
            summary,
            error,
            started_at: job.started_at,
            finished_at,
            elapsed_ms: elapsed.num_milliseconds(),
        };
        Some(snapshot)
    }

    /// Drop finished jobs older than the retention window. Returns how many
    /// were evicted.
    pub fn evict_expired(&self) -> usize {
        self.evict_finished_before(Utc::now())
    }

    fn evict_finished_before(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let before = self.jobs.len();

        self.jobs.retain(|_, job| {
            let terminal = lock(&job.terminal);
            match terminal.finished_at {
                Some(finished) if terminal.status.is_terminal() => now - finished < retention,
                _ => true,
            }
        });

        let evicted = before.saturating_sub(self.jobs.len());
        if evicted > 0 {
            debug!(evicted, "evicted expired job progress records");
        }
        evicted
    }

    /// Periodically evict expired records until the tracker is dropped.
    pub fn spawn_evictor(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match tracker.upgrade() {
                    Some(tracker) => {
                        tracker.evict_expired();
                    }
                    None => break,
                }
            }
        })
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(3, Duration::from_secs(60))
    }

    #[test]
    fn test_counters_and_snapshot() {
        let tracker = tracker();
        tracker.register("job-1", 10);

        tracker.update_stage("job-1", "creating budgets");
        tracker.update_batch("job-1", 1, 4);
        tracker.increment("job-1", 4);
        tracker.record_success("job-1", 3);
        tracker.record_failure("job-1", 1);

        let snap = tracker.get("job-1").unwrap();
        assert_eq!(snap.status, JobStatus::Running);
        assert_eq!(snap.stage, "creating budgets");
        assert_eq!(snap.processed, 4);
        assert_eq!(snap.succeeded, 3);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.total_batches, 4);
        assert!((snap.percent - 40.0).abs() < f64::EPSILON);

        println!("✅ Progress snapshot test passed: {:.0}%", snap.percent);
    }

    #[test]
    fn test_recent_items_are_bounded() {
        let tracker = tracker();
        tracker.register("job", 0);

        for i in 0..5 {
            tracker.add_recent_item("job", &format!("item {}", i));
        }

        let snap = tracker.get("job").unwrap();
        assert_eq!(snap.recent_items, vec!["item 2", "item 3", "item 4"]);
    }

    #[test]
    fn test_skipped_counts_as_success() {
        let tracker = tracker();
        tracker.register("job", 2);
        tracker.record_skipped("job", 2);

        let snap = tracker.get("job").unwrap();
        assert_eq!(snap.skipped, 2);
        assert_eq!(snap.succeeded, 2);
    }

    #[test]
    fn test_terminal_states() {
        let tracker = tracker();
        tracker.register("ok", 1);
        tracker.register("bad", 1);

        tracker.complete("ok", "all good");
        tracker.fail("bad", "store unreachable");

        let ok = tracker.get("ok").unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.summary.as_deref(), Some("all good"));
        assert!(ok.finished_at.is_some());

        let bad = tracker.get("bad").unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("store unreachable"));
    }

    #[test]
    fn test_eviction_respects_retention() {
        let tracker = tracker();
        tracker.register("done", 1);
        tracker.register("running", 1);
        tracker.complete("done", "ok");

        assert_eq!(tracker.evict_finished_before(Utc::now()), 0);

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(tracker.evict_finished_before(later), 1);
        assert!(tracker.get("done").is_none());
        assert!(tracker.get("running").is_some());

        println!("✅ Eviction test passed");
    }

    #[test]
    fn test_unknown_job_is_ignored() {
        let tracker = tracker();
        tracker.increment("ghost", 1);
        tracker.link_settled("ghost", "evt");
        assert!(tracker.get("ghost").is_none());
    }

    #[tokio::test]
    async fn test_wait_for_links() {
        let tracker = Arc::new(tracker());
        tracker.register("job", 0);

        // nothing pending resolves immediately
        tracker.wait_for_links("job").await;

        tracker.link_published("job", "evt-1");
        tracker.link_published("job", "evt-2");

        let settler = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                tracker.link_settled("job", "evt-1");
                tracker.link_settled("job", "evt-2");
            })
        };

        tokio::time::timeout(Duration::from_secs(2), tracker.wait_for_links("job"))
            .await
            .expect("links should settle");
        assert_eq!(tracker.pending_links("job"), 0);
        settler.await.unwrap();
    }

    #[test]
    fn test_repeated_settlement_does_not_release_other_events() {
        let tracker = tracker();
        tracker.register("job", 0);
        tracker.link_published("job", "evt-1");
        tracker.link_published("job", "evt-2");

        // the same event settled twice (redelivery or a second consumer)
        tracker.link_settled("job", "evt-1");
        tracker.link_settled("job", "evt-1");
        assert_eq!(tracker.pending_links("job"), 1);
        assert_eq!(tracker.get("job").unwrap().pending_links, 1);

        tracker.link_settled("job", "evt-2");
        assert_eq!(tracker.pending_links("job"), 0);

        println!("✅ Per-event settlement test passed");
    }
}

//! Append-only audit sink with a background flusher and alert derivation.
//!
//! `write` never blocks the request path: records land in a bounded in-memory
//! queue and a spawned task drains them to the store, retrying failed writes.
//! On overflow the oldest record is dropped and a counter incremented.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::models::audit::{AuditRecord, SecurityAlert, ThreatLevel};
use crate::repositories::audit as audit_repo;
use crate::types::SecurityAlertId;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AuditStoreTrait: Send + Sync {
    async fn insert_record(&self, record: AuditRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditStoreTrait for PgAuditStore {
    async fn insert_record(&self, record: AuditRecord) -> anyhow::Result<()> {
        audit_repo::insert_audit_record(&self.pool, &record).await?;
        Ok(())
    }
}

const FLUSH_RETRY_ATTEMPTS: u32 = 5;
const FLUSH_IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct AuditSink {
    queue: Arc<Mutex<VecDeque<AuditRecord>>>,
    notify: Arc<Notify>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Creates the sink and spawns its flusher task.
    pub fn spawn(store: Arc<dyn AuditStoreTrait>, capacity: usize) -> Self {
        let sink = Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        };

        let queue = sink.queue.clone();
        let notify = sink.notify.clone();
        tokio::spawn(async move {
            flusher(store, queue, notify).await;
        });

        sink
    }

    /// Enqueues a record. Returns immediately; durability is eventual.
    pub fn write(&self, record: AuditRecord) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(record);
            if queue.len() > self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn flusher(
    store: Arc<dyn AuditStoreTrait>,
    queue: Arc<Mutex<VecDeque<AuditRecord>>>,
    notify: Arc<Notify>,
) {
    loop {
        let record = {
            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.pop_front()
        };

        let Some(record) = record else {
            // Poll on a timer as well so a missed notify never strands records.
            let _ = tokio::time::timeout(FLUSH_IDLE_POLL, notify.notified()).await;
            continue;
        };

        if let Err(err) = insert_with_retry(store.as_ref(), record.clone()).await {
            tracing::warn!(error = ?err, "Audit flush exhausted retries; requeueing record");
            {
                let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.push_front(record);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

async fn insert_with_retry(store: &dyn AuditStoreTrait, record: AuditRecord) -> anyhow::Result<()> {
    let mut delay = Duration::from_millis(50);
    for attempt in 0..FLUSH_RETRY_ATTEMPTS {
        match store.insert_record(record.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt + 1 == FLUSH_RETRY_ATTEMPTS => return Err(err),
            Err(err) => {
                tracing::debug!(error = ?err, attempt, "Audit insert failed; retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    unreachable!("retry loop always returns")
}

/// Maps a failure count to an alert severity, if the count crosses the
/// configured threshold. Double the threshold escalates to critical.
pub fn threat_level_for(count: i64, threshold: i64) -> Option<ThreatLevel> {
    if count >= threshold * 2 {
        Some(ThreatLevel::Critical)
    } else if count > threshold {
        Some(ThreatLevel::High)
    } else {
        None
    }
}

/// Periodically pattern-matches recent audit records and raises alerts
/// (e.g. more than K failed logins for one user inside the window).
pub fn spawn_alert_scanner(
    pool: PgPool,
    failed_threshold: i64,
    window_minutes: i64,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) =
                scan_once(&pool, failed_threshold, window_minutes).await
            {
                tracing::warn!(error = ?err, "Security alert scan failed");
            }
        }
    });
}

async fn scan_once(
    pool: &PgPool,
    failed_threshold: i64,
    window_minutes: i64,
) -> anyhow::Result<()> {
    let since = Utc::now() - ChronoDuration::minutes(window_minutes);

    for event_type in ["login_failed", "authorize"] {
        let failures = audit_repo::count_failures_by_user(pool, event_type, since).await?;
        for (user_id, count) in failures {
            let Some(threat_level) = threat_level_for(count, failed_threshold) else {
                continue;
            };
            if audit_repo::has_recent_alert(pool, user_id.as_deref(), threat_level, since).await? {
                continue;
            }
            let alert = SecurityAlert {
                id: SecurityAlertId::new(),
                user_id: user_id.clone(),
                threat_level,
                reason: format!(
                    "{count} failed {event_type} events within {window_minutes} minutes"
                ),
                acknowledged: false,
                created_at: Utc::now(),
            };
            tracing::warn!(
                user_id = ?alert.user_id,
                threat_level = alert.threat_level.as_str(),
                "Security alert raised"
            );
            audit_repo::insert_security_alert(pool, &alert).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn threat_level_scales_with_count() {
        assert_eq!(threat_level_for(3, 5), None);
        assert_eq!(threat_level_for(5, 5), None);
        assert_eq!(threat_level_for(6, 5), Some(ThreatLevel::High));
        assert_eq!(threat_level_for(10, 5), Some(ThreatLevel::Critical));
    }

    #[tokio::test]
    async fn sink_flushes_records_to_store() {
        let mut store = MockAuditStoreTrait::new();
        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = flushed.clone();
        store.expect_insert_record().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let sink = AuditSink::spawn(Arc::new(store), 16);
        sink.write(AuditRecord::new(None, "login_success", true, None));
        sink.write(AuditRecord::new(None, "login_failed", false, None));

        for _ in 0..50 {
            if flushed.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(flushed.load(Ordering::SeqCst), 2);
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let mut store = MockAuditStoreTrait::new();
        // A store that never succeeds keeps the queue full.
        store
            .expect_insert_record()
            .returning(|_| Err(anyhow::anyhow!("store down")));

        let sink = AuditSink::spawn(Arc::new(store), 2);
        for i in 0..5 {
            sink.write(AuditRecord::new(None, format!("event_{i}"), true, None));
        }

        assert!(sink.dropped() >= 2);
        assert!(sink.pending() <= 3);
    }

    #[tokio::test]
    async fn flusher_retries_transient_failures() {
        let mut store = MockAuditStoreTrait::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        store.expect_insert_record().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(anyhow::anyhow!("transient"))
            } else {
                Ok(())
            }
        });

        let sink = AuditSink::spawn(Arc::new(store), 16);
        sink.write(AuditRecord::new(None, "authorize", false, None));

        for _ in 0..100 {
            if attempts.load(Ordering::SeqCst) >= 3 && sink.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert_eq!(sink.pending(), 0);
    }
}

//! Reconciliation sweep.
//!
//! Repairs the state that routing leaves behind: dependents of providers that
//! are no longer registered, breakers wedged open, health records past the
//! purge horizon, quota periods that ended while nobody reserved, and store
//! rows that break the one-row-per-key rule. Every step is idempotent, so a
//! failed sweep is simply retried on the next tick.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info};

use crate::{
    error::StoreError,
    model::ProviderId,
    orchestrator::Orchestrator,
    store::{newest_by_key, ProviderRow, RowVersion, StoredRow, Table},
};

/// What a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// In-memory health/quota/breaker entries dropped for unregistered providers.
    pub orphan_records_dropped: usize,
    pub stuck_circuits_reset: usize,
    pub stale_health_purged: usize,
    pub quotas_reset: usize,
    pub duplicate_rows_removed: usize,
    pub orphan_rows_removed: usize,
    pub expired_rows_removed: usize,
    pub store_errors: usize,
}

impl SweepReport {
    /// Number of repairs made; errors are not counted.
    pub fn changes(&self) -> usize {
        self.orphan_records_dropped
            + self.stuck_circuits_reset
            + self.stale_health_purged
            + self.quotas_reset
            + self.duplicate_rows_removed
            + self.orphan_rows_removed
            + self.expired_rows_removed
    }

    pub fn is_clean(&self) -> bool {
        self.changes() == 0 && self.store_errors == 0
    }
}

// Rows to drop from one table, as they were when listed
#[derive(Default)]
struct TablePlan {
    orphans: Vec<RowVersion>,
    duplicates: Vec<RowVersion>,
    expired: Vec<RowVersion>,
}

impl Orchestrator {
    /// Runs one reconciliation pass over memory and the store.
    pub async fn reconcile(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let touched = self.sweep_memory(&mut report);

        for provider_id in &touched {
            self.persist(provider_id).await;
        }
        self.sweep_store(&mut report).await;

        if report.changes() > 0 {
            info!(
                orphan_records = report.orphan_records_dropped,
                stuck_circuits = report.stuck_circuits_reset,
                stale_health = report.stale_health_purged,
                quotas_reset = report.quotas_reset,
                duplicate_rows = report.duplicate_rows_removed,
                orphan_rows = report.orphan_rows_removed,
                expired_rows = report.expired_rows_removed,
                "reconciliation sweep repaired state"
            );
        } else {
            debug!(store_errors = report.store_errors, "reconciliation sweep found nothing to repair");
        }
        report
    }

    // Returns the registered providers whose state changed and needs persisting
    fn sweep_memory(&self, report: &mut SweepReport) -> Vec<ProviderId> {
        let max_open_age = ChronoDuration::seconds(self.config.sweep.max_open_age_secs);

        let mut known: BTreeSet<ProviderId> = BTreeSet::new();
        known.extend(self.health.provider_ids());
        known.extend(self.quota.provider_ids());
        known.extend(self.breakers.provider_ids());
        known.extend(self.guard_ids());
        known.extend(self.registry.all().into_iter().map(|p| p.id));

        let mut touched = Vec::new();
        for provider_id in known {
            let guard = self.guard(&provider_id);
            let _exclusive = guard.write();

            if !self.registry.contains(&provider_id) {
                let dropped = self.drop_dependents(&provider_id);
                self.forget_guard(&provider_id);
                if dropped > 0 {
                    info!(provider_id = %provider_id, dropped, "dropped state of unregistered provider");
                    report.orphan_records_dropped += dropped;
                }
                continue;
            }

            let mut changed = false;
            if self.breakers.reset_if_stuck(&provider_id, max_open_age) {
                report.stuck_circuits_reset += 1;
                changed = true;
            }
            if self.health.purge_if_expired(&provider_id) {
                info!(provider_id = %provider_id, "purged expired health record");
                report.stale_health_purged += 1;
            }
            let resets = self.quota.reset_due_for(&provider_id);
            if resets > 0 {
                report.quotas_reset += resets;
                changed = true;
            }
            if changed {
                touched.push(provider_id);
            }
        }
        touched
    }

    async fn sweep_store(&self, report: &mut SweepReport) {
        let horizon = self.clock.now() - self.health.purge_horizon();

        match self.store.list_health().await {
            Ok(rows) => {
                let mut plan = self.plan_table(
                    rows,
                    |record| record.provider_id.clone(),
                    |row| (row.record.last_checked, row.row_id),
                );
                plan.ids.expired = plan
                    .kept
                    .iter()
                    .filter(|row| row.record.last_checked < horizon)
                    .map(StoredRow::stamp)
                    .collect();
                self.apply_plan(Table::Health, plan.ids, report).await;
            }
            Err(err) => self.record_store_error(Table::Health, err, report),
        }

        match self.store.list_quota().await {
            Ok(rows) => {
                let plan = self.plan_table(
                    rows,
                    |record| (record.provider_id.clone(), record.service_type),
                    |row| (row.record.reset_time, row.row_id),
                );
                self.apply_plan(Table::Quota, plan.ids, report).await;
            }
            Err(err) => self.record_store_error(Table::Quota, err, report),
        }

        match self.store.list_circuits().await {
            Ok(rows) => {
                let plan = self.plan_table(rows, |snapshot| snapshot.provider_id.clone(), |row| row.row_id);
                self.apply_plan(Table::Circuit, plan.ids, report).await;
            }
            Err(err) => self.record_store_error(Table::Circuit, err, report),
        }
    }

    fn plan_table<T, K, R>(
        &self,
        rows: Vec<StoredRow<T>>,
        key: impl Fn(&T) -> K,
        recency: impl Fn(&StoredRow<T>) -> R,
    ) -> KeptRows<T>
    where
        T: ProviderRow,
        K: Eq + std::hash::Hash,
        R: Ord,
    {
        let (known, orphans): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .partition(|row| self.registry.contains(row.record.provider_id()));
        let (newest, duplicates) = newest_by_key(known, key, recency);

        let mut kept: Vec<StoredRow<T>> = newest.into_values().collect();
        kept.sort_by_key(|row| row.row_id);
        KeptRows {
            kept,
            ids: TablePlan {
                orphans: orphans.iter().map(StoredRow::stamp).collect(),
                duplicates,
                expired: Vec::new(),
            },
        }
    }

    async fn apply_plan(&self, table: Table, plan: TablePlan, report: &mut SweepReport) {
        let steps = [
            (plan.orphans, &mut report.orphan_rows_removed),
            (plan.duplicates, &mut report.duplicate_rows_removed),
            (plan.expired, &mut report.expired_rows_removed),
        ];
        let mut failed = 0;
        for (rows, counter) in steps {
            if rows.is_empty() {
                continue;
            }
            // rows rewritten since the listing are skipped by the store
            match self.store.delete_rows(table, &rows).await {
                Ok(removed) => {
                    if removed < rows.len() {
                        debug!(?table, skipped = rows.len() - removed, "rows changed during sweep, kept");
                    }
                    *counter += removed;
                }
                Err(err) => {
                    error!(?table, rows = rows.len(), error = %err, "failed to delete rows");
                    failed += 1;
                }
            }
        }
        report.store_errors += failed;
    }

    fn record_store_error(&self, table: Table, err: StoreError, report: &mut SweepReport) {
        error!(?table, error = %err, "reconciliation could not read store");
        report.store_errors += 1;
    }
}

struct KeptRows<T> {
    kept: Vec<StoredRow<T>>,
    ids: TablePlan,
}

/// Handle to the background sweep loop.
pub struct Maintenance {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Maintenance {
    /// Runs `reconcile` every `interval` until [`Maintenance::shutdown`] is called.
    pub fn spawn(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {
                        let report = orchestrator.reconcile().await;
                        if report.store_errors > 0 {
                            error!(store_errors = report.store_errors, "sweep incomplete, retrying next tick");
                        }
                    }
                }
            }
            debug!("maintenance loop stopped");
        });

        Self { shutdown, handle }
    }

    /// Spawns with the interval from the engine configuration.
    pub fn spawn_configured(orchestrator: Arc<Orchestrator>) -> Self {
        let interval = Duration::from_secs(orchestrator.config().sweep.interval_secs.max(1));
        Self::spawn(orchestrator, interval)
    }

    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.handle.await {
            error!(error = %err, "maintenance task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        config::EngineConfig,
        mock_supplier::MockSupplier,
        model::{CircuitSnapshot, CircuitState, HealthRecord, QuotaRecord, ServiceType},
        store::{InMemoryStore, StateStore},
    };

    fn engine() -> (Arc<Orchestrator>, Arc<InMemoryStore>, Arc<ManualClock>) {
        let config = EngineConfig::from_json_str(
            r#"{
                "providers": [
                    { "id": "a", "capability": "hotel", "priority": 1 },
                    { "id": "b", "capability": "flight", "priority": 1 }
                ]
            }"#,
        )
        .unwrap();
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let orchestrator = Orchestrator::builder(config, Arc::new(MockSupplier::new()))
            .clock(clock.clone())
            .store(store.clone())
            .build()
            .unwrap();
        (Arc::new(orchestrator), store, clock)
    }

    #[tokio::test]
    async fn test_fresh_engine_sweeps_clean() {
        let (orchestrator, _, _) = engine();
        let report = orchestrator.reconcile().await;
        assert!(report.is_clean(), "unexpected repairs: {:?}", report);
    }

    #[tokio::test]
    async fn test_collapses_duplicate_and_orphan_rows() {
        let (orchestrator, store, clock) = engine();
        let now = clock.now();
        let a = ProviderId::new("a");

        store.import_health(HealthRecord::healthy(a.clone(), now - ChronoDuration::minutes(5)));
        let newest = store.import_health(HealthRecord::healthy(a.clone(), now));
        store.import_health(HealthRecord::healthy(ProviderId::new("ghost"), now));
        store.import_quota(QuotaRecord::new(ProviderId::new("ghost"), ServiceType::Search, 10, 60, now));
        store.import_quota(QuotaRecord::new(a.clone(), ServiceType::Search, 10, 60, now));
        store.import_quota(QuotaRecord::new(a.clone(), ServiceType::Search, 10, 60, now));

        let report = orchestrator.reconcile().await;
        assert_eq!(report.duplicate_rows_removed, 2);
        assert_eq!(report.orphan_rows_removed, 2);
        assert_eq!(report.store_errors, 0);

        let health = store.list_health().await.unwrap();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].row_id, newest);

        let again = orchestrator.reconcile().await;
        assert!(again.is_clean(), "second sweep changed state: {:?}", again);
    }

    #[tokio::test]
    async fn test_drops_state_of_unregistered_provider() {
        let (orchestrator, _, _) = engine();
        let ghost = ProviderId::new("ghost");
        orchestrator.health().record_outcome(&ghost, false, 10);
        orchestrator.quota().ensure(&ghost, ServiceType::Booking);

        let report = orchestrator.reconcile().await;
        assert_eq!(report.orphan_records_dropped, 2);
        assert!(!orchestrator.health().has_record(&ghost));
        assert!(orchestrator.quota().records_for(&ghost).is_empty());
    }

    #[tokio::test]
    async fn test_resets_stuck_circuit_and_expires_health() {
        let (orchestrator, store, clock) = engine();
        let a = ProviderId::new("a");
        store.import_health(HealthRecord::healthy(a.clone(), clock.now()));
        orchestrator.breakers().restore(&CircuitSnapshot {
            provider_id: a.clone(),
            state: CircuitState::Open,
            failure_count: 3,
            last_failure: Some(clock.now()),
            next_attempt: Some(clock.now() + ChronoDuration::days(365)),
            opened_at: Some(clock.now()),
            reopen_count: 0,
        });

        clock.advance(ChronoDuration::days(8));
        let report = orchestrator.reconcile().await;
        assert_eq!(report.stuck_circuits_reset, 1);
        // both providers' default health records have aged past the horizon
        assert_eq!(report.stale_health_purged, 2);
        assert_eq!(report.expired_rows_removed, 1);
        assert_eq!(report.quotas_reset, 6);
        assert_eq!(orchestrator.breakers().snapshot(&a).state, CircuitState::Closed);
        assert!(store
            .list_circuits()
            .await
            .unwrap()
            .iter()
            .all(|row| row.record.state == CircuitState::Closed));
        assert!(store.list_health().await.unwrap().is_empty());

        let again = orchestrator.reconcile().await;
        assert!(again.is_clean(), "second sweep changed state: {:?}", again);
    }

    // Writes a fresh health row for "a" right after the first health listing,
    // the way a routed call persisting mid-sweep would
    struct WriteAfterList {
        inner: InMemoryStore,
        fresh: HealthRecord,
        written: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl StateStore for WriteAfterList {
        async fn list_health(&self) -> Result<Vec<StoredRow<HealthRecord>>, StoreError> {
            let rows = self.inner.list_health().await?;
            if !self.written.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.inner.put_health(self.fresh.clone()).await?;
            }
            Ok(rows)
        }

        async fn list_quota(&self) -> Result<Vec<StoredRow<QuotaRecord>>, StoreError> {
            self.inner.list_quota().await
        }

        async fn list_circuits(&self) -> Result<Vec<StoredRow<CircuitSnapshot>>, StoreError> {
            self.inner.list_circuits().await
        }

        async fn put_health(&self, record: HealthRecord) -> Result<(), StoreError> {
            self.inner.put_health(record).await
        }

        async fn put_quota(&self, record: QuotaRecord) -> Result<(), StoreError> {
            self.inner.put_quota(record).await
        }

        async fn put_circuit(&self, snapshot: CircuitSnapshot) -> Result<(), StoreError> {
            self.inner.put_circuit(snapshot).await
        }

        async fn delete_rows(&self, table: Table, rows: &[RowVersion]) -> Result<usize, StoreError> {
            self.inner.delete_rows(table, rows).await
        }

        async fn delete_provider(&self, provider_id: &ProviderId) -> Result<usize, StoreError> {
            self.inner.delete_provider(provider_id).await
        }
    }

    #[tokio::test]
    async fn test_row_rewritten_during_sweep_is_kept() {
        let clock = Arc::new(ManualClock::default());
        let a = ProviderId::new("a");
        let inner = InMemoryStore::new();
        inner.import_health(HealthRecord::healthy(a.clone(), clock.now() - ChronoDuration::days(8)));
        let store = Arc::new(WriteAfterList {
            inner,
            fresh: HealthRecord::healthy(a.clone(), clock.now()),
            written: Default::default(),
        });
        let config = EngineConfig::from_json_str(
            r#"{ "providers": [{ "id": "a", "capability": "hotel", "priority": 1 }] }"#,
        )
        .unwrap();
        let orchestrator = Orchestrator::builder(config, Arc::new(MockSupplier::new()))
            .clock(clock.clone())
            .store(store.clone())
            .build()
            .unwrap();

        let report = orchestrator.reconcile().await;
        assert_eq!(report.expired_rows_removed, 0);
        assert_eq!(report.store_errors, 0);

        let health = store.list_health().await.unwrap();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].record.last_checked, clock.now());
    }

    #[tokio::test]
    async fn test_store_outage_is_reported_and_retried() {
        let (orchestrator, store, clock) = engine();
        store.import_health(HealthRecord::healthy(ProviderId::new("ghost"), clock.now()));
        store.set_unavailable(true);

        let report = orchestrator.reconcile().await;
        assert_eq!(report.store_errors, 3);

        store.set_unavailable(false);
        let report = orchestrator.reconcile().await;
        assert_eq!(report.orphan_rows_removed, 1);
        assert_eq!(report.store_errors, 0);
    }

    #[tokio::test]
    async fn test_maintenance_loop_runs_and_stops() {
        let (orchestrator, store, clock) = engine();
        store.import_health(HealthRecord::healthy(ProviderId::new("ghost"), clock.now()));

        let maintenance = Maintenance::spawn(orchestrator.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        maintenance.shutdown().await;

        assert!(store
            .list_health()
            .await
            .unwrap()
            .iter()
            .all(|row| row.record.provider_id != ProviderId::new("ghost")));
    }
}

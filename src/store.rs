//! Durable state seam.
//!
//! The relational store is an external collaborator; the engine only sees
//! the [`StateStore`] trait. Writes upsert by natural key, so the engine can
//! never create a second health row per provider or a second quota row per
//! (provider, service type). Rows that already violate that (legacy data) are
//! visible through the `list_*` calls and repaired by the reconciliation sweep.
//!
//! Every write stamps the row with a new version. Deletes name the version
//! they were planned against, so a row rewritten after it was read survives.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    model::{CircuitSnapshot, HealthRecord, ProviderId, QuotaRecord},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow<T> {
    pub row_id: u64,
    pub version: u64,
    pub record: T,
}

impl<T> StoredRow<T> {
    pub fn stamp(&self) -> RowVersion {
        RowVersion {
            row_id: self.row_id,
            version: self.version,
        }
    }
}

/// A row as it was when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowVersion {
    pub row_id: u64,
    pub version: u64,
}

/// Persisted records that belong to a provider.
pub trait ProviderRow {
    fn provider_id(&self) -> &ProviderId;
}

impl ProviderRow for HealthRecord {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }
}

impl ProviderRow for QuotaRecord {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }
}

impl ProviderRow for CircuitSnapshot {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }
}

/// Splits rows into the newest row per natural key and the rows it
/// supersedes.
pub fn newest_by_key<T, K, R>(
    rows: Vec<StoredRow<T>>,
    key: impl Fn(&T) -> K,
    recency: impl Fn(&StoredRow<T>) -> R,
) -> (HashMap<K, StoredRow<T>>, Vec<RowVersion>)
where
    K: Eq + Hash,
    R: Ord,
{
    let mut newest: HashMap<K, StoredRow<T>> = HashMap::new();
    let mut superseded = Vec::new();
    for row in rows {
        let k = key(&row.record);
        let replace = newest
            .get(&k)
            .map_or(true, |current| recency(&row) > recency(current));
        if replace {
            if let Some(old) = newest.insert(k, row) {
                superseded.push(old.stamp());
            }
        } else {
            superseded.push(row.stamp());
        }
    }
    superseded.sort_unstable();
    (newest, superseded)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Health,
    Quota,
    Circuit,
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn list_health(&self) -> Result<Vec<StoredRow<HealthRecord>>, StoreError>;

    async fn list_quota(&self) -> Result<Vec<StoredRow<QuotaRecord>>, StoreError>;

    async fn list_circuits(&self) -> Result<Vec<StoredRow<CircuitSnapshot>>, StoreError>;

    async fn put_health(&self, record: HealthRecord) -> Result<(), StoreError>;

    async fn put_quota(&self, record: QuotaRecord) -> Result<(), StoreError>;

    async fn put_circuit(&self, snapshot: CircuitSnapshot) -> Result<(), StoreError>;

    /// Deletes the listed rows that are still at the listed version. Rows
    /// written since they were read are left in place and not counted.
    async fn delete_rows(&self, table: Table, rows: &[RowVersion]) -> Result<usize, StoreError>;

    /// Removes every row belonging to `provider_id` across all tables.
    async fn delete_provider(&self, provider_id: &ProviderId) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    next_row_id: u64,
    health: Vec<StoredRow<HealthRecord>>,
    quota: Vec<StoredRow<QuotaRecord>>,
    circuits: Vec<StoredRow<CircuitSnapshot>>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_row_id += 1;
        self.next_row_id
    }
}

// Replace every row matching `same_key` with one row holding `record`.
// `next_id` doubles as the new version.
fn upsert<T>(rows: &mut Vec<StoredRow<T>>, next_id: u64, record: T, same_key: impl Fn(&T) -> bool) {
    let keep = rows
        .iter()
        .filter(|row| same_key(&row.record))
        .map(|row| row.row_id)
        .min();
    match keep {
        Some(row_id) => {
            rows.retain(|row| row.row_id == row_id || !same_key(&row.record));
            if let Some(row) = rows.iter_mut().find(|row| row.row_id == row_id) {
                row.version = next_id;
                row.record = record;
            }
        }
        None => rows.push(StoredRow {
            row_id: next_id,
            version: next_id,
            record,
        }),
    }
}

fn delete_unchanged<T>(rows: &mut Vec<StoredRow<T>>, targets: &[RowVersion]) -> usize {
    let before = rows.len();
    rows.retain(|row| !targets.contains(&row.stamp()));
    before - rows.len()
}

/// In-process store used by tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `StoreError::Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    /// Appends a raw health row without the uniqueness check (legacy import).
    pub fn import_health(&self, record: HealthRecord) -> u64 {
        let mut tables = self.tables.lock();
        let row_id = tables.next_id();
        tables.health.push(StoredRow {
            row_id,
            version: row_id,
            record,
        });
        row_id
    }

    /// Appends a raw quota row without the uniqueness check (legacy import).
    pub fn import_quota(&self, record: QuotaRecord) -> u64 {
        let mut tables = self.tables.lock();
        let row_id = tables.next_id();
        tables.quota.push(StoredRow {
            row_id,
            version: row_id,
            record,
        });
        row_id
    }

    /// Appends a raw circuit row without the uniqueness check (legacy import).
    pub fn import_circuit(&self, snapshot: CircuitSnapshot) -> u64 {
        let mut tables = self.tables.lock();
        let row_id = tables.next_id();
        tables.circuits.push(StoredRow {
            row_id,
            version: row_id,
            record: snapshot,
        });
        row_id
    }

    pub fn row_counts(&self) -> (usize, usize, usize) {
        let tables = self.tables.lock();
        (tables.health.len(), tables.quota.len(), tables.circuits.len())
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn list_health(&self) -> Result<Vec<StoredRow<HealthRecord>>, StoreError> {
        self.check()?;
        Ok(self.tables.lock().health.clone())
    }

    async fn list_quota(&self) -> Result<Vec<StoredRow<QuotaRecord>>, StoreError> {
        self.check()?;
        Ok(self.tables.lock().quota.clone())
    }

    async fn list_circuits(&self) -> Result<Vec<StoredRow<CircuitSnapshot>>, StoreError> {
        self.check()?;
        Ok(self.tables.lock().circuits.clone())
    }

    async fn put_health(&self, record: HealthRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let next_id = tables.next_id();
        let provider_id = record.provider_id.clone();
        upsert(&mut tables.health, next_id, record, |r| r.provider_id == provider_id);
        Ok(())
    }

    async fn put_quota(&self, record: QuotaRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let next_id = tables.next_id();
        let key = (record.provider_id.clone(), record.service_type);
        upsert(&mut tables.quota, next_id, record, |r| {
            r.provider_id == key.0 && r.service_type == key.1
        });
        Ok(())
    }

    async fn put_circuit(&self, snapshot: CircuitSnapshot) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let next_id = tables.next_id();
        let provider_id = snapshot.provider_id.clone();
        upsert(&mut tables.circuits, next_id, snapshot, |r| r.provider_id == provider_id);
        Ok(())
    }

    async fn delete_rows(&self, table: Table, rows: &[RowVersion]) -> Result<usize, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let removed = match table {
            Table::Health => delete_unchanged(&mut tables.health, rows),
            Table::Quota => delete_unchanged(&mut tables.quota, rows),
            Table::Circuit => delete_unchanged(&mut tables.circuits, rows),
        };
        Ok(removed)
    }

    async fn delete_provider(&self, provider_id: &ProviderId) -> Result<usize, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let before = tables.health.len() + tables.quota.len() + tables.circuits.len();
        tables.health.retain(|row| &row.record.provider_id != provider_id);
        tables.quota.retain(|row| &row.record.provider_id != provider_id);
        tables.circuits.retain(|row| &row.record.provider_id != provider_id);
        let after = tables.health.len() + tables.quota.len() + tables.circuits.len();
        Ok(before - after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceType;
    use chrono::Utc;

    #[tokio::test]
    async fn test_put_collapses_to_one_row_per_key() {
        let store = InMemoryStore::new();
        let id = ProviderId::new("a");
        let now = Utc::now();
        store.import_health(HealthRecord::healthy(id.clone(), now));
        store.import_health(HealthRecord::healthy(id.clone(), now));
        assert_eq!(store.row_counts().0, 2);

        store.put_health(HealthRecord::healthy(id.clone(), now)).await.unwrap();
        let rows = store.list_health().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_id, 1);

        store
            .put_quota(QuotaRecord::new(id.clone(), ServiceType::Search, 10, 60, now))
            .await
            .unwrap();
        store
            .put_quota(QuotaRecord::new(id.clone(), ServiceType::Booking, 10, 60, now))
            .await
            .unwrap();
        store
            .put_quota(QuotaRecord::new(id.clone(), ServiceType::Search, 20, 60, now))
            .await
            .unwrap();
        let quota = store.list_quota().await.unwrap();
        assert_eq!(quota.len(), 2);
        assert!(quota
            .iter()
            .any(|row| row.record.service_type == ServiceType::Search && row.record.quota_limit == 20));
    }

    #[test]
    fn test_newest_by_key_reports_superseded_rows() {
        let now = Utc::now();
        let row = |row_id, id: &str, checked| StoredRow {
            row_id,
            version: row_id + 10,
            record: HealthRecord::healthy(ProviderId::new(id), checked),
        };
        let rows = vec![
            row(1, "a", now),
            row(2, "b", now),
            row(3, "a", now - chrono::Duration::minutes(1)),
        ];
        let (newest, superseded) = newest_by_key(
            rows,
            |record| record.provider_id.clone(),
            |row| (row.record.last_checked, row.row_id),
        );
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[&ProviderId::new("a")].row_id, 1);
        assert_eq!(superseded, vec![RowVersion { row_id: 3, version: 13 }]);
    }

    #[tokio::test]
    async fn test_delete_skips_rows_rewritten_since_read() {
        let store = InMemoryStore::new();
        let id = ProviderId::new("a");
        let now = Utc::now();
        store.put_health(HealthRecord::healthy(id.clone(), now)).await.unwrap();
        let read = store.list_health().await.unwrap()[0].stamp();

        store.put_health(HealthRecord::healthy(id.clone(), now)).await.unwrap();
        let current = store.list_health().await.unwrap()[0].stamp();
        assert_eq!(current.row_id, read.row_id);
        assert!(current.version > read.version);

        assert_eq!(store.delete_rows(Table::Health, &[read]).await.unwrap(), 0);
        assert_eq!(store.row_counts().0, 1);
        assert_eq!(store.delete_rows(Table::Health, &[current]).await.unwrap(), 1);
        assert_eq!(store.row_counts().0, 0);
    }

    #[tokio::test]
    async fn test_delete_provider_cascades() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let a = ProviderId::new("a");
        let b = ProviderId::new("b");
        store.put_health(HealthRecord::healthy(a.clone(), now)).await.unwrap();
        store.put_health(HealthRecord::healthy(b.clone(), now)).await.unwrap();
        store
            .put_quota(QuotaRecord::new(a.clone(), ServiceType::Search, 10, 60, now))
            .await
            .unwrap();

        assert_eq!(store.delete_provider(&a).await.unwrap(), 2);
        assert_eq!(store.row_counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store.list_health().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_unavailable(false);
        assert!(store.list_health().await.unwrap().is_empty());
    }
}

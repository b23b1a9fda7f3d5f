use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{
    DeleteRequest, SelectRequest, StoreError, StoreResult, Transaction, TransactionalStore,
};
use crate::keys::{KeyDecoder, OrderedKeyCodec};
use crate::types::{Datum, Datums, RangeDescriptor, RawKey, TableDescriptor, TableId};

/// A stored row. Only the primary key and TTL bookkeeping are kept.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub pk: Datums,
    pub expires_at: DateTime<Utc>,
    /// Commit timestamp, rows are invisible to reads as of an earlier time.
    pub written_at: DateTime<Utc>,
}

/// Failures injected into the store for testing error paths.
#[derive(Debug, Clone, Default)]
pub struct FaultInjection {
    /// Fail the n-th (1-based) range descriptor scan.
    pub fail_range_scan: Option<usize>,
    /// Fail the n-th (1-based) delete statement.
    pub fail_delete: Option<usize>,
    /// Bump the table's schema version once this many delete transactions committed.
    pub schema_change_after_deletes: Option<(TableId, usize)>,
}

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub transactions: usize,
    pub commits: usize,
    pub range_scans: usize,
    pub selects: usize,
    pub deletes: usize,
    pub delete_commits: usize,
    pub rows_deleted: u64,
}

#[derive(Debug)]
struct TableState {
    descriptor: TableDescriptor,
    rows: BTreeMap<RawKey, StoredRow>,
}

#[derive(Debug)]
struct StoreState {
    tables: HashMap<TableId, TableState>,
    /// Range descriptors keyed by end key.
    ranges: BTreeMap<RawKey, RangeDescriptor>,
    next_range_id: u64,
    faults: FaultInjection,
    stats: StoreStats,
}

/// In-memory ordered store with range addressing, used by tests and the
/// `ttljob` demo harness.
///
/// The keyspace starts as a single range `[/Min, /Max)` and is split
/// explicitly. Writes of a transaction are buffered until commit.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    codec: OrderedKeyCodec,
    latency: Option<Duration>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let mut ranges = BTreeMap::new();
        ranges.insert(
            RawKey::max(),
            RangeDescriptor {
                range_id: 1,
                start_key: RawKey::MIN,
                end_key: RawKey::max(),
            },
        );

        Self {
            state: Arc::new(Mutex::new(StoreState {
                tables: HashMap::new(),
                ranges,
                next_range_id: 2,
                faults: FaultInjection::default(),
                stats: StoreStats::default(),
            })),
            codec: OrderedKeyCodec,
            latency: None,
        }
    }

    /// Delay every transactional operation, to widen race windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        lock_state(&self.state)
    }

    pub fn create_table(&self, descriptor: TableDescriptor) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.tables.contains_key(&descriptor.id) {
            return Err(StoreError::Internal(format!(
                "table {} already exists",
                descriptor.id
            )));
        }
        state.tables.insert(
            descriptor.id,
            TableState {
                descriptor,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Insert a row visible at every read timestamp.
    pub fn insert_row(
        &self,
        table: TableId,
        pk: Datums,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.insert_row_written_at(table, pk, expires_at, DateTime::<Utc>::MIN_UTC)
    }

    pub fn insert_row_written_at(
        &self,
        table: TableId,
        pk: Datums,
        expires_at: DateTime<Utc>,
        written_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        let table_state = state
            .tables
            .get_mut(&table)
            .ok_or(StoreError::TableNotFound(table))?;
        let desc = &table_state.descriptor;
        let key =
            self.codec
                .encode_primary_key(desc.id, desc.primary_index, &desc.primary_key, &pk)?;
        table_state.rows.insert(
            key,
            StoredRow {
                pk,
                expires_at,
                written_at,
            },
        );
        Ok(())
    }

    /// Simulates a schema change: bumps the version and modification time.
    pub fn alter_table(&self, table: TableId) -> StoreResult<TableDescriptor> {
        let mut state = self.lock()?;
        let table_state = state
            .tables
            .get_mut(&table)
            .ok_or(StoreError::TableNotFound(table))?;
        bump_version(&mut table_state.descriptor);
        Ok(table_state.descriptor.clone())
    }

    /// Split the range containing `key` so that a new range starts at `key`.
    pub fn split_at(&self, key: RawKey) -> StoreResult<()> {
        let mut state = self.lock()?;
        split_range(&mut state, key);
        Ok(())
    }

    /// Split at the key of the given primary-key tuple.
    pub fn split_table_at(&self, table: TableId, pk: &[Datum]) -> StoreResult<()> {
        let key = self.encode_key(table, pk)?;
        self.split_at(key)
    }

    /// Split so that the table's primary index lives in ranges of its own.
    pub fn split_at_table_boundaries(&self, table: TableId) -> StoreResult<()> {
        let index = {
            let state = self.lock()?;
            state
                .tables
                .get(&table)
                .ok_or(StoreError::TableNotFound(table))?
                .descriptor
                .primary_index
        };
        let span = self.codec.primary_index_span(table, index);
        self.split_at(span.key)?;
        self.split_at(span.end_key)
    }

    fn encode_key(&self, table: TableId, pk: &[Datum]) -> StoreResult<RawKey> {
        let state = self.lock()?;
        let desc = &state
            .tables
            .get(&table)
            .ok_or(StoreError::TableNotFound(table))?
            .descriptor;
        Ok(self
            .codec
            .encode_primary_key(desc.id, desc.primary_index, &desc.primary_key, pk)?)
    }

    pub fn ranges(&self) -> StoreResult<Vec<RangeDescriptor>> {
        Ok(self.lock()?.ranges.values().cloned().collect())
    }

    pub fn row_count(&self, table: TableId) -> StoreResult<usize> {
        let state = self.lock()?;
        Ok(state
            .tables
            .get(&table)
            .ok_or(StoreError::TableNotFound(table))?
            .rows
            .len())
    }

    pub fn descriptor(&self, table: TableId) -> StoreResult<TableDescriptor> {
        let state = self.lock()?;
        Ok(state
            .tables
            .get(&table)
            .ok_or(StoreError::TableNotFound(table))?
            .descriptor
            .clone())
    }

    pub fn set_faults(&self, faults: FaultInjection) -> StoreResult<()> {
        self.lock()?.faults = faults;
        Ok(())
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        Ok(self.lock()?.stats)
    }
}

fn lock_state(state: &Mutex<StoreState>) -> StoreResult<MutexGuard<'_, StoreState>> {
    state
        .lock()
        .map_err(|_| StoreError::Internal("store state lock poisoned".to_string()))
}

fn bump_version(descriptor: &mut TableDescriptor) {
    descriptor.version = descriptor.version.next();
    descriptor.modification_time = Utc::now();
}

fn split_range(state: &mut StoreState, key: RawKey) {
    let Some(existing) = state
        .ranges
        .range((Bound::Excluded(key.clone()), Bound::Unbounded))
        .next()
        .map(|(_, desc)| desc.clone())
    else {
        return;
    };
    if existing.start_key == key {
        return;
    }

    let left = RangeDescriptor {
        range_id: state.next_range_id,
        start_key: existing.start_key.clone(),
        end_key: key.clone(),
    };
    state.next_range_id += 1;

    state.ranges.insert(
        existing.end_key.clone(),
        RangeDescriptor {
            range_id: existing.range_id,
            start_key: key.clone(),
            end_key: existing.end_key,
        },
    );
    state.ranges.insert(key, left);
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn begin(&self, cancel: &CancellationToken) -> StoreResult<Box<dyn Transaction>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        self.lock()?.stats.transactions += 1;

        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            codec: self.codec,
            cancel: cancel.clone(),
            latency: self.latency,
            pending_deletes: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<StoreState>>,
    codec: OrderedKeyCodec,
    cancel: CancellationToken,
    latency: Option<Duration>,
    pending_deletes: Vec<(TableId, RawKey)>,
}

impl MemoryTransaction {
    /// Suspension point of every operation.
    async fn yield_point(&self) -> StoreResult<()> {
        if let Some(latency) = self.latency {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        } else {
            tokio::task::yield_now().await;
        }

        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        lock_state(&self.state)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn table_descriptor(&mut self, table: TableId) -> StoreResult<TableDescriptor> {
        self.yield_point().await?;

        let state = self.lock()?;
        state
            .tables
            .get(&table)
            .map(|t| t.descriptor.clone())
            .ok_or(StoreError::TableNotFound(table))
    }

    async fn scan_range_descriptors(
        &mut self,
        after: &RawKey,
        until: Option<&RawKey>,
        limit: usize,
    ) -> StoreResult<Vec<RangeDescriptor>> {
        self.yield_point().await?;

        let mut state = self.lock()?;
        state.stats.range_scans += 1;
        if state.faults.fail_range_scan == Some(state.stats.range_scans) {
            return Err(StoreError::RangeScan(format!(
                "injected failure on scan {}",
                state.stats.range_scans
            )));
        }

        let upper = match until {
            Some(until) if until <= after => return Ok(vec![]),
            Some(until) => Bound::Included(until.clone()),
            None => Bound::Unbounded,
        };
        Ok(state
            .ranges
            .range((Bound::Excluded(after.clone()), upper))
            .take(limit)
            .map(|(_, desc)| desc.clone())
            .collect())
    }

    async fn select_expired(&mut self, request: &SelectRequest<'_>) -> StoreResult<Vec<Datums>> {
        self.yield_point().await?;

        let mut state = self.lock()?;
        state.stats.selects += 1;

        let span = self
            .codec
            .primary_index_span(request.table, request.index);
        let lower = if request.start_pk.is_empty() {
            span.key
        } else {
            self.codec.encode_primary_key(
                request.table,
                request.index,
                request.pk_columns,
                request.start_pk,
            )?
        };
        let upper = if request.end_pk.is_empty() {
            span.end_key
        } else {
            self.codec.encode_primary_key(
                request.table,
                request.index,
                request.pk_columns,
                request.end_pk,
            )?
        };
        if lower >= upper {
            return Ok(vec![]);
        }

        let table = state
            .tables
            .get(&request.table)
            .ok_or(StoreError::TableNotFound(request.table))?;
        let pending: HashSet<&RawKey> = self
            .pending_deletes
            .iter()
            .filter(|(t, _)| *t == request.table)
            .map(|(_, key)| key)
            .collect();

        Ok(table
            .rows
            .range(lower..upper)
            .filter(|(key, row)| {
                row.written_at <= request.as_of
                    && row.expires_at < request.cutoff
                    && !pending.contains(key)
            })
            .take(request.limit)
            .map(|(_, row)| row.pk.clone())
            .collect())
    }

    async fn delete_expired(&mut self, request: &DeleteRequest<'_>) -> StoreResult<u64> {
        self.yield_point().await?;

        let mut state = self.lock()?;
        state.stats.deletes += 1;
        if state.faults.fail_delete == Some(state.stats.deletes) {
            return Err(StoreError::Conflict(format!(
                "injected failure on delete {}",
                state.stats.deletes
            )));
        }

        let table = state
            .tables
            .get(&request.table)
            .ok_or(StoreError::TableNotFound(request.table))?;

        let mut matched = Vec::new();
        for pk in request.rows {
            let key = self.codec.encode_primary_key(
                request.table,
                request.index,
                request.pk_columns,
                pk,
            )?;
            let expired = table
                .rows
                .get(&key)
                .is_some_and(|row| row.expires_at < request.cutoff);
            let already_pending = self
                .pending_deletes
                .iter()
                .any(|(t, k)| *t == request.table && *k == key);
            if expired && !already_pending && !matched.contains(&key) {
                matched.push(key);
            }
        }
        drop(state);

        let deleted = matched.len() as u64;
        self.pending_deletes
            .extend(matched.into_iter().map(|key| (request.table, key)));
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.yield_point().await?;

        let mut state = self.lock()?;
        state.stats.commits += 1;
        if self.pending_deletes.is_empty() {
            return Ok(());
        }

        let mut deleted = 0u64;
        for (table, key) in &self.pending_deletes {
            if let Some(table_state) = state.tables.get_mut(table)
                && table_state.rows.remove(key).is_some()
            {
                deleted += 1;
            }
        }
        state.stats.rows_deleted += deleted;
        state.stats.delete_commits += 1;

        if let Some((table, after)) = state.faults.schema_change_after_deletes
            && state.stats.delete_commits == after
            && let Some(table_state) = state.tables.get_mut(&table)
        {
            bump_version(&mut table_state.descriptor);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ColumnType, DescriptorVersion, IndexId, PrimaryKeyColumn, RowLevelTtl,
    };
    use chrono::Duration as ChronoDuration;

    const TABLE: TableId = TableId(60);

    fn descriptor() -> TableDescriptor {
        TableDescriptor {
            id: TABLE,
            database: "defaultdb".to_string(),
            schema: "public".to_string(),
            name: "sessions".to_string(),
            version: DescriptorVersion(1),
            modification_time: Utc::now() - ChronoDuration::hours(1),
            primary_index: IndexId(1),
            primary_key: vec![PrimaryKeyColumn::ascending("id", ColumnType::Int)],
            ttl: Some(RowLevelTtl::default()),
        }
    }

    fn seeded_store(rows: i64) -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_table(descriptor()).unwrap();
        let expired = Utc::now() - ChronoDuration::days(1);
        for id in 0..rows {
            store.insert_row(TABLE, vec![Datum::Int(id)], expired).unwrap();
        }
        store
    }

    fn select_request<'a>(
        pk: &'a [PrimaryKeyColumn],
        start: &'a [Datum],
        end: &'a [Datum],
        limit: usize,
    ) -> SelectRequest<'a> {
        SelectRequest {
            table: TABLE,
            index: IndexId(1),
            expiration_column: "expires_at",
            pk_columns: pk,
            start_pk: start,
            end_pk: end,
            cutoff: Utc::now(),
            as_of: Utc::now(),
            limit,
        }
    }

    #[test]
    fn test_split_keeps_ranges_contiguous() {
        let store = seeded_store(0);
        store.split_table_at(TABLE, &[Datum::Int(10)]).unwrap();
        store.split_table_at(TABLE, &[Datum::Int(20)]).unwrap();
        store.split_table_at(TABLE, &[Datum::Int(10)]).unwrap();

        let ranges = store.ranges().unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].start_key, RawKey::MIN);
        assert_eq!(ranges[2].end_key, RawKey::max());
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end_key, pair[1].start_key);
        }
    }

    #[tokio::test]
    async fn test_scan_range_descriptors_by_end_key() {
        let store = seeded_store(0);
        for id in [10, 20, 30] {
            store.split_table_at(TABLE, &[Datum::Int(id)]).unwrap();
        }
        let ranges = store.ranges().unwrap();
        let cancel = CancellationToken::new();

        let mut txn = store.begin(&cancel).await.unwrap();
        let first_two = txn
            .scan_range_descriptors(&RawKey::MIN, None, 2)
            .await
            .unwrap();
        assert_eq!(first_two, ranges[..2].to_vec());

        let bounded = txn
            .scan_range_descriptors(&ranges[0].end_key, Some(&ranges[2].end_key), 10)
            .await
            .unwrap();
        assert_eq!(bounded, ranges[1..3].to_vec());
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_select_respects_bounds_limit_and_as_of() {
        let store = seeded_store(10);
        let recent = Utc::now() + ChronoDuration::minutes(5);
        store
            .insert_row_written_at(
                TABLE,
                vec![Datum::Int(3)],
                Utc::now() - ChronoDuration::days(1),
                recent,
            )
            .unwrap();
        let pk = descriptor().primary_key;
        let cancel = CancellationToken::new();

        let mut txn = store.begin(&cancel).await.unwrap();
        let start = [Datum::Int(2)];
        let end = [Datum::Int(8)];
        let rows = txn
            .select_expired(&select_request(&pk, &start, &end, 3))
            .await
            .unwrap();

        // Row 3 was rewritten after the read timestamp.
        assert_eq!(
            rows,
            vec![vec![Datum::Int(2)], vec![Datum::Int(4)], vec![Datum::Int(5)]]
        );
    }

    #[tokio::test]
    async fn test_delete_applies_on_commit_only() {
        let store = seeded_store(4);
        let pk = descriptor().primary_key;
        let cancel = CancellationToken::new();
        let rows = vec![vec![Datum::Int(0)], vec![Datum::Int(1)], vec![Datum::Int(99)]];
        let request = DeleteRequest {
            table: TABLE,
            index: IndexId(1),
            expiration_column: "expires_at",
            pk_columns: &pk,
            cutoff: Utc::now(),
            rows: &rows,
        };

        let mut rolled_back = store.begin(&cancel).await.unwrap();
        assert_eq!(rolled_back.delete_expired(&request).await.unwrap(), 2);
        drop(rolled_back);
        assert_eq!(store.row_count(TABLE).unwrap(), 4);

        let mut txn = store.begin(&cancel).await.unwrap();
        assert_eq!(txn.delete_expired(&request).await.unwrap(), 2);
        txn.commit().await.unwrap();
        assert_eq!(store.row_count(TABLE).unwrap(), 2);

        let mut again = store.begin(&cancel).await.unwrap();
        assert_eq!(again.delete_expired(&request).await.unwrap(), 0);
        again.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_range_scan_failure() {
        let store = seeded_store(0);
        store
            .set_faults(FaultInjection {
                fail_range_scan: Some(2),
                ..Default::default()
            })
            .unwrap();
        let cancel = CancellationToken::new();

        let mut txn = store.begin(&cancel).await.unwrap();
        assert!(txn.scan_range_descriptors(&RawKey::MIN, None, 1).await.is_ok());
        let err = txn
            .scan_range_descriptors(&RawKey::MIN, None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RangeScan(_)));
    }

    #[tokio::test]
    async fn test_cancelled_transaction_fails() {
        let store = seeded_store(1).with_latency(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let mut txn = store.begin(&cancel).await.unwrap();

        cancel.cancel();
        let err = txn.table_descriptor(TABLE).await.unwrap_err();
        assert_eq!(err, StoreError::Cancelled);
        assert_eq!(
            store.begin(&cancel).await.err(),
            Some(StoreError::Cancelled)
        );
    }

    #[test]
    fn test_alter_table_bumps_version() {
        let store = seeded_store(0);
        let before = store.descriptor(TABLE).unwrap();
        let after = store.alter_table(TABLE).unwrap();

        assert_eq!(after.version, before.version.next());
        assert!(after.modification_time > before.modification_time);
    }
}

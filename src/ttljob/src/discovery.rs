//! Range discovery over the range-addressing metadata.
//!
//! Ranges are addressed by their end key. Each batch scans the descriptors
//! whose end key lies in `(cursor, span_end]` within one transaction and moves
//! the cursor to the last end key seen, so every range is emitted once and in
//! ascending key order.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TtlJobError;
use crate::job::TtlJobSpec;
use crate::keys::{DecodedKey, KeyDecoder};
use crate::store::{StoreError, TransactionalStore};
use crate::types::{
    Datum, Datums, IndexId, PrimaryKeyColumn, RangeDescriptor, RangeToProcess, RawKey, Span,
    TableId,
};

/// Lazy, finite, non-restartable stream of the ranges covering a table span.
pub struct RangeDiscoverer {
    store: Arc<dyn TransactionalStore>,
    keys: Arc<dyn KeyDecoder>,
    table: TableId,
    index: IndexId,
    primary_key: Vec<PrimaryKeyColumn>,
    span: Span,
    batch_size: usize,
    cancel: CancellationToken,
    cursor: RawKey,
    buffered: VecDeque<RangeToProcess>,
    done: bool,
    scans: usize,
}

impl RangeDiscoverer {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        keys: Arc<dyn KeyDecoder>,
        spec: &TtlJobSpec,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            keys,
            table: spec.table_id,
            index: spec.primary_index,
            primary_key: spec.primary_key.clone(),
            span: spec.span.clone(),
            batch_size: spec.settings.range_batch_size.max(1),
            cancel,
            cursor: spec.span.key.clone(),
            buffered: VecDeque::new(),
            done: false,
            scans: 0,
        }
    }

    /// Number of metadata scans issued so far.
    pub fn scans(&self) -> usize {
        self.scans
    }

    /// Next range, `None` once the span is exhausted.
    pub async fn next(&mut self) -> Result<Option<RangeToProcess>, TtlJobError> {
        loop {
            if let Some(range) = self.buffered.pop_front() {
                return Ok(Some(range));
            }
            if self.done {
                return Ok(None);
            }
            self.fetch_batch().await.map_err(TtlJobError::discovery)?;
        }
    }

    async fn fetch_batch(&mut self) -> Result<(), TtlJobError> {
        if self.cancel.is_cancelled() {
            return Err(TtlJobError::Cancelled);
        }
        if self.cursor >= self.span.end_key {
            self.done = true;
            return Ok(());
        }

        let mut txn = self.store.begin(&self.cancel).await?;
        let mut descriptors = txn
            .scan_range_descriptors(&self.cursor, Some(&self.span.end_key), self.batch_size)
            .await?;
        self.scans += 1;

        if descriptors.len() < self.batch_size {
            self.done = true;
            let reached_end = descriptors
                .last()
                .is_some_and(|desc| desc.end_key == self.span.end_key);
            if !reached_end {
                // The range holding the span end is addressed past it.
                let last = txn
                    .scan_range_descriptors(&self.span.end_key, None, 1)
                    .await?;
                self.scans += 1;
                if last.is_empty() {
                    return Err(StoreError::RangeScan(format!(
                        "no range descriptor covers key {}",
                        self.span.end_key
                    ))
                    .into());
                }
                descriptors.extend(last);
            }
        }
        txn.commit().await?;

        debug!(
            table = %self.table,
            ranges = descriptors.len(),
            scans = self.scans,
            "Discovered range batch"
        );

        for desc in descriptors {
            let range = self.to_range(&desc)?;
            self.cursor = desc.end_key;
            self.buffered.push_back(range);
        }
        Ok(())
    }

    fn to_range(&self, desc: &RangeDescriptor) -> Result<RangeToProcess, TtlJobError> {
        Ok(RangeToProcess {
            range_id: desc.range_id,
            start_pk: self.key_to_datums(&desc.start_key)?,
            end_pk: self.key_to_datums(&desc.end_key)?,
        })
    }

    /// Keys outside the table's primary index, or holding a NULL, map to an
    /// open bound.
    fn key_to_datums(&self, key: &RawKey) -> Result<Datums, TtlJobError> {
        let decoded = self
            .keys
            .decode_primary_key(key, self.table, self.index, &self.primary_key)?;
        Ok(match decoded {
            DecodedKey::OutsideTable | DecodedKey::OutsideIndex => Vec::new(),
            DecodedKey::Tuple(datums) if datums.iter().any(Datum::is_null) => Vec::new(),
            DecodedKey::Tuple(datums) => datums,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::OrderedKeyCodec;
    use crate::settings::JobSettings;
    use crate::store::{FaultInjection, InMemoryStore};
    use crate::types::{ColumnType, DescriptorVersion, RowLevelTtl, TableDescriptor};
    use chrono::{Duration as ChronoDuration, Utc};

    const TABLE: TableId = TableId(100);

    fn setup(splits: &[i64], range_batch_size: usize) -> (InMemoryStore, TtlJobSpec) {
        let store = InMemoryStore::new();
        let primary_key = vec![PrimaryKeyColumn::ascending("id", ColumnType::Int)];
        store
            .create_table(TableDescriptor {
                id: TABLE,
                database: "defaultdb".to_string(),
                schema: "public".to_string(),
                name: "t".to_string(),
                version: DescriptorVersion(1),
                modification_time: Utc::now() - ChronoDuration::hours(1),
                primary_index: IndexId(1),
                primary_key: primary_key.clone(),
                ttl: Some(RowLevelTtl::default()),
            })
            .unwrap();
        store.split_at_table_boundaries(TABLE).unwrap();
        for id in splits {
            store.split_table_at(TABLE, &[Datum::Int(*id)]).unwrap();
        }

        let spec = TtlJobSpec {
            table_id: TABLE,
            relation: "defaultdb.public.t".to_string(),
            cutoff: Utc::now(),
            aost: Utc::now(),
            primary_index: IndexId(1),
            primary_key,
            expiration_column: "expires_at".to_string(),
            settings: JobSettings {
                select_batch_size: 100,
                delete_batch_size: 100,
                range_concurrency: 1,
                delete_rate_limit: 0,
                range_batch_size,
            },
            span: OrderedKeyCodec.primary_index_span(TABLE, IndexId(1)),
            version: DescriptorVersion(1),
        };
        (store, spec)
    }

    async fn collect(discoverer: &mut RangeDiscoverer) -> Vec<RangeToProcess> {
        let mut ranges = Vec::new();
        while let Some(range) = discoverer.next().await.unwrap() {
            ranges.push(range);
        }
        ranges
    }

    fn discoverer(store: &InMemoryStore, spec: &TtlJobSpec) -> RangeDiscoverer {
        RangeDiscoverer::new(
            Arc::new(store.clone()),
            Arc::new(OrderedKeyCodec),
            spec,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_batches_cover_span_in_order() {
        // Table boundaries plus four splits: five ranges inside the index span.
        let (store, spec) = setup(&[10, 20, 30, 40], 2);
        let mut discoverer = discoverer(&store, &spec);

        let ranges = collect(&mut discoverer).await;

        let bounds: Vec<(Datums, Datums)> = ranges
            .iter()
            .map(|r| (r.start_pk.clone(), r.end_pk.clone()))
            .collect();
        assert_eq!(
            bounds,
            vec![
                (vec![], vec![Datum::Int(10)]),
                (vec![Datum::Int(10)], vec![Datum::Int(20)]),
                (vec![Datum::Int(20)], vec![Datum::Int(30)]),
                (vec![Datum::Int(30)], vec![Datum::Int(40)]),
                (vec![Datum::Int(40)], vec![]),
            ]
        );
        assert_eq!(discoverer.scans(), 3);
        assert!(discoverer.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_last_batch_stops_at_span_end() {
        let (store, spec) = setup(&[10, 20, 30], 2);
        let mut discoverer = discoverer(&store, &spec);

        let ranges = collect(&mut discoverer).await;

        assert_eq!(ranges.len(), 4);
        assert_eq!(discoverer.scans(), 2);
    }

    #[tokio::test]
    async fn test_span_end_inside_range_fetches_one_more() {
        // No table boundary splits: one range spans the whole keyspace.
        let store = InMemoryStore::new();
        let (_, spec) = setup(&[], 5);
        store
            .create_table(store_descriptor_of(&spec))
            .unwrap();
        store.split_table_at(TABLE, &[Datum::Int(50)]).unwrap();
        let mut discoverer = discoverer(&store, &spec);

        let ranges = collect(&mut discoverer).await;

        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start_pk, Vec::<Datum>::new());
        assert_eq!(ranges[0].end_pk, vec![Datum::Int(50)]);
        assert_eq!(ranges[1].start_pk, vec![Datum::Int(50)]);
        assert_eq!(ranges[1].end_pk, Vec::<Datum>::new());
        // One short scan plus the boundary confirmation.
        assert_eq!(discoverer.scans(), 2);
    }

    #[tokio::test]
    async fn test_scan_failure_is_fatal() {
        let (store, spec) = setup(&[10, 20, 30, 40], 2);
        store
            .set_faults(FaultInjection {
                fail_range_scan: Some(2),
                ..Default::default()
            })
            .unwrap();
        let mut discoverer = discoverer(&store, &spec);

        assert!(discoverer.next().await.unwrap().is_some());
        assert!(discoverer.next().await.unwrap().is_some());
        let err = discoverer.next().await.unwrap_err();

        assert!(matches!(err, TtlJobError::Discovery(_)));
        assert!(err.to_string().starts_with("error discovering ranges"));
    }

    #[tokio::test]
    async fn test_cancelled_discovery_stops() {
        let (store, spec) = setup(&[10], 1);
        let cancel = CancellationToken::new();
        let mut discoverer = RangeDiscoverer::new(
            Arc::new(store.clone()),
            Arc::new(OrderedKeyCodec),
            &spec,
            cancel.clone(),
        );

        assert!(discoverer.next().await.unwrap().is_some());
        cancel.cancel();
        let err = discoverer.next().await.unwrap_err();

        assert!(err.is_cancelled());
    }

    #[test]
    fn test_null_and_foreign_keys_are_open_bounds() {
        let (store, spec) = setup(&[], 1);
        let discoverer = discoverer(&store, &spec);
        let codec = OrderedKeyCodec;

        let open: Datums = Vec::new();
        assert_eq!(discoverer.key_to_datums(&RawKey::MIN).unwrap(), open);
        assert_eq!(discoverer.key_to_datums(&RawKey::max()).unwrap(), open);
        let other_index = codec.index_prefix(TABLE, IndexId(2));
        assert_eq!(discoverer.key_to_datums(&other_index).unwrap(), open);

        let null_key = codec
            .encode_primary_key(TABLE, IndexId(1), &spec.primary_key, &[Datum::Null])
            .unwrap();
        assert_eq!(discoverer.key_to_datums(&null_key).unwrap(), open);
    }

    #[test]
    fn test_undecodable_key_is_an_error() {
        let (store, spec) = setup(&[], 1);
        let discoverer = discoverer(&store, &spec);
        let mut bytes = OrderedKeyCodec
            .index_prefix(TABLE, IndexId(1))
            .into_bytes();
        bytes.push(0x7e);

        let err = discoverer.key_to_datums(&RawKey::new(bytes)).unwrap_err();
        assert!(matches!(err, TtlJobError::KeyDecode(_)));
    }

    fn store_descriptor_of(spec: &TtlJobSpec) -> TableDescriptor {
        TableDescriptor {
            id: spec.table_id,
            database: "defaultdb".to_string(),
            schema: "public".to_string(),
            name: "t".to_string(),
            version: spec.version,
            modification_time: Utc::now() - ChronoDuration::hours(1),
            primary_index: spec.primary_index,
            primary_key: spec.primary_key.clone(),
            ttl: Some(RowLevelTtl::default()),
        }
    }
}

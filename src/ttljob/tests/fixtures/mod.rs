//! Shared fixtures for TTL job integration tests.
#![allow(dead_code)]

use std::ops::Range;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::TtlConfig;
use ttljob::types::{
    ColumnType, Datum, DescriptorVersion, IndexId, PrimaryKeyColumn, RowLevelTtl, TableDescriptor,
    TableId,
};
use ttljob::{InMemoryStore, JobExecContext, OrderedKeyCodec, TtlJobDetails};

pub const TABLE: TableId = TableId(200);
pub const RELATION: &str = "defaultdb.public.events";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ttljob=debug")
        .with_test_writer()
        .try_init();
}

pub fn ttl(select_batch_size: u64, delete_batch_size: u64, range_concurrency: u64) -> RowLevelTtl {
    RowLevelTtl {
        select_batch_size,
        delete_batch_size,
        range_concurrency,
        ..Default::default()
    }
}

/// An `events` table keyed by an integer id, living in ranges of its own.
pub struct TableFixture {
    pub store: InMemoryStore,
    pub table: TableId,
}

impl TableFixture {
    pub fn new(ttl: RowLevelTtl) -> Self {
        Self::with_store(InMemoryStore::new(), ttl)
    }

    pub fn with_store(store: InMemoryStore, ttl: RowLevelTtl) -> Self {
        store
            .create_table(TableDescriptor {
                id: TABLE,
                database: "defaultdb".to_string(),
                schema: "public".to_string(),
                name: "events".to_string(),
                version: DescriptorVersion(1),
                modification_time: Utc::now() - ChronoDuration::hours(1),
                primary_index: IndexId(1),
                primary_key: vec![PrimaryKeyColumn::ascending("id", ColumnType::Int)],
                ttl: Some(ttl),
            })
            .unwrap();
        store.split_at_table_boundaries(TABLE).unwrap();
        Self {
            store,
            table: TABLE,
        }
    }

    pub fn expired_rows(self, ids: Range<i64>) -> Self {
        let expires_at = Utc::now() - ChronoDuration::days(1);
        for id in ids {
            self.store
                .insert_row(self.table, vec![Datum::Int(id)], expires_at)
                .unwrap();
        }
        self
    }

    pub fn live_rows(self, ids: Range<i64>) -> Self {
        let expires_at = Utc::now() + ChronoDuration::days(1);
        for id in ids {
            self.store
                .insert_row(self.table, vec![Datum::Int(id)], expires_at)
                .unwrap();
        }
        self
    }

    pub fn split_at(self, ids: &[i64]) -> Self {
        for id in ids {
            self.store
                .split_table_at(self.table, &[Datum::Int(*id)])
                .unwrap();
        }
        self
    }

    pub fn context(&self) -> JobExecContext {
        self.context_with(TtlConfig::default())
    }

    pub fn context_with(&self, config: TtlConfig) -> JobExecContext {
        JobExecContext::new(
            Arc::new(self.store.clone()),
            Arc::new(OrderedKeyCodec),
            config,
        )
    }

    pub fn details(&self) -> TtlJobDetails {
        TtlJobDetails {
            table_id: self.table,
            cutoff: Utc::now(),
        }
    }

    pub fn rows(&self) -> usize {
        self.store.row_count(self.table).unwrap()
    }
}

//! Transactional key-value store seam used by the TTL job.
//!
//! Every read and write of the job runs inside a [`Transaction`] obtained from
//! a [`TransactionalStore`]. A transaction that is dropped without
//! [`Transaction::commit`] is rolled back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::keys::KeyDecodeError;
use crate::types::{
    Datum, Datums, IndexId, PrimaryKeyColumn, RangeDescriptor, RawKey, TableDescriptor, TableId,
};

pub mod memory;
pub use memory::{FaultInjection, InMemoryStore, StoreStats};

/// Error types that can occur during store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("table {0} not found")]
    TableNotFound(TableId),

    #[error("range metadata scan failed: {0}")]
    RangeScan(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("key encoding error: {0}")]
    Key(#[from] KeyDecodeError),

    #[error("internal store error: {0}")]
    Internal(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Bounded historical read of expired primary keys in `[start_pk, end_pk)`.
#[derive(Debug, Clone)]
pub struct SelectRequest<'a> {
    pub table: TableId,
    pub index: IndexId,
    pub expiration_column: &'a str,
    pub pk_columns: &'a [PrimaryKeyColumn],
    /// Inclusive lower bound, empty for the start of the table.
    pub start_pk: &'a [Datum],
    /// Exclusive upper bound, empty for the end of the table.
    pub end_pk: &'a [Datum],
    /// Rows with an expiration strictly before this instant are expired.
    pub cutoff: DateTime<Utc>,
    /// Read timestamp of the historical select.
    pub as_of: DateTime<Utc>,
    pub limit: usize,
}

/// Deletion of the given primary keys, restricted to rows still expired.
#[derive(Debug, Clone)]
pub struct DeleteRequest<'a> {
    pub table: TableId,
    pub index: IndexId,
    pub expiration_column: &'a str,
    pub pk_columns: &'a [PrimaryKeyColumn],
    pub cutoff: DateTime<Utc>,
    pub rows: &'a [Datums],
}

/// Entry point to the store.
#[async_trait]
pub trait TransactionalStore: Send + Sync + 'static {
    /// Open a transaction. Operations on it fail with
    /// [`StoreError::Cancelled`] once `cancel` fires.
    async fn begin(&self, cancel: &CancellationToken) -> StoreResult<Box<dyn Transaction>>;
}

/// Operations available inside one transaction.
#[async_trait]
pub trait Transaction: Send {
    /// Current descriptor of a table.
    async fn table_descriptor(&mut self, table: TableId) -> StoreResult<TableDescriptor>;

    /// Range descriptors ordered by end key, whose end key lies in
    /// `(after, until]` (or `(after, ∞)` without `until`), at most `limit`.
    ///
    /// Ranges are addressed by their end key, so the range containing `after`
    /// is the first one returned.
    async fn scan_range_descriptors(
        &mut self,
        after: &RawKey,
        until: Option<&RawKey>,
        limit: usize,
    ) -> StoreResult<Vec<RangeDescriptor>>;

    /// Primary keys of expired rows in ascending key order.
    async fn select_expired(&mut self, request: &SelectRequest<'_>) -> StoreResult<Vec<Datums>>;

    /// Deletes the listed rows that are still expired, returns the number deleted.
    async fn delete_expired(&mut self, request: &DeleteRequest<'_>) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

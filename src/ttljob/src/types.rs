//! Table, key and range model shared by the TTL job components.

use chrono::{DateTime, Utc};
use std::fmt;

/// Identifier of a table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an index within a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(pub u32);

/// Monotonically increasing schema version of a table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorVersion(pub u64);

impl DescriptorVersion {
    pub fn next(self) -> Self {
        DescriptorVersion(self.0 + 1)
    }
}

impl fmt::Display for DescriptorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Datum {
    Null,
    Int(i64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::String(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Datum::Timestamp(v) => write!(f, "'{}'", v.to_rfc3339()),
        }
    }
}

/// An ordered primary-key tuple. Empty means an open bound.
pub type Datums = Vec<Datum>;

/// Renders a tuple as `(a, b, c)` for logs and query text.
pub fn display_datums(datums: &[Datum]) -> String {
    let values: Vec<String> = datums.iter().map(ToString::to_string).collect();
    format!("({})", values.join(", "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int,
    String,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// One column of the primary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub direction: Direction,
}

impl PrimaryKeyColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType, direction: Direction) -> Self {
        Self {
            name: name.into(),
            column_type,
            direction,
        }
    }

    pub fn ascending(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self::new(name, column_type, Direction::Ascending)
    }
}

/// A raw key in the underlying ordered key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RawKey(Vec<u8>);

impl RawKey {
    /// Lowest possible key.
    pub const MIN: RawKey = RawKey(Vec::new());

    /// Key sorting after every table key.
    pub fn max() -> RawKey {
        RawKey(vec![0xff, 0xff])
    }

    pub fn new(bytes: Vec<u8>) -> Self {
        RawKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Smallest key that does not have `self` as prefix.
    pub fn prefix_end(&self) -> RawKey {
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.pop() {
            if last < 0xff {
                bytes.push(last + 1);
                return RawKey(bytes);
            }
        }
        RawKey::max()
    }

    pub fn starts_with(&self, prefix: &RawKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/Min");
        }
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Half-open key interval `[key, end_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub key: RawKey,
    pub end_key: RawKey,
}

impl Span {
    pub fn new(key: RawKey, end_key: RawKey) -> Self {
        Self { key, end_key }
    }

    pub fn contains(&self, key: &RawKey) -> bool {
        &self.key <= key && key < &self.end_key
    }
}

/// Addressing record of one range of the keyspace, `[start_key, end_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDescriptor {
    pub range_id: u64,
    pub start_key: RawKey,
    pub end_key: RawKey,
}

/// Unit of work: the primary-key interval `[start_pk, end_pk)` of one range.
///
/// An empty tuple is an open bound (start or end of the table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeToProcess {
    pub range_id: u64,
    pub start_pk: Datums,
    pub end_pk: Datums,
}

impl fmt::Display for RangeToProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |datums: &[Datum], open: &str| {
            if datums.is_empty() {
                open.to_string()
            } else {
                display_datums(datums)
            }
        };
        write!(
            f,
            "r{} [{}, {})",
            self.range_id,
            bound(&self.start_pk, "/Min"),
            bound(&self.end_pk, "/Max")
        )
    }
}

/// Per-table TTL settings. Zero values fall back to the cluster defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLevelTtl {
    /// Column holding the expiration timestamp of each row.
    pub expiration_column: String,
    pub select_batch_size: u64,
    pub delete_batch_size: u64,
    pub range_concurrency: u64,
    /// Rows per second, 0 means "use the cluster default".
    pub delete_rate_limit: u64,
}

pub const DEFAULT_EXPIRATION_COLUMN: &str = "expires_at";

impl Default for RowLevelTtl {
    fn default() -> Self {
        Self {
            expiration_column: DEFAULT_EXPIRATION_COLUMN.to_string(),
            select_batch_size: 0,
            delete_batch_size: 0,
            range_concurrency: 0,
            delete_rate_limit: 0,
        }
    }
}

/// Snapshot of a table's schema as read inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub id: TableId,
    pub database: String,
    pub schema: String,
    pub name: String,
    pub version: DescriptorVersion,
    /// Commit time of the last schema change.
    pub modification_time: DateTime<Utc>,
    pub primary_index: IndexId,
    pub primary_key: Vec<PrimaryKeyColumn>,
    pub ttl: Option<RowLevelTtl>,
}

impl TableDescriptor {
    /// Fully-qualified `database.schema.table` name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.name)
    }
}

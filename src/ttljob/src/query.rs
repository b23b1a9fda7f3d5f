//! Select and delete statements of the range loop.
//!
//! The builders capture everything a statement needs up front, the store
//! executes them as opaque units. `sql()` renders the statement for logs.

use chrono::{DateTime, Utc};

use crate::error::TtlJobError;
use crate::job::TtlJobSpec;
use crate::store::{DeleteRequest, SelectRequest, Transaction};
use crate::types::{Datums, IndexId, PrimaryKeyColumn, RangeToProcess, TableId, display_datums};

/// Selects up to `limit` expired primary keys of one range as of the AOST.
#[derive(Debug, Clone)]
pub struct SelectQueryBuilder {
    table: TableId,
    index: IndexId,
    relation: String,
    pk_columns: Vec<PrimaryKeyColumn>,
    expiration_column: String,
    start_pk: Datums,
    end_pk: Datums,
    cutoff: DateTime<Utc>,
    aost: DateTime<Utc>,
    limit: usize,
}

impl SelectQueryBuilder {
    pub fn new(spec: &TtlJobSpec, range: &RangeToProcess) -> Self {
        Self {
            table: spec.table_id,
            index: spec.primary_index,
            relation: spec.relation.clone(),
            pk_columns: spec.primary_key.clone(),
            expiration_column: spec.expiration_column.clone(),
            start_pk: range.start_pk.clone(),
            end_pk: range.end_pk.clone(),
            cutoff: spec.cutoff,
            aost: spec.aost,
            limit: spec.settings.select_batch_size,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn run(&self, txn: &mut dyn Transaction) -> Result<Vec<Datums>, TtlJobError> {
        let request = SelectRequest {
            table: self.table,
            index: self.index,
            expiration_column: &self.expiration_column,
            pk_columns: &self.pk_columns,
            start_pk: &self.start_pk,
            end_pk: &self.end_pk,
            cutoff: self.cutoff,
            as_of: self.aost,
            limit: self.limit,
        };
        Ok(txn.select_expired(&request).await?)
    }

    fn key_prefix(&self, len: usize) -> &[PrimaryKeyColumn] {
        self.pk_columns.get(..len).unwrap_or(&self.pk_columns)
    }

    pub fn sql(&self) -> String {
        let pk = column_list(&self.pk_columns);
        let mut predicates = vec![format!(
            "{} < '{}'",
            self.expiration_column,
            self.cutoff.to_rfc3339()
        )];
        if !self.start_pk.is_empty() {
            predicates.push(format!(
                "({}) >= {}",
                column_list(self.key_prefix(self.start_pk.len())),
                display_datums(&self.start_pk)
            ));
        }
        if !self.end_pk.is_empty() {
            predicates.push(format!(
                "({}) < {}",
                column_list(self.key_prefix(self.end_pk.len())),
                display_datums(&self.end_pk)
            ));
        }

        format!(
            "SELECT {pk} FROM {} AS OF SYSTEM TIME '{}' WHERE {} ORDER BY {pk} LIMIT {}",
            self.relation,
            self.aost.to_rfc3339(),
            predicates.join(" AND "),
            self.limit
        )
    }
}

/// Deletes listed primary keys whose rows are still expired.
#[derive(Debug, Clone)]
pub struct DeleteQueryBuilder {
    table: TableId,
    index: IndexId,
    relation: String,
    pk_columns: Vec<PrimaryKeyColumn>,
    expiration_column: String,
    cutoff: DateTime<Utc>,
}

impl DeleteQueryBuilder {
    pub fn new(spec: &TtlJobSpec) -> Self {
        Self {
            table: spec.table_id,
            index: spec.primary_index,
            relation: spec.relation.clone(),
            pk_columns: spec.primary_key.clone(),
            expiration_column: spec.expiration_column.clone(),
            cutoff: spec.cutoff,
        }
    }

    /// Returns the number of rows deleted.
    pub async fn run(
        &self,
        txn: &mut dyn Transaction,
        rows: &[Datums],
    ) -> Result<u64, TtlJobError> {
        let request = DeleteRequest {
            table: self.table,
            index: self.index,
            expiration_column: &self.expiration_column,
            pk_columns: &self.pk_columns,
            cutoff: self.cutoff,
            rows,
        };
        Ok(txn.delete_expired(&request).await?)
    }

    pub fn sql(&self, rows: usize) -> String {
        let placeholders: Vec<String> = (0..rows).map(|i| format!("${}", i + 1)).collect();
        format!(
            "DELETE FROM {} WHERE {} < '{}' AND ({}) IN ({})",
            self.relation,
            self.expiration_column,
            self.cutoff.to_rfc3339(),
            column_list(&self.pk_columns),
            placeholders.join(", ")
        )
    }
}

fn column_list(columns: &[PrimaryKeyColumn]) -> String {
    columns
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

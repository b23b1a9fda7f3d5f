use crate::error::TtlJobError;
use crate::store::Transaction;
use crate::types::{DescriptorVersion, TableDescriptor, TableId};

/// Point in the range loop at which the schema is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPhase {
    Select,
    Delete,
}

/// Schema version captured at job start, compared against the live
/// descriptor before the select phase and before every delete sub-batch.
#[derive(Debug, Clone)]
pub struct SchemaGuard {
    table: TableId,
    relation: String,
    version: DescriptorVersion,
    mock_version_during_delete: Option<DescriptorVersion>,
}

impl SchemaGuard {
    pub fn new(table: TableId, relation: impl Into<String>, version: DescriptorVersion) -> Self {
        Self {
            table,
            relation: relation.into(),
            version,
            mock_version_during_delete: None,
        }
    }

    /// Testing hook: pretend the live version is `version` during deletes.
    pub fn with_mock_version_during_delete(mut self, version: Option<DescriptorVersion>) -> Self {
        self.mock_version_during_delete = version;
        self
    }

    pub fn check(&self, live: &TableDescriptor, phase: GuardPhase) -> Result<(), TtlJobError> {
        let live_version = match (phase, self.mock_version_during_delete) {
            (GuardPhase::Delete, Some(mock)) => mock,
            _ => live.version,
        };
        if live_version != self.version {
            return Err(TtlJobError::SchemaChanged {
                table: self.relation.clone(),
                changed_at: live.modification_time.to_rfc3339(),
            });
        }
        Ok(())
    }

    /// Reads the live descriptor inside `txn` and checks it.
    pub async fn check_in_txn(
        &self,
        txn: &mut dyn Transaction,
        phase: GuardPhase,
    ) -> Result<(), TtlJobError> {
        let live = txn.table_descriptor(self.table).await?;
        self.check(&live, phase)
    }
}

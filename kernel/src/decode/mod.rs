// Notification Payload Decoding
//
// Typed views of metastore notification messages and the decoder
// contract that produces them from raw payloads.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::event::{MetastoreEventType, PartitionMetadata, TableName, TableSchema};

mod json;

pub use json::JsonPayloadDecoder;

/// Errors produced while turning a payload into cache keys.
///
/// All of these are permanent for the notification that caused them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("no decoder registered for type tag `{0}`")]
    UnknownTag(String),

    #[error("expected {expected} message, decoder produced {actual}")]
    UnexpectedMessage {
        expected: MetastoreEventType,
        actual: MetastoreEventType,
    },

    #[error("table schema snapshot is missing")]
    MissingSchema,

    #[error("table has no partition columns")]
    NotPartitioned,

    #[error("table is partitioned by {columns:?} but no partition was named")]
    MissingPartition { columns: Vec<String> },

    #[error("partition values {values:?} do not match partition columns {columns:?}")]
    ArityMismatch {
        columns: Vec<String>,
        values: Vec<String>,
    },

    #[error("partition spec {spec:?} does not match partition columns {columns:?}")]
    ColumnMismatch {
        columns: Vec<String>,
        spec: BTreeMap<String, String>,
    },
}

/// Decodes raw notification payloads into typed messages.
///
/// Must be called with the exact type tag carried by the notification.
pub trait PayloadDecoder: Send + Sync {
    fn decode(
        &self,
        type_tag: &str,
        payload: &serde_json::Value,
    ) -> Result<MetastoreMessage, DecodeError>;
}

/// A decoded notification message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetastoreMessage {
    CreateTable(CreateTableMessage),
    AlterTable(AlterTableMessage),
    DropTable(DropTableMessage),
    AddPartition(AddPartitionMessage),
    AlterPartition(AlterPartitionMessage),
    DropPartition(DropPartitionMessage),
    Insert(InsertMessage),
}

impl MetastoreMessage {
    pub fn event_type(&self) -> MetastoreEventType {
        match self {
            MetastoreMessage::CreateTable(_) => MetastoreEventType::CreateTable,
            MetastoreMessage::AlterTable(_) => MetastoreEventType::AlterTable,
            MetastoreMessage::DropTable(_) => MetastoreEventType::DropTable,
            MetastoreMessage::AddPartition(_) => MetastoreEventType::AddPartition,
            MetastoreMessage::AlterPartition(_) => MetastoreEventType::AlterPartition,
            MetastoreMessage::DropPartition(_) => MetastoreEventType::DropPartition,
            MetastoreMessage::Insert(_) => MetastoreEventType::Insert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub name: String,
}

/// Table object embedded in a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableObject {
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    /// Absent means the message carried no schema snapshot.
    #[serde(default)]
    pub partition_keys: Option<Vec<FieldSchema>>,
    #[serde(default)]
    pub location: Option<String>,
}

impl TableObject {
    /// Partition-column snapshot of this table.
    pub fn schema(&self) -> Result<TableSchema, DecodeError> {
        let keys = self
            .partition_keys
            .as_ref()
            .ok_or(DecodeError::MissingSchema)?;

        Ok(TableSchema {
            partition_columns: keys.iter().map(|k| k.name.clone()).collect(),
            location: self.location.clone(),
        })
    }

    pub fn qualified_name(&self) -> Option<TableName> {
        match (&self.db_name, &self.table_name) {
            (Some(db), Some(table)) => Some(TableName::new(db, table)),
            _ => None,
        }
    }
}

/// Partition object embedded in a notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionObject {
    pub values: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl PartitionObject {
    pub fn metadata(&self) -> PartitionMetadata {
        PartitionMetadata {
            location: self.location.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTableMessage {
    #[serde(default)]
    pub table_obj: Option<TableObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterTableMessage {
    #[serde(default)]
    pub table_obj_before: Option<TableObject>,
    #[serde(default)]
    pub table_obj_after: Option<TableObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropTableMessage {
    #[serde(default)]
    pub table_obj: Option<TableObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPartitionMessage {
    #[serde(default)]
    pub table_obj: Option<TableObject>,
    pub partitions: Vec<PartitionObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterPartitionMessage {
    #[serde(default)]
    pub table_obj: Option<TableObject>,
    pub partition_obj_before: PartitionObject,
    pub partition_obj_after: PartitionObject,
}

/// Dropped partitions are listed as `column -> value` maps.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropPartitionMessage {
    #[serde(default)]
    pub table_obj: Option<TableObject>,
    pub partitions: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertMessage {
    #[serde(default)]
    pub table_obj: Option<TableObject>,
    /// Set when the insert targeted a single partition.
    #[serde(default)]
    pub ptn_obj: Option<PartitionObject>,
}

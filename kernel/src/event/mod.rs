// Metastore Events & Cache Keys
//
// Raw notification records as delivered by the metastore, and the
// fully-resolved keys that identify cache entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::decode::DecodeError;

mod cache_event;

pub use cache_event::CacheEvent;

/// Position of a notification in the metastore change log.
pub type EventId = u64;

/// Value Hive writes for a null or empty partition value.
pub const DEFAULT_PARTITION_NAME: &str = "__HIVE_DEFAULT_PARTITION__";

/// One entry of the metastore change log, as fetched by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: EventId,
    pub type_tag: String,
    pub db_name: String,
    pub tbl_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawEvent {
    /// Table this notification is scoped to.
    pub fn table_name(&self) -> TableName {
        TableName::new(&self.db_name, &self.tbl_name)
    }
}

/// Closed set of notification type tags understood by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetastoreEventType {
    CreateTable,
    AlterTable,
    DropTable,
    AddPartition,
    AlterPartition,
    DropPartition,
    Insert,

    // Known tags with no effect on table metadata.
    CreateDatabase,
    AlterDatabase,
    DropDatabase,
    CreateFunction,
    DropFunction,
    OpenTxn,
    CommitTxn,
    AbortTxn,
    AllocWriteId,
    AcidWrite,
}

impl MetastoreEventType {
    /// Resolve a raw type tag. Unknown tags return `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        use MetastoreEventType::*;

        let event_type = match tag {
            "CREATE_TABLE" => CreateTable,
            "ALTER_TABLE" => AlterTable,
            "DROP_TABLE" => DropTable,
            "ADD_PARTITION" => AddPartition,
            "ALTER_PARTITION" => AlterPartition,
            "DROP_PARTITION" => DropPartition,
            "INSERT" => Insert,
            "CREATE_DATABASE" => CreateDatabase,
            "ALTER_DATABASE" => AlterDatabase,
            "DROP_DATABASE" => DropDatabase,
            "CREATE_FUNCTION" => CreateFunction,
            "DROP_FUNCTION" => DropFunction,
            "OPEN_TXN" => OpenTxn,
            "COMMIT_TXN" => CommitTxn,
            "ABORT_TXN" => AbortTxn,
            "ALLOC_WRITE_ID" => AllocWriteId,
            "ACID_WRITE" => AcidWrite,
            _ => return None,
        };
        Some(event_type)
    }

    pub fn as_tag(&self) -> &'static str {
        use MetastoreEventType::*;

        match self {
            CreateTable => "CREATE_TABLE",
            AlterTable => "ALTER_TABLE",
            DropTable => "DROP_TABLE",
            AddPartition => "ADD_PARTITION",
            AlterPartition => "ALTER_PARTITION",
            DropPartition => "DROP_PARTITION",
            Insert => "INSERT",
            CreateDatabase => "CREATE_DATABASE",
            AlterDatabase => "ALTER_DATABASE",
            DropDatabase => "DROP_DATABASE",
            CreateFunction => "CREATE_FUNCTION",
            DropFunction => "DROP_FUNCTION",
            OpenTxn => "OPEN_TXN",
            CommitTxn => "COMMIT_TXN",
            AbortTxn => "ABORT_TXN",
            AllocWriteId => "ALLOC_WRITE_ID",
            AcidWrite => "ACID_WRITE",
        }
    }

    /// Whether events of this type never touch cached table metadata.
    pub fn is_ignored(&self) -> bool {
        use MetastoreEventType::*;

        !matches!(
            self,
            CreateTable
                | AlterTable
                | DropTable
                | AddPartition
                | AlterPartition
                | DropPartition
                | Insert
        )
    }
}

impl fmt::Display for MetastoreEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Fully qualified table identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub db_name: String,
    pub tbl_name: String,
}

impl TableName {
    pub fn new(db_name: impl Into<String>, tbl_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            tbl_name: tbl_name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db_name, self.tbl_name)
    }
}

/// Ordered `(column, value)` pairs identifying one partition.
///
/// Column order is the table's declared partition-column order at the time
/// the notification was emitted. Equality is order-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionSpec(Vec<(String, String)>);

impl PartitionSpec {
    /// Bind a positional value tuple to the declared partition columns.
    ///
    /// Value `i` binds to column `i`. The tuple must have exactly one value
    /// per column.
    pub fn bind(columns: &[String], values: &[String]) -> Result<Self, DecodeError> {
        if columns.is_empty() {
            return Err(DecodeError::NotPartitioned);
        }
        if columns.len() != values.len() {
            return Err(DecodeError::ArityMismatch {
                columns: columns.to_vec(),
                values: values.to_vec(),
            });
        }

        Ok(Self(
            columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect(),
        ))
    }

    /// Bind a `column -> value` map to the declared partition columns.
    ///
    /// The map must name every declared column and nothing else.
    pub fn bind_map(
        columns: &[String],
        values: &BTreeMap<String, String>,
    ) -> Result<Self, DecodeError> {
        if columns.is_empty() {
            return Err(DecodeError::NotPartitioned);
        }

        let mismatch = || DecodeError::ColumnMismatch {
            columns: columns.to_vec(),
            spec: values.clone(),
        };
        if values.len() != columns.len() {
            return Err(mismatch());
        }

        let mut pairs = Vec::with_capacity(columns.len());
        for column in columns {
            let value = values.get(column).ok_or_else(mismatch)?;
            pairs.push((column.clone(), value.clone()));
        }
        Ok(Self(pairs))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v.as_str()))
    }

    pub fn values(&self) -> Vec<&str> {
        self.0.iter().map(|(_, v)| v.as_str()).collect()
    }

    /// Hive partition name, e.g. `year=2023/month=01`.
    ///
    /// Path-unsafe characters are escaped as `%XX`, and empty values map to
    /// the Hive default partition name.
    pub fn partition_name(&self) -> String {
        self.0
            .iter()
            .map(|(column, value)| {
                let value = if value.is_empty() {
                    DEFAULT_PARTITION_NAME.to_string()
                } else {
                    escape_path_name(value)
                };
                format!("{}={}", escape_path_name(column), value)
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.partition_name())
    }
}

fn needs_escape(c: char) -> bool {
    matches!(
        c,
        '\u{01}'..='\u{1F}'
            | '"'
            | '#'
            | '%'
            | '\''
            | '*'
            | '/'
            | ':'
            | '='
            | '?'
            | '\\'
            | '\u{7F}'
            | '{'
            | '['
            | ']'
            | '^'
    )
}

fn escape_path_name(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if needs_escape(c) {
            escaped.push_str(&format!("%{:02X}", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Identity of a single cached partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub table: TableName,
    pub spec: PartitionSpec,
}

impl PartitionKey {
    pub fn new(table: TableName, spec: PartitionSpec) -> Self {
        Self { table, spec }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.spec)
    }
}

/// Address of a cache entry: a table, or one partition of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub table: TableName,
    pub partition: Option<PartitionSpec>,
}

impl CacheKey {
    pub fn table(table: TableName) -> Self {
        Self {
            table,
            partition: None,
        }
    }

    pub fn is_table_key(&self) -> bool {
        self.partition.is_none()
    }
}

impl From<PartitionKey> for CacheKey {
    fn from(key: PartitionKey) -> Self {
        Self {
            table: key.table,
            partition: Some(key.spec),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition {
            Some(spec) => write!(f, "{}/{}", self.table, spec),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Partition-column layout of a table at notification time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub partition_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl TableSchema {
    pub fn is_partitioned(&self) -> bool {
        !self.partition_columns.is_empty()
    }
}

/// Partition metadata carried by an alter notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn positional_binding_follows_column_order() {
        let spec = PartitionSpec::bind(&cols(&["year", "month"]), &cols(&["2023", "01"])).unwrap();

        assert_eq!(
            spec.iter().collect::<Vec<_>>(),
            vec![("year", "2023"), ("month", "01")]
        );
        assert_eq!(spec.partition_name(), "year=2023/month=01");
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let err = PartitionSpec::bind(&cols(&["year", "month"]), &cols(&["2023"])).unwrap_err();
        assert!(matches!(err, DecodeError::ArityMismatch { .. }));

        let err = PartitionSpec::bind(&cols(&["year"]), &cols(&["2023", "01"])).unwrap_err();
        assert!(matches!(err, DecodeError::ArityMismatch { .. }));
    }

    #[test]
    fn unpartitioned_columns_cannot_bind() {
        let err = PartitionSpec::bind(&[], &[]).unwrap_err();
        assert_eq!(err, DecodeError::NotPartitioned);
    }

    #[test]
    fn map_binding_requires_exact_columns() {
        let columns = cols(&["year", "month"]);

        let mut values = BTreeMap::new();
        values.insert("month".to_string(), "02".to_string());
        values.insert("year".to_string(), "2023".to_string());
        let spec = PartitionSpec::bind_map(&columns, &values).unwrap();
        assert_eq!(spec.values(), vec!["2023", "02"]);

        values.insert("day".to_string(), "07".to_string());
        assert!(PartitionSpec::bind_map(&columns, &values).is_err());

        values.remove("day");
        values.remove("month");
        assert!(PartitionSpec::bind_map(&columns, &values).is_err());
    }

    #[test]
    fn partition_name_escapes_path_characters() {
        let spec = PartitionSpec::bind(&cols(&["path", "dt"]), &cols(&["a/b=c", ""])).unwrap();
        assert_eq!(
            spec.partition_name(),
            "path=a%2Fb%3Dc/dt=__HIVE_DEFAULT_PARTITION__"
        );
    }

    #[test]
    fn partition_order_is_significant() {
        let a = PartitionSpec::bind(&cols(&["a", "b"]), &cols(&["1", "2"])).unwrap();
        let b = PartitionSpec::bind(&cols(&["b", "a"]), &cols(&["2", "1"])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn type_tags_round_trip() {
        for tag in ["CREATE_TABLE", "ADD_PARTITION", "INSERT", "OPEN_TXN"] {
            let event_type = MetastoreEventType::from_tag(tag).unwrap();
            assert_eq!(event_type.as_tag(), tag);
        }
        assert!(MetastoreEventType::from_tag("CREATE_CATALOG").is_none());
        assert!(MetastoreEventType::CreateDatabase.is_ignored());
        assert!(!MetastoreEventType::DropPartition.is_ignored());
    }

    #[test]
    fn cache_key_display() {
        let table = TableName::new("d", "t");
        let spec = PartitionSpec::bind(&cols(&["dt"]), &cols(&["2024-01-01"])).unwrap();

        assert_eq!(CacheKey::table(table.clone()).to_string(), "d.t");
        assert_eq!(
            CacheKey::from(PartitionKey::new(table, spec)).to_string(),
            "d.t/dt=2024-01-01"
        );
    }
}

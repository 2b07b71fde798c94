// Cache Event Factory
//
// Maps one raw metastore notification to the ordered list of cache
// events it implies. Pure: never looks at the cache.

use crate::decode::{
    AddPartitionMessage, AlterPartitionMessage, AlterTableMessage, CreateTableMessage,
    DecodeError, DropPartitionMessage, DropTableMessage, InsertMessage, JsonPayloadDecoder,
    MetastoreMessage, PayloadDecoder, TableObject,
};
use crate::event::{
    CacheEvent, CacheKey, EventId, MetastoreEventType, PartitionKey, PartitionSpec, RawEvent,
    TableName, TableSchema,
};

/// Why a notification produced no cache events.
///
/// Both variants are permanent: retrying the same notification yields the
/// same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("cannot decode event {event_id} ({event_type}) on {table}: {source}")]
    Decode {
        event_id: EventId,
        event_type: String,
        table: TableName,
        #[source]
        source: DecodeError,
    },

    #[error("unsupported event type `{event_type}` (event {event_id})")]
    UnsupportedEventType { event_id: EventId, event_type: String },
}

/// Coarse error class, for recovery decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorKind {
    Decode,
    UnsupportedEventType,
}

impl BuildError {
    pub fn kind(&self) -> BuildErrorKind {
        match self {
            BuildError::Decode { .. } => BuildErrorKind::Decode,
            BuildError::UnsupportedEventType { .. } => BuildErrorKind::UnsupportedEventType,
        }
    }

    pub fn is_permanent(&self) -> bool {
        true
    }
}

/// Builds cache events from raw notifications.
#[derive(Debug, Clone, Default)]
pub struct EventFactory<D = JsonPayloadDecoder> {
    decoder: D,
}

impl EventFactory<JsonPayloadDecoder> {
    /// Factory decoding metastore JSON messages.
    pub fn json() -> Self {
        Self::new(JsonPayloadDecoder)
    }
}

impl<D: PayloadDecoder> EventFactory<D> {
    pub fn new(decoder: D) -> Self {
        Self { decoder }
    }

    /// Derive the cache events for one notification, in payload order.
    ///
    /// Known tags with no cache effect yield an empty list without being
    /// decoded. Unknown tags are never decoded.
    pub fn build(&self, raw: &RawEvent) -> Result<Vec<CacheEvent>, BuildError> {
        let Some(event_type) = MetastoreEventType::from_tag(&raw.type_tag) else {
            return Err(BuildError::UnsupportedEventType {
                event_id: raw.id,
                event_type: raw.type_tag.clone(),
            });
        };

        if event_type.is_ignored() {
            return Ok(Vec::new());
        }

        self.decode_and_expand(event_type, raw)
            .map_err(|source| BuildError::Decode {
                event_id: raw.id,
                event_type: raw.type_tag.clone(),
                table: raw.table_name(),
                source,
            })
    }

    fn decode_and_expand(
        &self,
        event_type: MetastoreEventType,
        raw: &RawEvent,
    ) -> Result<Vec<CacheEvent>, DecodeError> {
        let message = self.decoder.decode(&raw.type_tag, &raw.payload)?;
        if message.event_type() != event_type {
            return Err(DecodeError::UnexpectedMessage {
                expected: event_type,
                actual: message.event_type(),
            });
        }

        let table = raw.table_name();
        match message {
            MetastoreMessage::CreateTable(m) => create_table(table, m),
            MetastoreMessage::AlterTable(m) => alter_table(table, m),
            MetastoreMessage::DropTable(m) => drop_table(table, m),
            MetastoreMessage::AddPartition(m) => add_partitions(table, m),
            MetastoreMessage::AlterPartition(m) => alter_partition(table, m),
            MetastoreMessage::DropPartition(m) => drop_partitions(table, m),
            MetastoreMessage::Insert(m) => insert(table, m),
        }
    }
}

fn require_schema(table_obj: Option<&TableObject>) -> Result<TableSchema, DecodeError> {
    table_obj.ok_or(DecodeError::MissingSchema)?.schema()
}

fn partition_key(
    table: &TableName,
    schema: &TableSchema,
    values: &[String],
) -> Result<PartitionKey, DecodeError> {
    let spec = PartitionSpec::bind(&schema.partition_columns, values)?;
    Ok(PartitionKey::new(table.clone(), spec))
}

fn create_table(
    table: TableName,
    message: CreateTableMessage,
) -> Result<Vec<CacheEvent>, DecodeError> {
    let schema = require_schema(message.table_obj.as_ref())?;
    Ok(vec![CacheEvent::TableCreated { table, schema }])
}

fn alter_table(
    table: TableName,
    message: AlterTableMessage,
) -> Result<Vec<CacheEvent>, DecodeError> {
    let after = message
        .table_obj_after
        .as_ref()
        .ok_or(DecodeError::MissingSchema)?;
    let schema = after.schema()?;

    let before_name = message
        .table_obj_before
        .as_ref()
        .and_then(TableObject::qualified_name);

    // A rename moves the entry: the old name is gone, the new one is fresh.
    match (before_name, after.qualified_name()) {
        (Some(before), Some(renamed)) if before != renamed => Ok(vec![
            CacheEvent::TableDropped { table: before },
            CacheEvent::TableCreated {
                table: renamed,
                schema,
            },
        ]),
        _ => Ok(vec![CacheEvent::TableAltered { table, schema }]),
    }
}

fn drop_table(
    table: TableName,
    _message: DropTableMessage,
) -> Result<Vec<CacheEvent>, DecodeError> {
    Ok(vec![CacheEvent::TableDropped { table }])
}

fn add_partitions(
    table: TableName,
    message: AddPartitionMessage,
) -> Result<Vec<CacheEvent>, DecodeError> {
    let schema = require_schema(message.table_obj.as_ref())?;

    message
        .partitions
        .iter()
        .map(|partition| {
            let key = partition_key(&table, &schema, &partition.values)?;
            Ok(CacheEvent::PartitionsAdded { key })
        })
        .collect()
}

fn alter_partition(
    table: TableName,
    message: AlterPartitionMessage,
) -> Result<Vec<CacheEvent>, DecodeError> {
    let schema = require_schema(message.table_obj.as_ref())?;
    let before = partition_key(&table, &schema, &message.partition_obj_before.values)?;
    let after = partition_key(&table, &schema, &message.partition_obj_after.values)?;

    if before != after {
        return Ok(vec![
            CacheEvent::PartitionDropped { key: before },
            CacheEvent::PartitionsAdded { key: after },
        ]);
    }

    Ok(vec![CacheEvent::PartitionAltered {
        key: after,
        metadata: message.partition_obj_after.metadata(),
    }])
}

fn drop_partitions(
    table: TableName,
    message: DropPartitionMessage,
) -> Result<Vec<CacheEvent>, DecodeError> {
    let schema = require_schema(message.table_obj.as_ref())?;

    message
        .partitions
        .iter()
        .map(|values| {
            let spec = PartitionSpec::bind_map(&schema.partition_columns, values)?;
            Ok(CacheEvent::PartitionDropped {
                key: PartitionKey::new(table.clone(), spec),
            })
        })
        .collect()
}

fn insert(table: TableName, message: InsertMessage) -> Result<Vec<CacheEvent>, DecodeError> {
    let schema = require_schema(message.table_obj.as_ref())?;
    let key = match &message.ptn_obj {
        Some(partition) => CacheKey::from(partition_key(&table, &schema, &partition.values)?),
        None if schema.is_partitioned() => {
            return Err(DecodeError::MissingPartition {
                columns: schema.partition_columns,
            })
        }
        None => CacheKey::table(table),
    };
    Ok(vec![CacheEvent::PartitionFileInsert { key }])
}

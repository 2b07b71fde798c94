// JSON Payload Decoder
//
// Decodes metastore JSON notification messages. Payloads may arrive
// either as JSON objects or as JSON text embedded in a string.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{DecodeError, MetastoreMessage, PayloadDecoder};
use crate::event::MetastoreEventType;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPayloadDecoder;

impl PayloadDecoder for JsonPayloadDecoder {
    fn decode(&self, type_tag: &str, payload: &Value) -> Result<MetastoreMessage, DecodeError> {
        use MetastoreEventType::*;

        let event_type = MetastoreEventType::from_tag(type_tag)
            .ok_or_else(|| DecodeError::UnknownTag(type_tag.to_string()))?;

        let parsed;
        let payload = match payload {
            Value::Null => return Err(DecodeError::Malformed("payload is empty".into())),
            Value::String(text) => {
                parsed = serde_json::from_str::<Value>(text)
                    .map_err(|e| DecodeError::Malformed(e.to_string()))?;
                &parsed
            }
            other => other,
        };

        match event_type {
            CreateTable => parse(payload).map(MetastoreMessage::CreateTable),
            AlterTable => parse(payload).map(MetastoreMessage::AlterTable),
            DropTable => parse(payload).map(MetastoreMessage::DropTable),
            AddPartition => parse(payload).map(MetastoreMessage::AddPartition),
            AlterPartition => parse(payload).map(MetastoreMessage::AlterPartition),
            DropPartition => parse(payload).map(MetastoreMessage::DropPartition),
            Insert => parse(payload).map(MetastoreMessage::Insert),
            ignored => Err(DecodeError::UnknownTag(ignored.as_tag().to_string())),
        }
    }
}

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, DecodeError> {
    T::deserialize(payload).map_err(|e| DecodeError::Malformed(e.to_string()))
}

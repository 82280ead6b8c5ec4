//! Unwrapping of protobuf `Struct`-style JSON envelopes.
//!
//! Chatbot payloads arrive either as plain JSON or with every value wrapped in
//! `{ "stringValue": .. }`, `{ "listValue": { "values": [..] } }`,
//! `{ "structValue": { "fields": {..} } }` and friends. [`unwrap_proto_value`]
//! flattens both encodings into plain JSON.

use serde_json::{Map, Value};

/// Borrowed view of a JSON node, classified by envelope shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProtoValue<'a> {
    /// `null`, a boolean, a number or a string.
    Scalar(&'a Value),
    StringValue(&'a Value),
    NumberValue(&'a Value),
    BoolValue(&'a Value),
    ListValue(&'a [Value]),
    StructValue(&'a Map<String, Value>),
    /// An object that matches no envelope.
    Object(&'a Map<String, Value>),
    Array(&'a [Value]),
}

/// One envelope rule: the key it is named after and the shape check.
pub struct Envelope {
    pub key: &'static str,
    pub classify: for<'a> fn(&'a Map<String, Value>) -> Option<ProtoValue<'a>>,
}

/// Envelope rules in priority order. The first rule whose classifier matches wins.
pub const ENVELOPES: &[Envelope] = &[
    Envelope {
        key: "stringValue",
        classify: string_value,
    },
    Envelope {
        key: "numberValue",
        classify: number_value,
    },
    Envelope {
        key: "boolValue",
        classify: bool_value,
    },
    Envelope {
        key: "listValue",
        classify: list_value,
    },
    Envelope {
        key: "structValue",
        classify: struct_value,
    },
];

fn string_value(map: &Map<String, Value>) -> Option<ProtoValue<'_>> {
    map.get("stringValue").map(ProtoValue::StringValue)
}

fn number_value(map: &Map<String, Value>) -> Option<ProtoValue<'_>> {
    map.get("numberValue").map(ProtoValue::NumberValue)
}

fn bool_value(map: &Map<String, Value>) -> Option<ProtoValue<'_>> {
    map.get("boolValue").map(ProtoValue::BoolValue)
}

fn list_value(map: &Map<String, Value>) -> Option<ProtoValue<'_>> {
    map.get("listValue")
        .and_then(|list| list.get("values"))
        .and_then(Value::as_array)
        .map(|values| ProtoValue::ListValue(values.as_slice()))
}

fn struct_value(map: &Map<String, Value>) -> Option<ProtoValue<'_>> {
    map.get("structValue")
        .and_then(|inner| inner.get("fields"))
        .and_then(Value::as_object)
        .map(ProtoValue::StructValue)
}

impl<'a> ProtoValue<'a> {
    pub fn classify(value: &'a Value) -> Self {
        match value {
            Value::Array(items) => ProtoValue::Array(items.as_slice()),
            Value::Object(map) => ENVELOPES
                .iter()
                .find_map(|envelope| (envelope.classify)(map))
                .unwrap_or(ProtoValue::Object(map)),
            scalar => ProtoValue::Scalar(scalar),
        }
    }

    /// Converts the node into plain JSON, recursing through nested envelopes.
    ///
    /// Scalar envelopes return their payload as-is, even when the payload is
    /// itself an object.
    pub fn unwrap(self) -> Value {
        match self {
            ProtoValue::Scalar(value)
            | ProtoValue::StringValue(value)
            | ProtoValue::NumberValue(value)
            | ProtoValue::BoolValue(value) => value.clone(),
            ProtoValue::ListValue(values) | ProtoValue::Array(values) => {
                Value::Array(values.iter().map(unwrap_proto_value).collect())
            }
            ProtoValue::StructValue(fields) | ProtoValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), unwrap_proto_value(value)))
                    .collect(),
            ),
        }
    }
}

pub fn unwrap_proto_value(value: &Value) -> Value {
    ProtoValue::classify(value).unwrap()
}

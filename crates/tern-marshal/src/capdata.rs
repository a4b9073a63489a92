use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue, json};

use crate::value::Value;
use crate::vref::Vref;
use crate::{MarshalError, MarshalResult};

/// Serialized form of a [`Value`]: a deterministic JSON body plus the
/// capability slots extracted from it.
///
/// Each `Ref` in the value tree is replaced by a `{"@ref": n}` placeholder
/// indexing into `slots`; a reference appearing more than once is recorded
/// once, at its first-encounter position. Record keys starting with `@`
/// are reserved for placeholders and rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<Vref>,
}

impl CapData {
    /// Serialized `Value::Null`, the vacuous payload.
    pub fn null() -> Self {
        CapData { body: "null".to_string(), slots: Vec::new() }
    }
}

/// Serialize a value into its `{body, slots}` wire form.
pub fn serialize(value: &Value) -> MarshalResult<CapData> {
    let mut slots = Vec::new();
    let mut seen: HashMap<Vref, usize> = HashMap::new();
    let body = encode(value, &mut slots, &mut seen)?;
    Ok(CapData { body: serde_json::to_string(&body)?, slots })
}

/// Reconstruct the value tree from its wire form. Exact inverse of
/// [`serialize`] for every representable value.
pub fn unserialize(data: &CapData) -> MarshalResult<Value> {
    let body: JsonValue = serde_json::from_str(&data.body)?;
    decode(&body, &data.slots)
}

fn encode(
    value: &Value,
    slots: &mut Vec<Vref>,
    seen: &mut HashMap<Vref, usize>,
) -> MarshalResult<JsonValue> {
    match value {
        Value::Null => Ok(JsonValue::Null),
        Value::Bool(b) => Ok(JsonValue::Bool(*b)),
        Value::Int(n) => Ok(json!(*n)),
        Value::Text(s) => Ok(JsonValue::String(s.clone())),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode(item, slots, seen)?);
            }
            Ok(JsonValue::Array(out))
        }
        Value::Record(fields) => {
            let mut out = JsonMap::with_capacity(fields.len());
            for (key, field) in fields {
                if key.starts_with('@') {
                    return Err(MarshalError::ReservedKey(key.clone()));
                }
                out.insert(key.clone(), encode(field, slots, seen)?);
            }
            Ok(JsonValue::Object(out))
        }
        Value::Ref(vref) => {
            let index = match seen.get(vref) {
                Some(index) => *index,
                None => {
                    slots.push(vref.clone());
                    seen.insert(vref.clone(), slots.len() - 1);
                    slots.len() - 1
                }
            };
            Ok(json!({ "@ref": index }))
        }
    }
}

fn decode(node: &JsonValue, slots: &[Vref]) -> MarshalResult<Value> {
    match node {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| MarshalError::NonIntegerNumber(n.to_string())),
        JsonValue::String(s) => Ok(Value::Text(s.clone())),
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode(item, slots)?);
            }
            Ok(Value::List(out))
        }
        JsonValue::Object(map) => {
            if let Some(index_node) = map.get("@ref") {
                if map.len() != 1 {
                    return Err(MarshalError::BadBody(
                        "'@ref' placeholder with extra keys".to_string(),
                    ));
                }
                let index = index_node
                    .as_u64()
                    .ok_or_else(|| MarshalError::BadBody("non-integer '@ref' index".to_string()))?
                    as usize;
                let vref = slots
                    .get(index)
                    .cloned()
                    .ok_or(MarshalError::SlotOutOfRange { index, len: slots.len() })?;
                return Ok(Value::Ref(vref));
            }
            let mut out = std::collections::BTreeMap::new();
            for (key, field) in map {
                if key.starts_with('@') {
                    return Err(MarshalError::BadBody(format!("reserved key '{key}' in body")));
                }
                out.insert(key.clone(), decode(field, slots)?);
            }
            Ok(Value::Record(out))
        }
    }
}

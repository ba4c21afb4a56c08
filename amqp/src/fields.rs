//! Conversion between JSON header values and AMQP field tables.
//!
//! Envelope headers are JSON values; the wire carries them as an AMQP field table.
//! Integers travel as signed 64-bit, other numbers as doubles, strings as long strings.
//! Values with no JSON counterpart (decimals, byte arrays) come back as their debug text.

use lapin::types::{AMQPValue, FieldTable};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Encode JSON headers as a field table.
#[must_use]
pub fn to_field_table(headers: &HashMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), to_amqp(value));
    }
    table
}

/// Decode a field table into JSON headers.
#[must_use]
pub fn from_field_table(table: &FieldTable) -> HashMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), to_json(value)))
        .collect()
}

fn to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => number.as_i64().map_or_else(
            || AMQPValue::Double(number.as_f64().unwrap_or_default()),
            AMQPValue::LongLongInt,
        ),
        Value::String(text) => AMQPValue::LongString(text.as_str().into()),
        Value::Array(items) => {
            AMQPValue::FieldArray(items.iter().map(to_amqp).collect::<Vec<_>>().into())
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(key.as_str().into(), to_amqp(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Void => Value::Null,
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::Float(n) => Value::from(*n),
        AMQPValue::Double(n) => Value::from(*n),
        AMQPValue::ShortString(text) => Value::String(text.as_str().to_string()),
        AMQPValue::LongString(text) => {
            Value::String(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(items) => Value::Array(items.as_slice().iter().map(to_json).collect()),
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), to_json(value)))
                .collect::<Map<String, Value>>(),
        ),
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{DecimalValue, ShortString};
    use serde_json::json;

    #[test]
    fn envelope_headers_survive_the_wire_encoding() {
        let headers: HashMap<String, Value> = [
            ("tenant_id".to_string(), json!("acme")),
            ("attempt".to_string(), json!(3)),
            ("ratio".to_string(), json!(0.5)),
            ("urgent".to_string(), json!(true)),
            ("missing".to_string(), Value::Null),
            ("tags".to_string(), json!(["a", 1])),
            ("origin".to_string(), json!({ "user_id": "u-1", "depth": 2 })),
        ]
        .into_iter()
        .collect();

        let decoded = from_field_table(&to_field_table(&headers));

        assert_eq!(decoded, headers);
    }

    #[test]
    fn broker_specific_values_are_readable() {
        let mut table = FieldTable::default();
        table.insert("x-death-count".into(), AMQPValue::LongUInt(2));
        table.insert("x-first".into(), AMQPValue::ShortString(ShortString::from("queue")));
        table.insert(
            "price".into(),
            AMQPValue::DecimalValue(DecimalValue { scale: 2, value: 150 }),
        );

        let decoded = from_field_table(&table);

        assert_eq!(decoded["x-death-count"], json!(2));
        assert_eq!(decoded["x-first"], json!("queue"));
        assert!(decoded["price"].is_string());
    }

    #[test]
    fn integers_travel_as_signed_64_bit() {
        assert_eq!(to_amqp(&json!(42)), AMQPValue::LongLongInt(42));
        assert_eq!(to_amqp(&json!(-1)), AMQPValue::LongLongInt(-1));
        assert_eq!(to_amqp(&json!(1.25)), AMQPValue::Double(1.25));
    }
}

use crate::feast::types::ValueType;
use crate::model::{EntityKey, Value};

fn push_header(bytes: &mut Vec<u8>, value_type: ValueType, len: usize) {
    bytes.extend((value_type as u32).to_le_bytes());
    bytes.extend((len as u32).to_le_bytes());
}

fn push_list<T>(bytes: &mut Vec<u8>, value_type: ValueType, items: &[T], encode: fn(&T) -> Vec<u8>) {
    let mut payload = Vec::new();
    payload.extend((items.len() as u32).to_le_bytes());
    for item in items {
        let encoded = encode(item);
        payload.extend((encoded.len() as u32).to_le_bytes());
        payload.extend(encoded);
    }
    push_header(bytes, value_type, payload.len());
    bytes.extend(payload);
}

fn serialize_value(bytes: &mut Vec<u8>, value: &Value) {
    let value_type = value.value_type();
    match value {
        Value::Int64(v) => {
            push_header(bytes, value_type, 8);
            bytes.extend(v.to_le_bytes());
        }
        Value::Double(v) => {
            push_header(bytes, value_type, 8);
            bytes.extend(v.to_bits().to_le_bytes());
        }
        Value::String(v) => {
            push_header(bytes, value_type, v.len());
            bytes.extend(v.as_bytes());
        }
        Value::Bytes(v) => {
            push_header(bytes, value_type, v.len());
            bytes.extend(v);
        }
        Value::Bool(v) => {
            push_header(bytes, value_type, 1);
            bytes.push(u8::from(*v));
        }
        Value::Int64List(items) => {
            push_list(bytes, value_type, items, |v| v.to_le_bytes().to_vec())
        }
        Value::DoubleList(items) => {
            push_list(bytes, value_type, items, |v| v.to_bits().to_le_bytes().to_vec())
        }
        Value::StringList(items) => push_list(bytes, value_type, items, |v| v.as_bytes().to_vec()),
        Value::BytesList(items) => push_list(bytes, value_type, items, |v| v.clone()),
        Value::BoolList(items) => push_list(bytes, value_type, items, |v| vec![u8::from(*v)]),
    }
}

/// Serializes a canonical entity key: the number of join keys, every join key name as a
/// length-prefixed string, then every value with its type tag and length prefix.
///
/// `EntityKey` keeps its names sorted, so equal keys always produce equal bytes.
pub fn serialize_key(entity_key: &EntityKey) -> Vec<u8> {
    let names = entity_key.entity_names();
    let mut bytes: Vec<u8> = vec![];
    bytes.extend((names.len() as u32).to_le_bytes());
    for name in names {
        push_header(&mut bytes, ValueType::String, name.len());
        bytes.extend(name.as_bytes());
    }
    for value in entity_key.entity_values() {
        serialize_value(&mut bytes, value);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn std_hex(bytes: &[u8]) -> String {
        "0x".to_string()
            + &bytes
                .iter()
                .map(|b| format!("{:02x}", b).to_uppercase())
                .collect::<String>()
    }

    #[test]
    fn test_serialize_key() {
        let entity_key = EntityKey::single("driver_id", Value::Int64(1005));
        let serialized = serialize_key(&entity_key);
        let serialized_str = std_hex(&serialized);
        let expected =
            "0x0100000002000000090000006472697665725F69640400000008000000ED03000000000000";
        assert_eq!(serialized_str, expected);
    }

    #[test]
    fn input_order_does_not_change_serialized_key() -> crate::Result<()> {
        let forward = EntityKey::new([
            ("driver_id", Value::Int64(1)),
            ("customer_id", Value::String("c-7".to_string())),
        ])?;
        let backward = EntityKey::new([
            ("customer_id", Value::String("c-7".to_string())),
            ("driver_id", Value::Int64(1)),
        ])?;
        assert_eq!(forward, backward);
        assert_eq!(serialize_key(&forward), serialize_key(&backward));
        Ok(())
    }

    #[test]
    fn list_values_are_length_delimited() {
        let one = EntityKey::single("tags", Value::StringList(vec!["ab".into(), "c".into()]));
        let other = EntityKey::single("tags", Value::StringList(vec!["a".into(), "bc".into()]));
        assert_ne!(serialize_key(&one), serialize_key(&other));
    }
}

use serde_json::Value;

use dubbo_protocol::{Error, Result, SerializeType};

/// converts call arguments and response payloads. the scheduler never looks
/// inside the bytes it puts on the wire.
pub trait Serializer: Send + Sync {
    fn serialize_type(&self) -> SerializeType;
    fn serialize_args(&self, args: &[Value]) -> Result<Vec<u8>>;
    fn deserialize_body(&self, payload: &[u8]) -> Result<Value>;
}

pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_type(&self) -> SerializeType {
        SerializeType::JSON
    }

    fn serialize_args(&self, args: &[Value]) -> Result<Vec<u8>> {
        serde_json::to_vec(args).map_err(Error::from)
    }

    fn deserialize_body(&self, payload: &[u8]) -> Result<Value> {
        if payload.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(payload).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_round_trip() {
        let serializer = JsonSerializer;
        let args = vec![json!("hi"), json!(2)];
        let bytes = serializer.serialize_args(&args).unwrap();
        assert_eq!(json!(["hi", 2]), serializer.deserialize_body(&bytes).unwrap());
    }

    #[test]
    fn empty_payload_is_null() {
        let serializer = JsonSerializer;
        assert_eq!(Value::Null, serializer.deserialize_body(&[]).unwrap());
    }
}

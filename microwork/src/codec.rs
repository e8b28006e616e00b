//! JSON message codec.
//!
//! Payloads travel as plain UTF-8 JSON text with no envelope, so any service
//! speaking JSON over the same exchange can interoperate.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Serialize a payload to wire bytes
pub fn encode<T: Serialize + ?Sized>(data: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(data)?)
}

/// Deserialize wire bytes into an untyped JSON value
pub fn decode(bytes: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Deserialize wire bytes into a concrete type
pub fn decode_as<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Convert an already decoded value into a concrete type
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    Ok(T::deserialize(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MicroworkError;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        hello: String,
    }

    #[test]
    fn test_encodes_plain_json_text() {
        let bytes = encode(&json!({"hello": "world"})).unwrap();
        assert_eq!(bytes, br#"{"hello":"world"}"#);

        let bytes = encode("ping").unwrap();
        assert_eq!(bytes, br#""ping""#);
    }

    #[test]
    fn test_decodes_into_value_and_type() {
        let bytes = br#"{"hello":"world"}"#;
        assert_eq!(decode(bytes).unwrap(), json!({"hello": "world"}));

        let greeting: Greeting = decode_as(bytes).unwrap();
        assert_eq!(greeting.hello, "world");

        let value = decode(bytes).unwrap();
        let greeting: Greeting = from_value(&value).unwrap();
        assert_eq!(greeting, Greeting { hello: "world".into() });
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let err = decode(b"not json").unwrap_err();
        assert!(matches!(err, MicroworkError::Serialization(_)));

        let err = decode(b"").unwrap_err();
        assert!(matches!(err, MicroworkError::Serialization(_)));
    }
}

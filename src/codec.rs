//! Positional JSON codec for call payloads.
//!
//! Arguments travel as a JSON array in the envelope payload; position, not
//! name, determines identity. Results travel as a single JSON value, and
//! error descriptions as a JSON string. The envelope itself never carries a
//! type descriptor — the caller knows the expected return type at the call
//! site.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::RpcError;

/// Encode a positional argument list.
pub fn encode_args(args: &[Value]) -> Result<Vec<u8>, RpcError> {
    Ok(serde_json::to_vec(args)?)
}

/// Decode a positional argument list. An empty payload means no arguments.
pub fn decode_args(payload: &[u8]) -> Result<Vec<Value>, RpcError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Encode a single result value.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a single result value into the caller's declared type.
pub fn decode_value<T: DeserializeOwned>(payload: &[u8]) -> Result<T, RpcError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decode one positional argument into a concrete type.
///
/// Used by handlers to pull typed parameters out of the argument array.
pub fn decode_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, RpcError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    Ok(serde_json::from_value(value)?)
}

/// Decode the textual error description carried by an error envelope.
///
/// Falls back to lossy UTF-8 when the payload is not a JSON string, so a
/// mangled error still surfaces as text rather than a second failure.
pub fn decode_error_text(payload: &[u8]) -> String {
    serde_json::from_slice::<String>(payload)
        .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_round_trip() {
        let args = vec![json!(42), json!("hello"), json!({"k": true})];
        let decoded = decode_args(&encode_args(&args).expect("encode")).expect("decode");
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_empty_payload_decodes_to_no_args() {
        assert!(decode_args(&[]).expect("decode").is_empty());
    }

    #[test]
    fn test_decode_arg_by_position() {
        let args = vec![json!(7), json!("x")];
        let n: u32 = decode_arg(&args, 0).expect("arg 0");
        let s: String = decode_arg(&args, 1).expect("arg 1");
        assert_eq!(n, 7);
        assert_eq!(s, "x");
    }

    #[test]
    fn test_missing_arg_decodes_as_null() {
        let args = vec![json!(1)];
        let missing: Option<String> = decode_arg(&args, 5).expect("absent arg");
        assert_eq!(missing, None);
    }

    #[test]
    fn test_error_text_fallback_for_raw_bytes() {
        assert_eq!(decode_error_text(b"plain failure"), "plain failure");
        let json_text = encode_value(&"structured failure").expect("encode");
        assert_eq!(decode_error_text(&json_text), "structured failure");
    }
}

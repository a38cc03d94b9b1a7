//! Base64 helpers for binary MIME payloads (`image/png`, `image/jpeg`).

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serializer};

/// Encode raw bytes the way the frontend expects image data in a MIME bundle.
pub fn encode_base64(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Decode a base64 MIME payload back into bytes.
pub fn decode_base64(encoded: &str) -> Result<Bytes, base64::DecodeError> {
    BASE64_STANDARD.decode(encoded).map(Bytes::from)
}

/// Serialize Bytes as a base64-encoded string.
///
/// Used with `#[serde(serialize_with = "serialize_bytes")]`
pub fn serialize_bytes<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&encode_base64(data))
}

/// Deserialize a base64-encoded string into Bytes.
///
/// `null` and a missing field both yield empty bytes.
///
/// Used with `#[serde(default, deserialize_with = "deserialize_bytes")]`
pub fn deserialize_bytes<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    match encoded {
        Some(s) => decode_base64(&s).map_err(serde::de::Error::custom),
        None => Ok(Bytes::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct TestStruct {
        #[serde(
            default,
            serialize_with = "serialize_bytes",
            deserialize_with = "deserialize_bytes"
        )]
        data: Bytes,
    }

    #[test]
    fn test_encode_png_header() {
        // PNG magic bytes
        let encoded = encode_base64(&[0x89, b'P', b'N', b'G']);
        assert_eq!(encoded, "iVBORw==");
        assert_eq!(&decode_base64(&encoded).unwrap()[..], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn test_serialize_bytes() {
        let test = TestStruct {
            data: Bytes::from("hello"),
        };
        let json = serde_json::to_string(&test).unwrap();
        assert_eq!(json, r#"{"data":"aGVsbG8="}"#);
    }

    #[test]
    fn test_deserialize_bytes() {
        let test: TestStruct = serde_json::from_str(r#"{"data": "d29ybGQ="}"#).unwrap();
        assert_eq!(&test.data[..], b"world");
    }

    #[test]
    fn test_deserialize_null_and_missing() {
        let test: TestStruct = serde_json::from_str(r#"{"data": null}"#).unwrap();
        assert!(test.data.is_empty());
        let test: TestStruct = serde_json::from_str("{}").unwrap();
        assert!(test.data.is_empty());
    }

    #[test]
    fn test_decode_invalid() {
        assert!(decode_base64("not base64!").is_err());
    }
}

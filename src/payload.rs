//! JSON payload shapes accepted by the intake endpoints
//!
//! A body is either a bare record or a batch envelope `{"Data": [record, ...]}`.
//! Only the first record of a batch is ever processed.

use crate::error::{IntakeError, Result};
use serde::Deserialize;
use serde_json::Value;

/// Key of the batch envelope list.
pub const ENVELOPE_KEY: &str = "Data";

/// One logical input record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RequestPayload {
    #[serde(default)]
    pub base64: Option<String>,

    #[serde(default)]
    pub file_stream: Option<Vec<u8>>,

    #[serde(default, rename = "GUID")]
    pub guid: Option<String>,
}

/// The byte source a record resolved to. Base64 wins over `file_stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource<'a> {
    Base64(&'a str),
    FileStream(&'a [u8]),
}

impl RequestPayload {
    /// Validate a resolved record into a payload.
    pub fn from_record(record: &Value) -> Result<Self> {
        Self::deserialize(record)
            .map_err(|e| IntakeError::input(format!("invalid payload: {}", e)))
    }

    /// First non-empty source in declaration order, if any.
    pub fn source(&self) -> Option<PayloadSource<'_>> {
        match (&self.base64, &self.file_stream) {
            (Some(b64), _) if !b64.is_empty() => Some(PayloadSource::Base64(b64)),
            (_, Some(stream)) if !stream.is_empty() => Some(PayloadSource::FileStream(stream)),
            _ => None,
        }
    }
}

/// Resolve the single record to validate from a parsed body.
pub fn resolve_record(body: &Value) -> Result<&Value> {
    let record = match body.get(ENVELOPE_KEY) {
        Some(Value::Array(items)) => items
            .first()
            .ok_or_else(|| IntakeError::input("invalid payload: empty Data list"))?,
        Some(Value::Null) => {
            return Err(IntakeError::input("invalid payload: empty Data list"));
        }
        Some(_) => {
            return Err(IntakeError::input("invalid payload: Data must be a list"));
        }
        None => body,
    };

    if !record.is_object() {
        return Err(IntakeError::input(
            "invalid payload: expect object or Data[0]",
        ));
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_batch_envelope_resolves_to_first_item() {
        let item = json!({"base64": "AAEC", "GUID": "abc"});
        let batch = json!({"Data": [item.clone(), {"base64": "ignored"}]});

        assert_eq!(resolve_record(&batch).unwrap(), &item);
        assert_eq!(resolve_record(&item).unwrap(), &item);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let err = resolve_record(&json!({"Data": []})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);

        let err = resolve_record(&json!({"Data": null})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_non_object_record_is_rejected() {
        assert!(resolve_record(&json!([1, 2, 3])).is_err());
        assert!(resolve_record(&json!("text")).is_err());
        assert!(resolve_record(&json!({"Data": [42]})).is_err());
        assert!(resolve_record(&json!({"Data": "nope"})).is_err());
    }

    #[test]
    fn test_file_stream_record_is_not_mistaken_for_envelope() {
        let record = json!({"file_stream": [1, 2, 3]});
        assert_eq!(resolve_record(&record).unwrap(), &record);
    }

    #[test]
    fn test_source_precedence() {
        let both = RequestPayload {
            base64: Some("AAEC".to_string()),
            file_stream: Some(vec![1, 2]),
            guid: None,
        };
        assert_eq!(both.source(), Some(PayloadSource::Base64("AAEC")));

        let empty_b64 = RequestPayload {
            base64: Some(String::new()),
            file_stream: Some(vec![1, 2]),
            guid: None,
        };
        assert_eq!(empty_b64.source(), Some(PayloadSource::FileStream(&[1, 2])));

        let nothing = RequestPayload {
            file_stream: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(nothing.source(), None);
    }

    #[test]
    fn test_from_record_validates_types() {
        let payload =
            RequestPayload::from_record(&json!({"file_stream": [0, 255], "GUID": "g-1"})).unwrap();
        assert_eq!(payload.file_stream, Some(vec![0, 255]));
        assert_eq!(payload.guid.as_deref(), Some("g-1"));

        // Out-of-range byte and wrong field type both fail validation
        assert!(RequestPayload::from_record(&json!({"file_stream": [256]})).is_err());
        assert!(RequestPayload::from_record(&json!({"base64": 12})).is_err());

        // Unknown fields are ignored
        let payload = RequestPayload::from_record(&json!({"extra": true})).unwrap();
        assert_eq!(payload, RequestPayload::default());
    }
}

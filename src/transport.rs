//! Transport decoding: which channel carried the payload, and its bytes
//!
//! Precedence is multipart `file` part, then JSON `base64`, then JSON
//! `file_stream`. The request body is read exactly once.

use crate::error::{IntakeError, Result};
use crate::payload::{resolve_record, PayloadSource, RequestPayload};
use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Name of the multipart part carrying an uploaded file.
pub const FILE_FIELD: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    File,
    Base64,
    FileStream,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::File => "file",
            InputMode::Base64 => "base64",
            InputMode::FileStream => "file_stream",
        }
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Undecoded media bytes plus the channel they arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBytes {
    pub bytes: Vec<u8>,
    pub mode: InputMode,
    pub guid: Option<String>,
}

impl RawBytes {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// MIME type sniffed from magic bytes, if recognizable.
    pub fn sniff_mime(&self) -> Option<&'static str> {
        infer::get(&self.bytes).map(|kind| kind.mime_type())
    }
}

/// Extract the payload from an HTTP request.
pub async fn extract(request: Request) -> Result<RawBytes> {
    if is_multipart(&request) {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| IntakeError::input(format!("invalid multipart body: {}", e)))?;
        from_multipart(multipart).await
    } else {
        let body = Bytes::from_request(request, &())
            .await
            .map_err(|e| IntakeError::input(format!("unreadable body: {}", e)))?;
        from_json_body(&body)
    }
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

async fn from_multipart(mut multipart: Multipart) -> Result<RawBytes> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| IntakeError::input(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| IntakeError::input(format!("unreadable file part: {}", e)))?;
        if bytes.is_empty() {
            tracing::error!("file is none");
            return Err(IntakeError::input("empty file"));
        }
        return Ok(RawBytes {
            bytes: bytes.to_vec(),
            mode: InputMode::File,
            guid: None,
        });
    }

    Err(IntakeError::input(
        "no valid input (expect multipart 'file' or JSON 'base64'/'file_stream')",
    ))
}

/// Resolve a JSON body into raw bytes.
pub fn from_json_body(body: &[u8]) -> Result<RawBytes> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        tracing::error!("JSON decode fail: {}", e);
        IntakeError::input("invalid or missing JSON body")
    })?;

    let payload = RequestPayload::from_record(resolve_record(&value)?)?;

    let (bytes, mode) = match payload.source() {
        Some(PayloadSource::Base64(b64)) => (decode_base64(b64)?, InputMode::Base64),
        Some(PayloadSource::FileStream(stream)) => (stream.to_vec(), InputMode::FileStream),
        None => {
            tracing::error!("INVALID INPUT (file/base64/file_stream)");
            return Err(IntakeError::input(
                "no valid input (expect multipart 'file' or JSON 'base64'/'file_stream')",
            ));
        }
    };

    Ok(RawBytes {
        bytes,
        mode,
        guid: payload.guid,
    })
}

/// Decode a base64 string, tolerating a data-URI prefix and embedded
/// whitespace.
pub fn decode_base64(b64: &str) -> Result<Vec<u8>> {
    let body = match b64.split_once(',') {
        Some((_, rest)) => rest,
        None => b64,
    }
    .trim();

    match STANDARD.decode(body) {
        Ok(bytes) => Ok(bytes),
        Err(_) => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| IntakeError::input(format!("invalid base64: {}", e)))
        }
    }
}

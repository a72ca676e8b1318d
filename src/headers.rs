use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CatsError;

/// One entry of the `Files` message header: metadata for a slice of the
///  concatenated byte stream carried by a file-set payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub key: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// The JSON message headers carried inside a frame body, separated from the
///  payload by `\x00\x00`. Not to be confused with the fixed binary frame
///  header.
///
/// Recognized keys: `Status` (int, defaults to 200), `Offset` (non-negative
///  int, request only), `Files` (array of [FileEntry], required for file
///  payloads).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Map<String, Value>);

impl Headers {
    pub fn new() -> Headers {
        Headers(Map::new())
    }

    /// Validates the recognized keys, rejecting e.g. a negative `Offset`.
    pub fn from_map(map: Map<String, Value>) -> Result<Headers, CatsError> {
        if let Some(offset) = map.get("Offset") {
            if offset.as_u64().is_none() {
                return Err(CatsError::protocol("invalid offset header"));
            }
        }
        if let Some(status) = map.get("Status") {
            if status.as_u64().is_none() {
                return Err(CatsError::malformed("invalid status header"));
            }
        }
        Ok(Headers(map))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn status(&self) -> u16 {
        self.0
            .get("Status")
            .and_then(|v| v.as_u64())
            .map(|v| v as u16)
            .unwrap_or(200)
    }

    pub fn set_status(&mut self, status: u16) {
        self.0.insert("Status".into(), status.into());
    }

    pub fn offset(&self) -> u64 {
        self.0.get("Offset").and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.0.insert("Offset".into(), offset.into());
    }

    pub fn files(&self) -> Result<Option<Vec<FileEntry>>, CatsError> {
        match self.0.get("Files") {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| CatsError::malformed(format!("invalid files header: {}", e))),
        }
    }

    pub fn set_files(&mut self, entries: &[FileEntry]) {
        let value = serde_json::to_value(entries).expect("file entries are always serializable");
        self.0.insert("Files".into(), value);
    }

    /// Serializes to the UTF-8 JSON bytes that go on the wire, without the
    ///  trailing separator. Headers containing NUL bytes are rejected because
    ///  they would collide with the header/payload separator.
    pub fn encode(&self) -> Result<Vec<u8>, CatsError> {
        let buf = serde_json::to_vec(&Value::Object(self.0.clone()))
            .map_err(|e| CatsError::malformed(format!("failed to encode headers: {}", e)))?;
        if buf.iter().any(|&b| b == 0) {
            return Err(CatsError::malformed("headers must not contain NUL bytes"));
        }
        Ok(buf)
    }

    /// Parses the header bytes as received, i.e. without the separator.
    pub fn decode(buf: &[u8]) -> Result<Headers, CatsError> {
        let value: Value = serde_json::from_slice(buf)
            .map_err(|e| CatsError::protocol(format!("failed to parse headers: {}", e)))?;
        match value {
            Value::Object(map) => Headers::from_map(map),
            other => Err(CatsError::protocol(format!(
                "headers must be a JSON object, got {}",
                other
            ))),
        }
    }
}

impl From<Headers> for Map<String, Value> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

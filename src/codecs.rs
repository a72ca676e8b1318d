use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use crate::error::CatsError;
use crate::headers::{FileEntry, Headers};

/// Declared content type of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Binary = 0x00,
    Json = 0x01,
    Files = 0x02,
}

impl DataType {
    pub fn from_u8(value: u8) -> Result<DataType, CatsError> {
        match value {
            0x00 => Ok(DataType::Binary),
            0x01 => Ok(DataType::Json),
            0x02 => Ok(DataType::Files),
            n => Err(CatsError::protocol(format!(
                "unsupported data type {:#04x}",
                n
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Binary => "bytes",
            DataType::Json => "json",
            DataType::Files => "files",
        }
    }
}

/// A file to be sent as part of a file-set payload. `key` addresses the
///  entry on the receiving side, `name` is the advertised file name.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub key: String,
    pub name: String,
    pub path: PathBuf,
    pub mime: Option<String>,
}

impl FileSource {
    /// Uses the file name from the path for both key and advertised name.
    pub fn new(path: impl Into<PathBuf>) -> FileSource {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        FileSource {
            key: name.clone(),
            name,
            path,
            mime: None,
        }
    }

    pub fn named(key: impl Into<String>, path: impl Into<PathBuf>) -> FileSource {
        let mut source = FileSource::new(path);
        source.key = key.into();
        source
    }
}

/// Outbound payload data, one variant per codec. `None` encodes as an empty
///  binary payload.
#[derive(Clone, Debug)]
pub enum Data {
    None,
    Bytes(Vec<u8>),
    Json(Value),
    Files(Vec<FileSource>),
}

impl Data {
    pub fn json(value: impl Into<Value>) -> Data {
        Data::Json(value.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Data {
        Data::Files(vec![FileSource::new(path)])
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Data {
        Data::Bytes(bytes)
    }
}

impl From<&[u8]> for Data {
    fn from(bytes: &[u8]) -> Data {
        Data::Bytes(bytes.to_vec())
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Data {
        Data::Json(value)
    }
}

/// One received file, spooled to a temporary file that is deleted when this
///  value is dropped.
#[derive(Debug)]
pub struct ReceivedFile {
    pub key: String,
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
    path: TempPath,
}

impl ReceivedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A decoded inbound payload.
#[derive(Debug)]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(Value),
    Files(Vec<ReceivedFile>),
}

impl Payload {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn files(&self) -> Option<&[ReceivedFile]> {
        match self {
            Payload::Files(f) => Some(f),
            _ => None,
        }
    }
}

/// Codec output, before compression. Payloads above the plain-data limit
///  live in a temporary file instead of memory.
pub enum Encoded {
    Buf(Vec<u8>),
    Spooled { path: TempPath, len: u64 },
}

impl Encoded {
    pub fn len(&self) -> u64 {
        match self {
            Encoded::Buf(b) => b.len() as u64,
            Encoded::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decompressed inbound payload bytes handed to [decode].
pub enum PayloadSource {
    Buf(Vec<u8>),
    Spooled { path: TempPath, len: u64 },
}

/// Encodes outbound data, choosing the declared data type from the value
///  shape. File sets are spooled to a temporary file as one concatenated
///  stream and their metadata is recorded in the `Files` header.
pub async fn encode(data: Data, headers: &mut Headers) -> Result<(Encoded, DataType), CatsError> {
    match data {
        Data::None => Ok((Encoded::Buf(Vec::new()), DataType::Binary)),
        Data::Bytes(bytes) => Ok((Encoded::Buf(bytes), DataType::Binary)),
        Data::Json(value) => {
            let buf = serde_json::to_vec(&value)
                .map_err(|e| CatsError::malformed(format!("failed to encode JSON: {}", e)))?;
            Ok((Encoded::Buf(buf), DataType::Json))
        }
        Data::Files(sources) => {
            let (encoded, entries) = spool_file_set(sources).await?;
            headers.set_files(&entries);
            Ok((encoded, DataType::Files))
        }
    }
}

async fn spool_file_set(sources: Vec<FileSource>) -> Result<(Encoded, Vec<FileEntry>), CatsError> {
    tokio::task::spawn_blocking(move || -> Result<(Encoded, Vec<FileEntry>), CatsError> {
        let mut spool = NamedTempFile::new()?;
        let mut entries = Vec::with_capacity(sources.len());
        let mut total = 0u64;

        for source in &sources {
            let mut fh = File::open(&source.path).map_err(|e| {
                CatsError::malformed(format!("cannot open {:?}: {}", source.path, e))
            })?;
            let size = io::copy(&mut fh, spool.as_file_mut())?;
            total += size;
            entries.push(FileEntry {
                key: source.key.clone(),
                name: source.name.clone(),
                size,
                mime: source.mime.clone(),
            });
        }
        spool.as_file_mut().flush()?;

        debug!("spooled {} files, {} bytes total", entries.len(), total);
        Ok((
            Encoded::Spooled {
                path: spool.into_temp_path(),
                len: total,
            },
            entries,
        ))
    })
    .await
    .map_err(|e| CatsError::protocol(format!("file spool worker failed: {}", e)))?
}

/// Decodes an inbound payload. The `Offset` header makes the decoder drop
///  that many leading payload bytes first; for file sets the `Files` header
///  is adjusted in place (sizes reduced in order, entries consumed entirely
///  are removed, a partially consumed file keeps its name).
pub async fn decode(
    source: PayloadSource,
    data_type: DataType,
    headers: &mut Headers,
) -> Result<Payload, CatsError> {
    let offset = headers.offset();
    match data_type {
        DataType::Binary | DataType::Json => {
            let buf = match source {
                PayloadSource::Buf(buf) => buf,
                PayloadSource::Spooled { .. } => {
                    return Err(CatsError::protocol(format!(
                        "{} payload exceeds the plain data limit",
                        data_type.name()
                    )));
                }
            };
            let buf = if offset > 0 {
                let skip = (offset as usize).min(buf.len());
                buf[skip..].to_vec()
            } else {
                buf
            };
            if data_type == DataType::Binary {
                Ok(Payload::Bytes(buf))
            } else {
                decode_json(&buf)
            }
        }
        DataType::Files => {
            let entries = headers
                .files()?
                .ok_or_else(|| CatsError::protocol("files payload without Files header"))?;
            let (files, adjusted) = split_file_set(source, entries, offset).await?;
            headers.set_files(&adjusted);
            headers.set_offset(0);
            Ok(Payload::Files(files))
        }
    }
}

fn decode_json(buf: &[u8]) -> Result<Payload, CatsError> {
    if buf.is_empty() {
        return Ok(Payload::Json(Value::Object(Default::default())));
    }
    let value = serde_json::from_slice(buf)
        .map_err(|e| CatsError::malformed(format!("failed to parse JSON payload: {}", e)))?;
    Ok(Payload::Json(value))
}

/// Splits the concatenated content stream back into one temporary file per
///  entry, applying the leading offset to sizes in declaration order.
async fn split_file_set(
    source: PayloadSource,
    entries: Vec<FileEntry>,
    offset: u64,
) -> Result<(Vec<ReceivedFile>, Vec<FileEntry>), CatsError> {
    tokio::task::spawn_blocking(move || -> Result<(Vec<ReceivedFile>, Vec<FileEntry>), CatsError> {
        let mut reader: Box<dyn Read + '_> = match &source {
            PayloadSource::Buf(buf) => Box::new(io::Cursor::new(buf.as_slice())),
            PayloadSource::Spooled { path, .. } => Box::new(File::open(path)?),
        };

        let mut left = offset;
        let mut adjusted = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if left >= entry.size {
                left -= entry.size;
                skip_bytes(&mut reader, entry.size)?;
                continue;
            }
            if left > 0 {
                skip_bytes(&mut reader, left)?;
                entry.size -= left;
                left = 0;
            }
            adjusted.push(entry);
        }

        let mut files = Vec::with_capacity(adjusted.len());
        for entry in &adjusted {
            let mut spool = NamedTempFile::new()?;
            let copied = io::copy(&mut reader.by_ref().take(entry.size), spool.as_file_mut())?;
            if copied != entry.size {
                return Err(CatsError::malformed(format!(
                    "file stream truncated: expected {} bytes for {:?}, got {}",
                    entry.size, entry.key, copied
                )));
            }
            spool.as_file_mut().flush()?;
            files.push(ReceivedFile {
                key: entry.key.clone(),
                name: entry.name.clone(),
                size: entry.size,
                mime: entry.mime.clone(),
                path: spool.into_temp_path(),
            });
        }
        Ok((files, adjusted))
    })
    .await
    .map_err(|e| CatsError::protocol(format!("file split worker failed: {}", e)))?
}

fn skip_bytes(reader: &mut dyn Read, n: u64) -> Result<(), CatsError> {
    let skipped = io::copy(&mut reader.take(n), &mut io::sink())?;
    if skipped != n {
        return Err(CatsError::malformed(
            "file stream shorter than the declared offset",
        ));
    }
    Ok(())
}

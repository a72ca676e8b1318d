use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::trace;

use crate::error::CatsError;

/// Payloads below this size are sent uncompressed; gzip on tiny buffers
///  costs more than it saves.
const COMPRESSION_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None = 0x00,
    Gzip = 0x01,
}

impl Compression {
    pub fn from_u8(value: u8) -> Result<Compression, CatsError> {
        match value {
            0x00 => Ok(Compression::None),
            0x01 => Ok(Compression::Gzip),
            n => Err(CatsError::protocol(format!(
                "unsupported compression method {:#04x}",
                n
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Chooses a compression method for a payload of the given size. Streaming
///  senders call this once with a representative size and then stick with
///  the method for every chunk, since the method is declared in the frame
///  header.
pub fn propose_compression(len: usize) -> Compression {
    if len >= COMPRESSION_THRESHOLD {
        Compression::Gzip
    } else {
        Compression::None
    }
}

/// Compresses a buffer. With `method = None` a method is proposed from the
///  payload size, falling back to no compression when gzip does not shrink
///  the data. The chosen method is returned so it can go into the header.
pub fn compress(data: &[u8], method: Option<Compression>) -> Result<(Vec<u8>, Compression), CatsError> {
    let proposed = method.unwrap_or_else(|| propose_compression(data.len()));
    match proposed {
        Compression::None => Ok((data.to_vec(), Compression::None)),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            let compressed = encoder.finish()?;
            trace!("gzip: {} -> {} bytes", data.len(), compressed.len());
            if method.is_none() && compressed.len() >= data.len() {
                return Ok((data.to_vec(), Compression::None));
            }
            Ok((compressed, Compression::Gzip))
        }
    }
}

/// Decompresses a buffer, enforcing `limit` on the inflated size when given
///  so a hostile peer cannot expand a small frame into unbounded memory.
pub fn decompress(
    data: &[u8],
    method: Compression,
    limit: Option<usize>,
) -> Result<Vec<u8>, CatsError> {
    match method {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = decoder
                    .read(&mut buf)
                    .map_err(|e| CatsError::protocol(format!("gzip decode failed: {}", e)))?;
                if n == 0 {
                    return Ok(out);
                }
                if let Some(limit) = limit {
                    if out.len() + n > limit {
                        return Err(CatsError::protocol(format!(
                            "decompressed payload exceeds {} bytes",
                            limit
                        )));
                    }
                }
                out.extend_from_slice(&buf[..n]);
            }
        }
    }
}

/// Compresses `src` into `dst` on a blocking thread. Used for spooled
///  payloads that are too large for memory.
pub async fn compress_file(
    src: PathBuf,
    dst: PathBuf,
    method: Option<Compression>,
) -> Result<Compression, CatsError> {
    let method = method.unwrap_or(Compression::Gzip);
    tokio::task::spawn_blocking(move || -> Result<Compression, CatsError> {
        let mut src = File::open(&src)?;
        let dst = File::create(&dst)?;
        match method {
            Compression::None => {
                let mut dst = dst;
                io::copy(&mut src, &mut dst)?;
            }
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(dst, flate2::Compression::default());
                io::copy(&mut src, &mut encoder)?;
                encoder.finish()?;
            }
        }
        Ok(method)
    })
    .await
    .map_err(|e| CatsError::protocol(format!("compression worker failed: {}", e)))?
}

/// Decompresses `src` into `dst` on a blocking thread.
pub async fn decompress_file(
    src: PathBuf,
    dst: PathBuf,
    method: Compression,
) -> Result<(), CatsError> {
    tokio::task::spawn_blocking(move || -> Result<(), CatsError> {
        let src = File::open(&src)?;
        let mut dst = File::create(&dst)?;
        match method {
            Compression::None => {
                let mut src = src;
                io::copy(&mut src, &mut dst)?;
            }
            Compression::Gzip => {
                let mut decoder = GzDecoder::new(src);
                io::copy(&mut decoder, &mut dst)
                    .map_err(|e| CatsError::protocol(format!("gzip decode failed: {}", e)))?;
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| CatsError::protocol(format!("decompression worker failed: {}", e)))?
}

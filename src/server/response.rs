use bytes::BytesMut;
use tempfile::NamedTempFile;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::codecs::{self, Data, DataType, Encoded};
use crate::compression::{self, Compression};
use crate::error::CatsError;
use crate::headers::Headers;
use crate::util::now_millis;
use crate::wire::stream::FrameWriter;
use crate::wire::{FrameType, InputHead, RequestHead, StreamHead, HEADER_SEPARATOR};

/// What a handler may answer with: a fixed-length response or a streamed
///  one. Returning no reply at all is expressed as `Ok(None)` at the
///  handler level.
pub enum Reply {
    Plain(Response),
    Stream(StreamResponse),
}

impl From<Response> for Reply {
    fn from(response: Response) -> Reply {
        Reply::Plain(response)
    }
}

impl From<StreamResponse> for Reply {
    fn from(response: StreamResponse) -> Reply {
        Reply::Stream(response)
    }
}

/// A fixed-length response (frame type 0x00). `handler_id` and `message_id`
///  are stamped by the connection to echo the request being answered.
pub struct Response {
    pub handler_id: u16,
    pub message_id: u16,
    pub data: Data,
    pub headers: Headers,
    pub compression: Option<Compression>,
}

impl Response {
    pub fn new(data: impl Into<Data>) -> Response {
        Response {
            handler_id: 0,
            message_id: 0,
            data: data.into(),
            headers: Headers::new(),
            compression: None,
        }
    }

    pub fn json(value: impl Into<serde_json::Value>) -> Response {
        Response::new(Data::Json(value.into()))
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Response {
        Response::new(Data::Bytes(bytes.into()))
    }

    pub fn empty() -> Response {
        Response::new(Data::None)
    }

    pub fn with_status(mut self, status: u16) -> Response {
        self.headers.set_status(status);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Response {
        self.headers = headers;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Response {
        self.compression = Some(compression);
        self
    }

    pub fn status(&self) -> u16 {
        self.headers.status()
    }
}

/// A streamed response (frame type 0x01): a lazy sequence of byte chunks,
///  compressed per chunk and terminated by a zero-length chunk on the wire.
pub struct StreamResponse {
    pub handler_id: u16,
    pub message_id: u16,
    pub data_type: DataType,
    pub source: ChunkSource,
    pub headers: Headers,
    pub compression: Option<Compression>,
}

impl StreamResponse {
    pub fn new(source: ChunkSource, data_type: DataType) -> StreamResponse {
        StreamResponse {
            handler_id: 0,
            message_id: 0,
            data_type,
            source,
            headers: Headers::new(),
            compression: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> StreamResponse {
        self.headers.set_status(status);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> StreamResponse {
        self.compression = Some(compression);
        self
    }
}

/// The byte chunks backing a [StreamResponse]: either an eager in-memory
///  sequence or a channel fed by a producer task.
pub enum ChunkSource {
    Iter(Box<dyn Iterator<Item = Vec<u8>> + Send>),
    Channel(mpsc::Receiver<Vec<u8>>),
}

impl ChunkSource {
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> ChunkSource {
        ChunkSource::Iter(Box::new(chunks.into_iter()))
    }

    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        match self {
            ChunkSource::Iter(iter) => iter.next(),
            ChunkSource::Channel(rx) => rx.recv().await,
        }
    }
}

/// A nested input prompt (frame type 0x02), sent mid-request to ask the
///  peer for more data.
pub struct InputResponse {
    pub message_id: u16,
    pub data: Data,
    pub headers: Headers,
    pub compression: Option<Compression>,
}

impl InputResponse {
    pub fn new(message_id: u16, data: Data) -> InputResponse {
        InputResponse {
            message_id,
            data,
            headers: Headers::new(),
            compression: None,
        }
    }
}

/// Encodes and compresses a payload, returning what goes on the wire plus
///  the declared codec and compression. Spooled payloads stay on disk; the
///  temp files delete themselves when the value drops.
async fn prepare_body(
    data: Data,
    headers: &mut Headers,
    compression: Option<Compression>,
) -> Result<(Encoded, DataType, Compression), CatsError> {
    let (encoded, data_type) = codecs::encode(data, headers).await?;
    match encoded {
        Encoded::Buf(buf) => {
            let (compressed, method) = compression::compress(&buf, compression)?;
            Ok((Encoded::Buf(compressed), data_type, method))
        }
        Encoded::Spooled { path, .. } => {
            let packed = NamedTempFile::new()?.into_temp_path();
            let method =
                compression::compress_file(path.to_path_buf(), packed.to_path_buf(), compression)
                    .await?;
            let len = std::fs::metadata(&packed)?.len();
            Ok((
                Encoded::Spooled { path: packed, len },
                data_type,
                method,
            ))
        }
    }
}

async fn write_body<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    body: &Encoded,
) -> Result<(), CatsError> {
    match body {
        Encoded::Buf(buf) => writer.write_paced(buf).await,
        Encoded::Spooled { path, len } => writer.write_file_paced(path, *len).await,
    }
}

/// Serializes and sends a 0x00 frame. Returns the status that went out,
///  for the AFTER_RESPONSE event.
pub(crate) async fn send_response<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    response: Response,
) -> Result<u16, CatsError> {
    let Response {
        handler_id,
        message_id,
        data,
        mut headers,
        compression,
    } = response;
    if headers.get("Status").is_none() {
        headers.set_status(200);
    }
    let status = headers.status();

    let (body, data_type, method) = prepare_body(data, &mut headers, compression).await?;
    let mut message_headers = headers.encode()?;
    message_headers.extend_from_slice(HEADER_SEPARATOR);

    let mut head = BytesMut::with_capacity(1 + RequestHead::SERIALIZED_LEN);
    head.extend_from_slice(&[FrameType::Request.as_u8()]);
    RequestHead {
        handler_id,
        message_id,
        send_time: now_millis(),
        data_type: data_type.as_u8(),
        compression: method.as_u8(),
        data_len: body.len() as u32 + message_headers.len() as u32,
    }
    .ser(&mut head);

    writer.write_all(&head).await?;
    writer.write_all(&message_headers).await?;
    write_body(writer, &body).await?;
    writer.flush().await?;
    Ok(status)
}

/// Serializes and sends a 0x01 frame: fixed header, then the header chunk,
///  then one compressed chunk per source chunk, then the terminator.
pub(crate) async fn send_stream_response<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    response: StreamResponse,
) -> Result<u16, CatsError> {
    let StreamResponse {
        handler_id,
        message_id,
        data_type,
        mut source,
        mut headers,
        compression,
    } = response;
    if headers.get("Status").is_none() {
        headers.set_status(200);
    }
    let status = headers.status();

    // The method is declared once in the fixed header, so it cannot adapt
    //  per chunk; propose from a representative payload size.
    let method = compression.unwrap_or_else(|| compression::propose_compression(5000));

    let mut head = BytesMut::with_capacity(1 + StreamHead::SERIALIZED_LEN);
    head.extend_from_slice(&[FrameType::Stream.as_u8()]);
    StreamHead {
        handler_id,
        message_id,
        send_time: now_millis(),
        data_type: data_type.as_u8(),
        compression: method.as_u8(),
    }
    .ser(&mut head);
    writer.write_all(&head).await?;

    // First chunk: header JSON and separator in the clear, then the
    //  compressed (empty) payload part.
    let mut first_chunk = headers.encode()?;
    first_chunk.extend_from_slice(HEADER_SEPARATOR);
    let (empty, _) = compression::compress(b"", Some(method))?;
    first_chunk.extend_from_slice(&empty);
    write_chunk(writer, &first_chunk).await?;

    while let Some(chunk) = source.next_chunk().await {
        if chunk.is_empty() {
            continue;
        }
        let (compressed, _) = compression::compress(&chunk, Some(method))?;
        if compressed.len() >= u32::MAX as usize {
            return Err(CatsError::protocol("stream chunk exceeds the chunk size limit"));
        }
        write_chunk(writer, &compressed).await?;
    }

    writer.write_all(&0u32.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(status)
}

async fn write_chunk<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    chunk: &[u8],
) -> Result<(), CatsError> {
    writer.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
    writer.write_paced(chunk).await
}

/// Serializes and sends a 0x02 frame (an input prompt, or the answer to
///  one on the client side of the exchange).
pub(crate) async fn send_input_response<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    response: InputResponse,
) -> Result<(), CatsError> {
    let InputResponse {
        message_id,
        data,
        mut headers,
        compression,
    } = response;

    let (body, data_type, method) = prepare_body(data, &mut headers, compression).await?;
    let mut message_headers = headers.encode()?;
    message_headers.extend_from_slice(HEADER_SEPARATOR);

    let mut head = BytesMut::with_capacity(1 + InputHead::SERIALIZED_LEN);
    head.extend_from_slice(&[FrameType::Input.as_u8()]);
    InputHead {
        message_id,
        data_type: data_type.as_u8(),
        compression: method.as_u8(),
        data_len: body.len() as u32 + message_headers.len() as u32,
    }
    .ser(&mut head);

    writer.write_all(&head).await?;
    writer.write_all(&message_headers).await?;
    write_body(writer, &body).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn send_cancel_input<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    message_id: u16,
) -> Result<(), CatsError> {
    let mut buf = [0u8; 3];
    buf[0] = FrameType::CancelInput.as_u8();
    buf[1..].copy_from_slice(&message_id.to_be_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await
}

pub(crate) async fn send_download_speed<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    speed: u32,
) -> Result<(), CatsError> {
    let mut buf = [0u8; 5];
    buf[0] = FrameType::DownloadSpeed.as_u8();
    buf[1..].copy_from_slice(&speed.to_be_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Sends a 0xFF frame. Used both for the keepalive loop (with the current
///  time) and for echoing a received ping verbatim.
pub(crate) async fn send_ping<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    send_time: u64,
) -> Result<(), CatsError> {
    let mut buf = [0u8; 9];
    buf[0] = FrameType::Ping.as_u8();
    buf[1..].copy_from_slice(&send_time.to_be_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await
}

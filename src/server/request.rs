use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::trace;

use crate::codecs::{self, Data, DataType, Payload, PayloadSource};
use crate::compression::{self, Compression};
use crate::config::ServerConfig;
use crate::error::CatsError;
use crate::headers::Headers;
use crate::server::conn::Connection;
use crate::wire::stream::FrameReader;
use crate::wire::{FrameType, InputHead, RequestHead, StreamHead, HEADER_SEPARATOR};

/// A decoded top-level request (frame types 0x00 and 0x01 both end up
///  here - they differ only in transport shape, not in meaning).
pub struct Request {
    pub handler_id: u16,
    pub message_id: u16,
    /// sender clock at send time, ms UTC
    pub send_time: u64,
    pub data_type: DataType,
    pub compression: Compression,
    pub headers: Headers,
    pub payload: Payload,
    conn: Arc<Connection>,
}

impl Request {
    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn status(&self) -> u16 {
        self.headers.status()
    }

    /// Asks the peer for more data in the middle of handling this request.
    ///  Suspends until the peer answers with a matching 0x02 frame, the
    ///  peer cancels with 0x06, or the input timeout elapses.
    pub async fn input(&self, data: Data) -> Result<InputRequest, CatsError> {
        self.input_with(InputPrompt::new(data)).await
    }

    pub async fn input_with(&self, prompt: InputPrompt) -> Result<InputRequest, CatsError> {
        self.conn.await_input(self.message_id, prompt).await
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Request(handler={}, message={}, type={})",
            self.handler_id,
            self.message_id,
            self.data_type.name()
        )
    }
}

/// Options for a nested input prompt.
pub struct InputPrompt {
    pub data: Data,
    pub headers: Headers,
    pub compression: Option<Compression>,
    /// Skip the concurrent-input limit check for this prompt.
    pub bypass_limit: bool,
    /// Do not count this prompt against the limit seen by other prompts.
    pub bypass_count: bool,
    /// Overrides the configured input timeout when set.
    pub timeout: Option<Duration>,
}

impl InputPrompt {
    pub fn new(data: Data) -> InputPrompt {
        InputPrompt {
            data,
            headers: Headers::new(),
            compression: None,
            bypass_limit: false,
            bypass_count: false,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> InputPrompt {
        self.timeout = Some(timeout);
        self
    }

    pub fn bypassing_count(mut self) -> InputPrompt {
        self.bypass_count = true;
        self
    }

    pub fn bypassing_limit(mut self) -> InputPrompt {
        self.bypass_limit = true;
        self
    }
}

/// A decoded 0x02 frame. On the server this is the peer's answer to a
///  pending input prompt; `answer`/`cancel` are the symmetric client-side
///  operations for reacting to a received prompt.
pub struct InputRequest {
    pub message_id: u16,
    pub data_type: DataType,
    pub compression: Compression,
    pub headers: Headers,
    pub payload: Payload,
    conn: Arc<Connection>,
}

impl InputRequest {
    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Answers the prompt, reusing its message id.
    pub async fn answer(&self, data: Data) -> Result<(), CatsError> {
        self.conn.send_input_answer(self.message_id, data).await
    }

    /// Declines the prompt with a 0x06 frame.
    pub async fn cancel(&self) -> Result<(), CatsError> {
        self.conn.send_cancel_input(self.message_id).await
    }
}

impl std::fmt::Debug for InputRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InputRequest(message={}, type={})",
            self.message_id,
            self.data_type.name()
        )
    }
}

/// One frame as routed by the connection's read loop.
#[derive(Debug)]
pub(crate) enum InboundFrame {
    Request(Request),
    StreamRequest(Request),
    InputAnswer(InputRequest),
    DownloadSpeed(u32),
    CancelInput(u16),
    Ping(u64),
}

/// Reads one frame. `Ok(None)` means the peer closed the connection at a
///  frame boundary, which is a clean shutdown.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    conn: &Arc<Connection>,
) -> Result<Option<InboundFrame>, CatsError> {
    let type_byte = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(CatsError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let frame = match FrameType::from_u8(type_byte)? {
        FrameType::Request => InboundFrame::Request(read_request(reader, conn).await?),
        FrameType::Stream => InboundFrame::StreamRequest(read_stream_request(reader, conn).await?),
        FrameType::Input => InboundFrame::InputAnswer(read_input(reader, conn).await?),
        FrameType::DownloadSpeed => InboundFrame::DownloadSpeed(reader.read_u32().await?),
        FrameType::CancelInput => InboundFrame::CancelInput(reader.read_u16().await?),
        FrameType::Ping => InboundFrame::Ping(reader.read_u64().await?),
    };
    trace!("received {:?}", frame);
    Ok(Some(frame))
}

async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    conn: &Arc<Connection>,
) -> Result<Request, CatsError> {
    let buf = reader.read_exact(RequestHead::SERIALIZED_LEN).await?;
    let head = RequestHead::try_deser(&mut buf.as_slice())
        .map_err(|e| CatsError::protocol(format!("malformed request header: {}", e)))?;

    let (headers, payload, data_type, method) = recv_body(
        reader,
        conn.config(),
        head.data_type,
        head.compression,
        head.data_len,
    )
    .await?;

    Ok(Request {
        handler_id: head.handler_id,
        message_id: head.message_id,
        send_time: head.send_time,
        data_type,
        compression: method,
        headers,
        payload,
        conn: conn.clone(),
    })
}

async fn read_stream_request<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    conn: &Arc<Connection>,
) -> Result<Request, CatsError> {
    let buf = reader.read_exact(StreamHead::SERIALIZED_LEN).await?;
    let head = StreamHead::try_deser(&mut buf.as_slice())
        .map_err(|e| CatsError::protocol(format!("malformed stream header: {}", e)))?;

    let (headers, payload, data_type, method) =
        recv_stream_body(reader, conn.config(), head.data_type, head.compression).await?;

    Ok(Request {
        handler_id: head.handler_id,
        message_id: head.message_id,
        send_time: head.send_time,
        data_type,
        compression: method,
        headers,
        payload,
        conn: conn.clone(),
    })
}

async fn read_input<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    conn: &Arc<Connection>,
) -> Result<InputRequest, CatsError> {
    let buf = reader.read_exact(InputHead::SERIALIZED_LEN).await?;
    let head = InputHead::try_deser(&mut buf.as_slice())
        .map_err(|e| CatsError::protocol(format!("malformed input header: {}", e)))?;

    let (headers, payload, data_type, method) = recv_body(
        reader,
        conn.config(),
        head.data_type,
        head.compression,
        head.data_len,
    )
    .await?;

    Ok(InputRequest {
        message_id: head.message_id,
        data_type,
        compression: method,
        headers,
        payload,
        conn: conn.clone(),
    })
}

/// Receives the body of a fixed-length frame: message headers up to the
///  separator, then `data_len - len(headers)` payload bytes, decompressed
///  and decoded. Payloads above the plain-data limit are spooled to disk
///  and must be of the file type.
async fn recv_body<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    config: &ServerConfig,
    data_type: u8,
    compression: u8,
    data_len: u32,
) -> Result<(Headers, Payload, DataType, Compression), CatsError> {
    let data_type = DataType::from_u8(data_type)?;
    let method = Compression::from_u8(compression)?;

    let raw_headers = reader.read_until_separator(data_len as usize).await?;
    let mut headers = Headers::decode(&raw_headers[..raw_headers.len() - 2])?;
    let payload_len = data_len as usize - raw_headers.len();

    let source = if payload_len > config.max_plain_data_size {
        if data_type != DataType::Files {
            return Err(CatsError::protocol(format!(
                "attempted to send a {} message larger than {} bytes",
                data_type.name(),
                config.max_plain_data_size
            )));
        }
        spool_and_decompress(reader, payload_len, method).await?
    } else {
        let buf = reader.read_exact(payload_len).await?;
        let limit = match data_type {
            DataType::Files => None,
            _ => Some(config.max_plain_data_size),
        };
        PayloadSource::Buf(compression::decompress(&buf, method, limit)?)
    };

    let payload = codecs::decode(source, data_type, &mut headers).await?;
    Ok((headers, payload, data_type, method))
}

/// Receives a chunked stream body. The first chunk carries the message
///  headers in the clear followed by the compressed first payload part;
///  every other chunk is compressed payload. Payload bytes are spooled to
///  disk while the stream is open so memory stays bounded.
async fn recv_stream_body<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    config: &ServerConfig,
    data_type: u8,
    compression: u8,
) -> Result<(Headers, Payload, DataType, Compression), CatsError> {
    let data_type = DataType::from_u8(data_type)?;
    let method = Compression::from_u8(compression)?;

    let spool = NamedTempFile::new()?.into_temp_path();
    let mut out = tokio::fs::File::create(&spool).await?;
    let mut headers: Option<Headers> = None;
    let mut total = 0u64;

    loop {
        let chunk_len = reader.read_u32().await? as usize;
        if chunk_len == 0 {
            break;
        }

        if headers.is_none() {
            let buf = reader.read_exact(chunk_len).await?;
            let sep = buf
                .windows(2)
                .position(|w| w == HEADER_SEPARATOR)
                .ok_or_else(|| {
                    CatsError::protocol("first stream chunk lacks the header separator")
                })?;
            headers = Some(Headers::decode(&buf[..sep])?);
            let part = compression::decompress(&buf[sep + 2..], method, None)?;
            out.write_all(&part).await?;
            total += part.len() as u64;
        } else if chunk_len > config.max_plain_data_size {
            total += recv_large_chunk(reader, &mut out, chunk_len, method).await?;
        } else {
            let buf = reader.read_exact(chunk_len).await?;
            let part = compression::decompress(&buf, method, None)?;
            out.write_all(&part).await?;
            total += part.len() as u64;
        }
    }

    let mut headers =
        headers.ok_or_else(|| CatsError::protocol("stream frame carried no header chunk"))?;
    out.flush().await?;
    drop(out);

    let source = if total > config.max_plain_data_size as u64 {
        if data_type != DataType::Files {
            return Err(CatsError::protocol(format!(
                "attempted to send a {} message larger than {} bytes",
                data_type.name(),
                config.max_plain_data_size
            )));
        }
        PayloadSource::Spooled {
            path: spool,
            len: total,
        }
    } else {
        PayloadSource::Buf(tokio::fs::read(&spool).await?)
    };

    let payload = codecs::decode(source, data_type, &mut headers).await?;
    Ok((headers, payload, data_type, method))
}

/// Spools one oversized compressed chunk to disk, decompresses it, and
///  appends the result to the stream spool. Returns the inflated length.
async fn recv_large_chunk<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    out: &mut tokio::fs::File,
    chunk_len: usize,
    method: Compression,
) -> Result<u64, CatsError> {
    let packed = spool_payload(reader, chunk_len).await?;
    let unpacked = NamedTempFile::new()?.into_temp_path();
    compression::decompress_file(packed.to_path_buf(), unpacked.to_path_buf(), method).await?;

    let mut fh = tokio::fs::File::open(&unpacked).await?;
    let copied = tokio::io::copy(&mut fh, out).await?;
    Ok(copied)
}

/// Reads `payload_len` compressed bytes to a temp file and decompresses
///  them into a second one, which is returned.
async fn spool_and_decompress<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    payload_len: usize,
    method: Compression,
) -> Result<PayloadSource, CatsError> {
    let packed = spool_payload(reader, payload_len).await?;
    let unpacked = NamedTempFile::new()?.into_temp_path();
    compression::decompress_file(packed.to_path_buf(), unpacked.to_path_buf(), method).await?;
    let len = std::fs::metadata(&unpacked)?.len();
    Ok(PayloadSource::Spooled {
        path: unpacked,
        len,
    })
}

async fn spool_payload<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    payload_len: usize,
) -> Result<tempfile::TempPath, CatsError> {
    let spool = NamedTempFile::new()?.into_temp_path();
    let mut fh = tokio::fs::File::create(&spool).await?;
    let mut buf = vec![0u8; 1 << 20];
    let mut left = payload_len;
    while left > 0 {
        let want = buf.len().min(left);
        let n = reader.read_some(&mut buf[..want]).await?;
        if n == 0 {
            return Err(CatsError::protocol("stream ended in the middle of a payload"));
        }
        fh.write_all(&buf[..n]).await?;
        left -= n;
    }
    fh.flush().await?;
    Ok(spool)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::AsyncWriteExt as _;

    use super::*;
    use crate::server::conn::test_support::test_connection;

    fn fixed_frame(type_byte: u8, head: &[u8], headers_json: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![type_byte];
        frame.extend_from_slice(head);
        frame.extend_from_slice(headers_json);
        frame.extend_from_slice(HEADER_SEPARATOR);
        frame.extend_from_slice(payload);
        frame
    }

    fn request_frame(headers_json: &[u8], payload: &[u8], compression: u8) -> Vec<u8> {
        let mut head = bytes::BytesMut::new();
        RequestHead {
            handler_id: 2,
            message_id: 77,
            send_time: 1_608_552_317_314,
            data_type: 0x01,
            compression,
            data_len: (headers_json.len() + 2 + payload.len()) as u32,
        }
        .ser(&mut head);
        fixed_frame(0x00, &head, headers_json, payload)
    }

    #[tokio::test]
    async fn test_read_plain_json_request() {
        let (conn, mut peer, mut reader) = test_connection(1);

        peer.write_all(&request_frame(b"{}", br#"{"access_token":"abcdef"}"#, 0x00))
            .await
            .unwrap();

        let frame = read_frame(&mut reader, &conn).await.unwrap().unwrap();
        let InboundFrame::Request(request) = frame else {
            panic!("expected a request frame");
        };
        assert_eq!(request.handler_id, 2);
        assert_eq!(request.message_id, 77);
        assert_eq!(request.send_time, 1_608_552_317_314);
        assert_eq!(request.data_type, DataType::Json);
        assert_eq!(request.status(), 200);
        assert_eq!(
            request.payload.as_json().unwrap(),
            &json!({"access_token": "abcdef"})
        );
    }

    #[tokio::test]
    async fn test_read_gzip_request() {
        let (conn, mut peer, mut reader) = test_connection(1);

        let payload = json!({"blob": "a".repeat(10_000)});
        let plain = serde_json::to_vec(&payload).unwrap();
        let (packed, _) = compression::compress(&plain, Some(Compression::Gzip)).unwrap();
        peer.write_all(&request_frame(b"{}", &packed, 0x01))
            .await
            .unwrap();

        let frame = read_frame(&mut reader, &conn).await.unwrap().unwrap();
        let InboundFrame::Request(request) = frame else {
            panic!("expected a request frame");
        };
        assert_eq!(request.compression, Compression::Gzip);
        assert_eq!(request.payload.as_json().unwrap(), &payload);
    }

    #[tokio::test]
    async fn test_offset_header_trims_the_payload() {
        let (conn, mut peer, mut reader) = test_connection(1);

        let headers_json = br#"{"Offset": 4}"#;
        let payload = b"0123456789";
        let mut head = bytes::BytesMut::new();
        RequestHead {
            handler_id: 0,
            message_id: 1,
            send_time: 0,
            data_type: 0x00,
            compression: 0x00,
            data_len: (headers_json.len() + 2 + payload.len()) as u32,
        }
        .ser(&mut head);
        peer.write_all(&fixed_frame(0x00, &head, headers_json, payload))
            .await
            .unwrap();

        let frame = read_frame(&mut reader, &conn).await.unwrap().unwrap();
        let InboundFrame::Request(request) = frame else {
            panic!("expected a request frame");
        };
        assert_eq!(request.payload.as_bytes().unwrap(), b"456789");
    }

    #[tokio::test]
    async fn test_read_stream_request() {
        let (conn, mut peer, mut reader) = test_connection(1);

        let mut frame = vec![0x01u8];
        let mut head = bytes::BytesMut::new();
        StreamHead {
            handler_id: 9,
            message_id: 3,
            send_time: 5,
            data_type: 0x00,
            compression: 0x01,
        }
        .ser(&mut head);
        frame.extend_from_slice(&head);

        // First chunk: headers in the clear plus the gzipped first piece.
        let mut first = b"{}".to_vec();
        first.extend_from_slice(HEADER_SEPARATOR);
        let (packed, _) = compression::compress(b"hel", Some(Compression::Gzip)).unwrap();
        first.extend_from_slice(&packed);
        frame.extend_from_slice(&(first.len() as u32).to_be_bytes());
        frame.extend_from_slice(&first);

        for piece in [b"lo wo".as_slice(), b"rld!".as_slice()] {
            let (packed, _) = compression::compress(piece, Some(Compression::Gzip)).unwrap();
            frame.extend_from_slice(&(packed.len() as u32).to_be_bytes());
            frame.extend_from_slice(&packed);
        }
        frame.extend_from_slice(&0u32.to_be_bytes());

        peer.write_all(&frame).await.unwrap();

        let parsed = read_frame(&mut reader, &conn).await.unwrap().unwrap();
        let InboundFrame::StreamRequest(request) = parsed else {
            panic!("expected a stream request frame");
        };
        assert_eq!(request.handler_id, 9);
        assert_eq!(request.payload.as_bytes().unwrap(), b"hello world!");
    }

    #[tokio::test]
    async fn test_stream_first_chunk_must_carry_headers() {
        let (conn, mut peer, mut reader) = test_connection(1);

        let mut frame = vec![0x01u8];
        let mut head = bytes::BytesMut::new();
        StreamHead {
            handler_id: 9,
            message_id: 3,
            send_time: 5,
            data_type: 0x00,
            compression: 0x00,
        }
        .ser(&mut head);
        frame.extend_from_slice(&head);
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(b"data");
        frame.extend_from_slice(&0u32.to_be_bytes());
        peer.write_all(&frame).await.unwrap();

        let err = read_frame(&mut reader, &conn).await.unwrap_err();
        assert!(matches!(err, CatsError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversize_non_file_payload_is_rejected() {
        let (conn, mut peer, mut reader) = test_connection(1);

        // data_len declares more than the plain-data limit for a binary
        //  payload; the reader must bail before consuming the body.
        let mut head = bytes::BytesMut::new();
        RequestHead {
            handler_id: 0,
            message_id: 1,
            send_time: 0,
            data_type: 0x00,
            compression: 0x00,
            data_len: (conn.config().max_plain_data_size + 100) as u32,
        }
        .ser(&mut head);
        let mut frame = vec![0x00u8];
        frame.extend_from_slice(&head);
        frame.extend_from_slice(b"{}");
        frame.extend_from_slice(HEADER_SEPARATOR);
        peer.write_all(&frame).await.unwrap();

        let err = read_frame(&mut reader, &conn).await.unwrap_err();
        assert!(matches!(err, CatsError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unknown_frame_type_is_rejected() {
        let (conn, mut peer, mut reader) = test_connection(1);
        peer.write_all(&[0x42]).await.unwrap();

        let err = read_frame(&mut reader, &conn).await.unwrap_err();
        assert!(matches!(err, CatsError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_clean_eof_at_frame_boundary() {
        let (conn, peer, mut reader) = test_connection(1);
        drop(peer);

        assert!(read_frame(&mut reader, &conn).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_control_frames_parse() {
        let (conn, mut peer, mut reader) = test_connection(1);

        peer.write_all(b"\x05\x00\x00\x04\x00").await.unwrap();
        peer.write_all(b"\x06\x02\x58").await.unwrap();
        peer.write_all(b"\xff\x00\x00\x00\x00\x00\x00\x00\x2a")
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut reader, &conn).await.unwrap().unwrap(),
            InboundFrame::DownloadSpeed(1024)
        ));
        assert!(matches!(
            read_frame(&mut reader, &conn).await.unwrap().unwrap(),
            InboundFrame::CancelInput(600)
        ));
        assert!(matches!(
            read_frame(&mut reader, &conn).await.unwrap().unwrap(),
            InboundFrame::Ping(42)
        ));
    }

    #[tokio::test]
    async fn test_read_input_answer() {
        let (conn, mut peer, mut reader) = test_connection(1);

        let payload = br#"{"code":"1234"}"#;
        let mut head = bytes::BytesMut::new();
        InputHead {
            message_id: 600,
            data_type: 0x01,
            compression: 0x00,
            data_len: (2 + 2 + payload.len()) as u32,
        }
        .ser(&mut head);
        peer.write_all(&fixed_frame(0x02, &head, b"{}", payload))
            .await
            .unwrap();

        let frame = read_frame(&mut reader, &conn).await.unwrap().unwrap();
        let InboundFrame::InputAnswer(answer) = frame else {
            panic!("expected an input answer");
        };
        assert_eq!(answer.message_id, 600);
        assert_eq!(answer.payload.as_json().unwrap(), &json!({"code": "1234"}));
    }

    #[tokio::test]
    async fn test_headers_must_fit_in_declared_length() {
        let (conn, mut peer, mut reader) = test_connection(1);

        // data_len says 4 bytes but the separator never arrives in them.
        let mut head = bytes::BytesMut::new();
        RequestHead {
            handler_id: 0,
            message_id: 1,
            send_time: 0,
            data_type: 0x01,
            compression: 0x00,
            data_len: 4,
        }
        .ser(&mut head);
        let mut frame = vec![0x00u8];
        frame.extend_from_slice(&head);
        frame.extend_from_slice(b"{\"aaaaaa");
        peer.write_all(&frame).await.unwrap();

        let err = read_frame(&mut reader, &conn).await.unwrap_err();
        assert!(matches!(err, CatsError::Protocol(_)));
    }
}

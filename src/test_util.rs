//! A raw wire-level client for exercising the server over in-memory
//!  transports. Speaks the protocol byte by byte on purpose, so tests
//!  assert the exact frames the server emits.

use serde_json::Value;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use crate::compression::{self, Compression};
use crate::error::CatsError;
use crate::headers::Headers;
use crate::util::now_millis;
use crate::wire::stream::{FrameReader, FrameWriter};
use crate::wire::{FrameType, InputHead, RequestHead, StreamHead, HEADER_SEPARATOR};

pub(crate) struct TestClient {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

pub(crate) struct ResponseFrame {
    pub head: RequestHead,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

pub(crate) struct InputFrame {
    pub head: InputHead,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

pub(crate) struct StreamFrame {
    pub head: StreamHead,
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub chunk_count: usize,
}

impl TestClient {
    pub fn new(stream: DuplexStream) -> TestClient {
        let (rx, tx) = tokio::io::split(stream);
        TestClient {
            reader: FrameReader::new(rx),
            writer: FrameWriter::new(tx, 0),
        }
    }

    /// The connect phase: api version out, server clock back.
    pub async fn connect(&mut self, api_version: u32) -> u64 {
        self.writer
            .write_all(&api_version.to_be_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
        self.reader.read_u64().await.unwrap()
    }

    pub async fn send_handshake_digest(&mut self, digest: &str) -> u8 {
        self.writer.write_all(digest.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
        self.reader.read_u8().await.unwrap()
    }

    pub async fn send_json_request(&mut self, handler_id: u16, message_id: u16, value: Value) {
        let payload = serde_json::to_vec(&value).unwrap();
        self.send_request_raw(handler_id, message_id, 0x01, 0x00, b"{}", &payload)
            .await;
    }

    pub async fn send_request_raw(
        &mut self,
        handler_id: u16,
        message_id: u16,
        data_type: u8,
        compression: u8,
        headers_json: &[u8],
        payload: &[u8],
    ) {
        let mut body = headers_json.to_vec();
        body.extend_from_slice(HEADER_SEPARATOR);
        body.extend_from_slice(payload);

        let mut frame = vec![FrameType::Request.as_u8()];
        RequestHead {
            handler_id,
            message_id,
            send_time: now_millis(),
            data_type,
            compression,
            data_len: body.len() as u32,
        }
        .ser(&mut frame);
        frame.extend_from_slice(&body);

        self.writer.write_all(&frame).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn answer_input(&mut self, message_id: u16, value: Value) {
        let payload = serde_json::to_vec(&value).unwrap();
        let mut body = b"{}".to_vec();
        body.extend_from_slice(HEADER_SEPARATOR);
        body.extend_from_slice(&payload);

        let mut frame = vec![FrameType::Input.as_u8()];
        InputHead {
            message_id,
            data_type: 0x01,
            compression: 0x00,
            data_len: body.len() as u32,
        }
        .ser(&mut frame);
        frame.extend_from_slice(&body);

        self.writer.write_all(&frame).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn cancel_input(&mut self, message_id: u16) {
        let mut frame = vec![FrameType::CancelInput.as_u8()];
        frame.extend_from_slice(&message_id.to_be_bytes());
        self.writer.write_all(&frame).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn set_download_speed(&mut self, speed: u32) {
        let mut frame = vec![FrameType::DownloadSpeed.as_u8()];
        frame.extend_from_slice(&speed.to_be_bytes());
        self.writer.write_all(&frame).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Sends a ping and returns the echoed timestamp.
    pub async fn ping(&mut self, send_time: u64) -> u64 {
        let mut frame = vec![FrameType::Ping.as_u8()];
        frame.extend_from_slice(&send_time.to_be_bytes());
        self.writer.write_all(&frame).await.unwrap();
        self.writer.flush().await.unwrap();

        assert_eq!(self.reader.read_u8().await.unwrap(), FrameType::Ping.as_u8());
        self.reader.read_u64().await.unwrap()
    }

    /// Reads one 0x00 frame and returns its decompressed payload.
    pub async fn read_response(&mut self) -> ResponseFrame {
        let type_byte = self.reader.read_u8().await.unwrap();
        assert_eq!(type_byte, FrameType::Request.as_u8(), "expected a 0x00 frame");

        let buf = self.reader.read_exact(RequestHead::SERIALIZED_LEN).await.unwrap();
        let head = RequestHead::try_deser(&mut buf.as_slice()).unwrap();

        let body = self.reader.read_exact(head.data_len as usize).await.unwrap();
        let sep = body
            .windows(2)
            .position(|w| w == HEADER_SEPARATOR)
            .expect("response body must contain the header separator");
        let headers = Headers::decode(&body[..sep]).unwrap();
        let payload = compression::decompress(
            &body[sep + 2..],
            Compression::from_u8(head.compression).unwrap(),
            None,
        )
        .unwrap();

        ResponseFrame {
            head,
            headers,
            payload,
        }
    }

    /// Reads one 0x02 frame (an input prompt from the server).
    pub async fn read_input_prompt(&mut self) -> InputFrame {
        let type_byte = self.reader.read_u8().await.unwrap();
        assert_eq!(type_byte, FrameType::Input.as_u8(), "expected a 0x02 frame");

        let buf = self.reader.read_exact(InputHead::SERIALIZED_LEN).await.unwrap();
        let head = InputHead::try_deser(&mut buf.as_slice()).unwrap();

        let body = self.reader.read_exact(head.data_len as usize).await.unwrap();
        let sep = body
            .windows(2)
            .position(|w| w == HEADER_SEPARATOR)
            .expect("input body must contain the header separator");
        let headers = Headers::decode(&body[..sep]).unwrap();
        let payload = compression::decompress(
            &body[sep + 2..],
            Compression::from_u8(head.compression).unwrap(),
            None,
        )
        .unwrap();

        InputFrame {
            head,
            headers,
            payload,
        }
    }

    /// Reads one 0x01 frame, walking the chunk sequence to the terminator
    ///  and reassembling the payload.
    pub async fn read_stream_response(&mut self) -> StreamFrame {
        let type_byte = self.reader.read_u8().await.unwrap();
        assert_eq!(type_byte, FrameType::Stream.as_u8(), "expected a 0x01 frame");

        let buf = self.reader.read_exact(StreamHead::SERIALIZED_LEN).await.unwrap();
        let head = StreamHead::try_deser(&mut buf.as_slice()).unwrap();
        let method = Compression::from_u8(head.compression).unwrap();

        let mut headers = None;
        let mut payload = Vec::new();
        let mut chunk_count = 0;
        loop {
            let chunk_len = self.reader.read_u32().await.unwrap() as usize;
            if chunk_len == 0 {
                break;
            }
            chunk_count += 1;
            let chunk = self.reader.read_exact(chunk_len).await.unwrap();
            if headers.is_none() {
                let sep = chunk
                    .windows(2)
                    .position(|w| w == HEADER_SEPARATOR)
                    .expect("first stream chunk must contain the header separator");
                headers = Some(Headers::decode(&chunk[..sep]).unwrap());
                payload.extend(compression::decompress(&chunk[sep + 2..], method, None).unwrap());
            } else {
                payload.extend(compression::decompress(&chunk, method, None).unwrap());
            }
        }

        StreamFrame {
            head,
            headers: headers.expect("stream frame carried no header chunk"),
            payload,
            chunk_count,
        }
    }

    pub async fn read_raw_u8(&mut self) -> u8 {
        self.reader.read_u8().await.unwrap()
    }

    /// True once the server has shut the stream down.
    pub async fn expect_eof(&mut self) -> bool {
        matches!(
            self.reader.read_u8().await,
            Err(CatsError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof
        )
    }
}

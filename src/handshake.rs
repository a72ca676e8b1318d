use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::CatsError;
use crate::util::now_secs;
use crate::wire::stream::{FrameReader, FrameWriter};

/// Byte-level access to the connection during the handshake phase, before
///  the message loop starts. Decouples handshake implementations from the
///  concrete stream type.
#[async_trait]
pub trait HandshakeIo: Send {
    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, CatsError>;
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), CatsError>;
}

/// Adapter over the connection's reader/writer halves, used by the server
///  while it still owns both exclusively.
pub struct HandshakeStream<'a, R, W> {
    pub reader: &'a mut FrameReader<R>,
    pub writer: &'a mut FrameWriter<W>,
}

#[async_trait]
impl<R, W> HandshakeIo for HandshakeStream<'_, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, CatsError> {
        self.reader.read_exact(n).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), CatsError> {
        self.writer.write_all(buf).await?;
        self.writer.flush().await
    }
}

/// A pre-exchange challenge, run after the connect phase and before the
///  message loop. Failure closes the connection.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn validate(&self, io: &mut (dyn HandshakeIo + '_)) -> Result<(), CatsError>;
}

/// Shared-secret handshake: the peer sends the lowercase hex SHA-256 of the
///  secret concatenated with the current 10-second time bucket, rendered as
///  ASCII decimal. A window of adjacent buckets is accepted to absorb clock
///  drift. The server answers a single byte: 0x01 accept, 0x00 reject.
pub struct Sha256TimeHandshake {
    secret_key: Vec<u8>,
    valid_window: u32,
    timeout: Duration,
}

impl Sha256TimeHandshake {
    pub fn new(secret_key: Vec<u8>, valid_window: u32, timeout: Duration) -> Sha256TimeHandshake {
        assert!(!secret_key.is_empty(), "handshake secret must not be empty");
        Sha256TimeHandshake {
            secret_key,
            valid_window: valid_window.max(1),
            timeout,
        }
    }

    fn digest_for_bucket(&self, bucket: i64) -> String {
        let mut sha256 = Sha256::new();
        sha256.update(&self.secret_key);
        sha256.update(bucket.to_string().as_bytes());
        let digest = sha256.finalize();

        let mut hex = String::with_capacity(64);
        for byte in digest {
            write!(hex, "{:02x}", byte).expect("writing to a String cannot fail");
        }
        hex
    }

    /// All digests acceptable right now, one per bucket in the window.
    pub fn valid_digests(&self) -> Vec<String> {
        let bucket = (now_secs() / 10 * 10) as i64;
        let window = self.valid_window as i64;
        (-window..=window)
            .map(|k| self.digest_for_bucket(bucket + k * 10))
            .collect()
    }

    /// The digest a connecting client should send right now.
    pub fn current_digest(&self) -> String {
        self.digest_for_bucket((now_secs() / 10 * 10) as i64)
    }
}

#[async_trait]
impl Handshake for Sha256TimeHandshake {
    async fn validate(&self, io: &mut (dyn HandshakeIo + '_)) -> Result<(), CatsError> {
        let result = tokio::time::timeout(self.timeout, async {
            let received = io.read_exact(64).await?;
            let received = String::from_utf8_lossy(&received).into_owned();

            if self.valid_digests().contains(&received) {
                io.write_all(&[0x01]).await?;
                Ok(())
            } else {
                debug!("handshake digest mismatch: {:?}", received);
                io.write_all(&[0x00]).await?;
                Err(CatsError::Handshake(format!(
                    "digest mismatch: {:?}",
                    received
                )))
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(CatsError::Handshake("handshake timed out".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn handshake() -> Sha256TimeHandshake {
        Sha256TimeHandshake::new(b"secret_key".to_vec(), 1, Duration::from_secs(5))
    }

    async fn run_validate(send: Vec<u8>) -> (Result<(), CatsError>, Vec<u8>) {
        let (client, server) = duplex(256);
        let (server_rx, server_tx) = tokio::io::split(server);
        let mut reader = FrameReader::new(server_rx);
        let mut writer = FrameWriter::new(server_tx, 0);

        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let client_task = tokio::spawn(async move {
            client_tx.write_all(&send).await.unwrap();
            let mut reply = Vec::new();
            let _ = client_rx.read_to_end(&mut reply).await;
            reply
        });

        let result = {
            let mut io = HandshakeStream {
                reader: &mut reader,
                writer: &mut writer,
            };
            handshake().validate(&mut io).await
        };
        drop(reader);
        drop(writer);
        let reply = client_task.await.unwrap();
        (result, reply)
    }

    #[tokio::test]
    async fn test_current_digest_is_accepted() {
        let digest = handshake().current_digest();
        assert_eq!(digest.len(), 64);
        let (result, reply) = run_validate(digest.into_bytes()).await;
        assert!(result.is_ok());
        assert_eq!(reply, vec![0x01]);
    }

    #[tokio::test]
    async fn test_adjacent_buckets_are_accepted() {
        let hs = handshake();
        for digest in hs.valid_digests() {
            let (result, reply) = run_validate(digest.into_bytes()).await;
            assert!(result.is_ok());
            assert_eq!(reply, vec![0x01]);
        }
    }

    #[tokio::test]
    async fn test_wrong_digest_is_rejected() {
        let (result, reply) = run_validate(vec![b'0'; 64]).await;
        assert!(matches!(result, Err(CatsError::Handshake(_))));
        assert_eq!(reply, vec![0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (client, server) = duplex(256);
        let (server_rx, server_tx) = tokio::io::split(server);
        let mut reader = FrameReader::new(server_rx);
        let mut writer = FrameWriter::new(server_tx, 0);

        let mut io = HandshakeStream {
            reader: &mut reader,
            writer: &mut writer,
        };
        let result = handshake().validate(&mut io).await;
        assert!(matches!(result, Err(CatsError::Handshake(_))));
        drop(client);
    }

    #[test]
    fn test_digest_matches_reference_values() {
        // sha256(b"secret_key" + b"1700000000"), fixed bucket arithmetic.
        let hs = handshake();
        let digest = hs.digest_for_bucket(1_700_000_000);
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        // same bucket, same digest; neighboring bucket differs
        assert_eq!(digest, hs.digest_for_bucket(1_700_000_000));
        assert_ne!(digest, hs.digest_for_bucket(1_700_000_010));
    }

    #[test]
    fn test_window_is_at_least_one() {
        let hs = Sha256TimeHandshake::new(b"k".to_vec(), 0, Duration::from_secs(1));
        assert_eq!(hs.valid_digests().len(), 3);
    }
}

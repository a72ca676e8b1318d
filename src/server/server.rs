use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::CatsError;
use crate::events::Event;
use crate::handshake::HandshakeStream;
use crate::server::app::{Application, CHANNEL_ALL};
use crate::server::conn::{BoxedRead, BoxedWrite, Connection};
use crate::util::now_millis;
use crate::wire::stream::{FrameReader, FrameWriter};

/// The TCP acceptor. Each accepted socket gets its own task running the
///  connection lifecycle: connect phase, optional handshake, message loop.
pub struct Server {
    app: Arc<Application>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(app: Application, config: ServerConfig) -> Server {
        Server {
            app: Arc::new(app),
            config: Arc::new(config),
        }
    }

    pub fn app(&self) -> &Arc<Application> {
        &self.app
    }

    /// Binds and runs the accept loop until the listener fails. Fires
    ///  SERVER_START once the listener is bound.
    pub async fn listen(self: &Arc<Self>, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run(listener).await
    }

    pub async fn run(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("listening on {}", listener.local_addr()?);
        self.app.events().emit(Event::ServerStart).await;

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_stream(stream, peer).await;
            });
        }
    }

    /// Runs one connection over any byte stream until it closes. Public so
    ///  tests and alternative acceptors can drive in-memory transports.
    pub async fn serve_stream<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rx, tx) = tokio::io::split(stream);
        let mut reader = FrameReader::new(Box::new(rx) as BoxedRead);
        reader.set_idle_timeout(self.config.idle_timeout);
        let writer = FrameWriter::new(Box::new(tx) as BoxedWrite, self.config.default_download_speed);

        match self.init_connection(reader, writer, peer).await {
            Ok((conn, mut reader)) => {
                if let Some(interval) = self.config.ping_interval {
                    conn.set_ping_task(spawn_ping_loop(&conn, interval));
                }
                let cause = conn.run(&mut reader).await;
                conn.close(cause).await;
            }
            Err(e) => {
                debug!("connection from {} dropped during setup: {}", peer, e);
            }
        }
    }

    /// The connect phase and handshake: reads the peer's api version,
    ///  answers with the server clock, runs the configured handshake, and
    ///  only then admits the connection into the application.
    async fn init_connection(
        &self,
        mut reader: FrameReader<BoxedRead>,
        mut writer: FrameWriter<BoxedWrite>,
        peer: SocketAddr,
    ) -> Result<(Arc<Connection>, FrameReader<BoxedRead>), CatsError> {
        let api_version = reader.read_u32().await?;
        writer.write_all(&now_millis().to_be_bytes()).await?;
        writer.flush().await?;

        let conn = Arc::new(Connection::new(
            self.app.clone(),
            self.config.clone(),
            writer,
            peer,
            api_version,
        ));
        self.app.register_conn(&conn);
        self.app.events().emit(Event::ConnStart(conn.clone())).await;

        if let Some(handshake) = &self.config.handshake {
            let result = {
                let mut writer = conn.writer_for_handshake().await;
                let mut io = HandshakeStream {
                    reader: &mut reader,
                    writer: &mut *writer,
                };
                handshake.validate(&mut io).await
            };
            match result {
                Ok(()) => {
                    self.app.events().emit(Event::HandshakePass { peer }).await;
                }
                Err(e) => {
                    warn!("handshake with {} failed: {}", peer, e);
                    self.app
                        .events()
                        .emit(Event::HandshakeFail {
                            peer,
                            error: e.to_string(),
                        })
                        .await;
                    conn.close(Some(e.to_string())).await;
                    return Err(e);
                }
            }
        }

        conn.attach_to_channel(CHANNEL_ALL);
        Ok((conn, reader))
    }

    /// Fires SERVER_CLOSE and closes every connection. The accept loop, if
    ///  running, is expected to be aborted by the caller.
    pub async fn shutdown(&self, error: Option<String>) {
        info!("shutting down, {} connections open", self.app.connections().len());
        self.app
            .events()
            .emit(Event::ServerClose {
                error: error.clone(),
            })
            .await;
        for conn in self.app.connections() {
            conn.close(error.clone()).await;
        }
        self.app.clear_all_channels();
    }
}

/// Emits a ping every `interval` until the connection closes. The interval
///  must stay below the idle timeout so a quiet but healthy peer keeps
///  producing inbound pong frames.
fn spawn_ping_loop(conn: &Arc<Connection>, interval: Duration) -> JoinHandle<()> {
    let conn = conn.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if !conn.is_open() {
                return;
            }
            if let Err(e) = conn.ping().await {
                conn.request_close(Some(e.to_string()));
                return;
            }
        }
    })
}

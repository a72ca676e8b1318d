use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codecs::{Data, DataType};
use crate::config::{ServerConfig, DOWNLOAD_SPEED_RANGE};
use crate::error::CatsError;
use crate::events::{ErrorContext, Event};
use crate::identity::{identity_channel, model_channel, Identity};
use crate::server::app::Application;
use crate::server::request::{self, InboundFrame, InputPrompt, InputRequest, Request};
use crate::server::response::{
    self, ChunkSource, InputResponse, Reply, Response, StreamResponse,
};
use crate::util::now_millis;
use crate::wire::stream::{FrameReader, FrameWriter};

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Outbound-initiated exchanges draw their message ids from this range,
///  skipping ids already in flight.
const MESSAGE_ID_RANGE: std::ops::RangeInclusive<u16> = 17783..=35565;

struct PendingInput {
    tx: oneshot::Sender<Result<InputRequest, CatsError>>,
    bypass_count: bool,
}

/// The per-socket protocol engine. Owns the write half (behind the write
///  lock), the pending-inputs table, the free message-id pool and the
///  identity slot; the read half is driven by [Connection::run] from the
///  server's per-connection task.
pub struct Connection {
    peer: SocketAddr,
    api_version: u32,
    app: Arc<Application>,
    config: Arc<ServerConfig>,
    /// The write lock: every outbound frame is written while holding this,
    ///  so chunked sends stay contiguous on the wire.
    writer: Mutex<FrameWriter<BoxedWrite>>,
    identity: StdRwLock<Option<Arc<dyn Identity>>>,
    channels: StdMutex<FxHashSet<String>>,
    pending_inputs: StdMutex<FxHashMap<u16, PendingInput>>,
    reserved_ids: StdMutex<FxHashSet<u16>>,
    handler_task: StdMutex<Option<JoinHandle<()>>>,
    ping_task: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    shutdown: Notify,
    close_cause: StdMutex<Option<String>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CATS.Connection: {} api@{}", self.peer, self.api_version)
    }
}

impl Connection {
    pub(crate) fn new(
        app: Arc<Application>,
        config: Arc<ServerConfig>,
        writer: FrameWriter<BoxedWrite>,
        peer: SocketAddr,
        api_version: u32,
    ) -> Connection {
        debug!("new connection established: {} api@{}", peer, api_version);
        Connection {
            peer,
            api_version,
            app,
            config,
            writer: Mutex::new(writer),
            identity: StdRwLock::new(None),
            channels: StdMutex::new(Default::default()),
            pending_inputs: StdMutex::new(Default::default()),
            reserved_ids: StdMutex::new(Default::default()),
            handler_task: StdMutex::new(None),
            ping_task: StdMutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            close_cause: StdMutex::new(None),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn app(&self) -> &Arc<Application> {
        &self.app
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Asks the reader task to shut the connection down. Safe to call from
    ///  handler tasks and the ping loop; the actual teardown runs in the
    ///  server's connection task.
    pub(crate) fn request_close(&self, cause: Option<String>) {
        {
            let mut slot = self.close_cause.lock().unwrap();
            if slot.is_none() {
                *slot = cause;
            }
        }
        self.shutdown.notify_one();
    }

    /// The read loop: reads one frame at a time and routes it to the right
    ///  sink. Returns the close cause (`None` for a clean peer shutdown).
    pub(crate) async fn run(self: &Arc<Self>, reader: &mut FrameReader<BoxedRead>) -> Option<String> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    return self.close_cause.lock().unwrap().take();
                }
                frame = request::read_frame(reader, self) => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = self.dispatch(frame).await {
                        warn!("{:?}: {}", self, e);
                        return Some(e.to_string());
                    }
                }
                Ok(None) => return None,
                Err(e) => return Some(e.to_string()),
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: InboundFrame) -> Result<(), CatsError> {
        match frame {
            InboundFrame::Request(request) | InboundFrame::StreamRequest(request) => {
                self.spawn_handler(request)
            }
            InboundFrame::InputAnswer(answer) => self.resolve_input(answer),
            InboundFrame::DownloadSpeed(speed) => self.apply_download_speed(speed).await,
            InboundFrame::CancelInput(message_id) => {
                self.cancel_pending_input(message_id);
                Ok(())
            }
            InboundFrame::Ping(send_time) => {
                let mut writer = self.writer.lock().await;
                response::send_ping(&mut writer, send_time).await
            }
        }
    }

    /// At most one top-level exchange may be in flight per connection;
    ///  a second one while the handler task still runs is a protocol error.
    fn spawn_handler(self: &Arc<Self>, request: Request) -> Result<(), CatsError> {
        let mut slot = self.handler_task.lock().unwrap();
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                return Err(CatsError::protocol(
                    "received a top-level request while another is in flight",
                ));
            }
        }
        let conn = self.clone();
        *slot = Some(tokio::spawn(async move {
            conn.handle_request(request).await;
        }));
        Ok(())
    }

    async fn handle_request(self: &Arc<Self>, mut request: Request) {
        let handler_id = request.handler_id;
        let message_id = request.message_id;
        let events = self.app.events();

        let Some(item) = self.app.routing().lookup(handler_id, self.api_version) else {
            debug!("{:?}: no handler for id {} api@{}", self, handler_id, self.api_version);
            let mut response = Response::empty().with_status(404);
            response.handler_id = handler_id;
            response.message_id = message_id;
            if let Err(e) = self.write_response(response).await {
                self.request_close(Some(e.to_string()));
            }
            return;
        };
        let callback = item.callback.clone();

        events.apply_request_hooks(&mut request).await;
        let result = callback(request).await;
        events
            .emit(Event::AfterRequest {
                conn: self.clone(),
                handler_id,
                message_id,
            })
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                let ctx = ErrorContext {
                    conn: self.clone(),
                    handler_id,
                    message_id,
                };
                let (error, replacement) = events.apply_error_hooks(&ctx, error).await;
                Some(Reply::Plain(
                    replacement.unwrap_or_else(|| default_error_response(&error)),
                ))
            }
        };
        let Some(reply) = reply else { return };

        let sent = match reply {
            Reply::Plain(mut response) => {
                response.handler_id = handler_id;
                response.message_id = message_id;
                events.apply_response_hooks(&mut response).await;
                self.write_response(response).await
            }
            Reply::Stream(mut response) => {
                response.handler_id = handler_id;
                response.message_id = message_id;
                self.write_stream_response(response).await
            }
        };

        match sent {
            Ok(status) => {
                events
                    .emit(Event::AfterResponse {
                        conn: self.clone(),
                        handler_id,
                        message_id,
                        status,
                    })
                    .await;
            }
            Err(e) => self.request_close(Some(e.to_string())),
        }
    }

    fn resolve_input(&self, answer: InputRequest) -> Result<(), CatsError> {
        let entry = self
            .pending_inputs
            .lock()
            .unwrap()
            .remove(&answer.message_id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Ok(answer));
                Ok(())
            }
            None => Err(CatsError::protocol(
                "received an input answer but no input is pending",
            )),
        }
    }

    fn cancel_pending_input(&self, message_id: u16) {
        let entry = self.pending_inputs.lock().unwrap().remove(&message_id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Err(CatsError::InputCancelled));
            }
            None => debug!("{:?}: cancel for unknown input {}", self, message_id),
        }
    }

    async fn apply_download_speed(&self, speed: u32) -> Result<(), CatsError> {
        if speed != 0 && !DOWNLOAD_SPEED_RANGE.contains(&speed) {
            return Err(CatsError::protocol(format!(
                "unsupported download speed limit: {}",
                speed
            )));
        }
        self.writer.lock().await.set_speed(speed);
        Ok(())
    }

    /// Registers a pending input for `message_id`, sends the prompt and
    ///  suspends until the peer answers, cancels, or the timeout elapses.
    pub(crate) async fn await_input(
        &self,
        message_id: u16,
        prompt: InputPrompt,
    ) -> Result<InputRequest, CatsError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_inputs.lock().unwrap();
            if pending.contains_key(&message_id) {
                return Err(CatsError::protocol(format!(
                    "input query with message id {} already exists",
                    message_id
                )));
            }
            if !prompt.bypass_limit {
                let counted = pending.values().filter(|i| !i.bypass_count).count();
                if counted > self.config.input_limit {
                    if let Some(&oldest) = pending.keys().min() {
                        if let Some(entry) = pending.remove(&oldest) {
                            let _ = entry.tx.send(Err(CatsError::InputCancelled));
                        }
                    }
                }
            }
            pending.insert(
                message_id,
                PendingInput {
                    tx,
                    bypass_count: prompt.bypass_count,
                },
            );
        }

        let response = InputResponse {
            message_id,
            data: prompt.data,
            headers: prompt.headers,
            compression: prompt.compression,
        };
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = response::send_input_response(&mut writer, response).await {
                self.pending_inputs.lock().unwrap().remove(&message_id);
                return Err(e);
            }
        }

        let outcome = match prompt.timeout.or(self.config.input_timeout) {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending_inputs.lock().unwrap().remove(&message_id);
                    return Err(CatsError::InputTimeout);
                }
            },
            None => rx.await,
        };
        match outcome {
            Ok(result) => result,
            Err(_) => Err(CatsError::ConnectionClosed),
        }
    }

    async fn write_response(&self, response: Response) -> Result<u16, CatsError> {
        let mut writer = self.writer.lock().await;
        response::send_response(&mut writer, response).await
    }

    async fn write_stream_response(&self, response: StreamResponse) -> Result<u16, CatsError> {
        let mut writer = self.writer.lock().await;
        response::send_stream_response(&mut writer, response).await
    }

    /// Pushes a server-initiated message to the peer, with a fresh message
    ///  id from the free pool.
    pub async fn send(&self, handler_id: u16, data: Data) -> Result<(), CatsError> {
        self.push(handler_id, Response::new(data)).await
    }

    pub async fn push(&self, handler_id: u16, mut response: Response) -> Result<(), CatsError> {
        let message_id = self.reserve_message_id();
        response.handler_id = handler_id;
        response.message_id = message_id;
        let result = self.write_response(response).await;
        self.release_message_id(message_id);
        result.map(|_| ())
    }

    pub async fn send_stream(
        &self,
        handler_id: u16,
        source: ChunkSource,
        data_type: DataType,
    ) -> Result<(), CatsError> {
        let message_id = self.reserve_message_id();
        let mut response = StreamResponse::new(source, data_type);
        response.handler_id = handler_id;
        response.message_id = message_id;
        let result = self.write_stream_response(response).await;
        self.release_message_id(message_id);
        result.map(|_| ())
    }

    /// Client contract: asks the peer to limit what it sends us.
    pub async fn set_download_speed(&self, speed: u32) -> Result<(), CatsError> {
        let mut writer = self.writer.lock().await;
        response::send_download_speed(&mut writer, speed).await
    }

    pub(crate) async fn send_input_answer(&self, message_id: u16, data: Data) -> Result<(), CatsError> {
        let mut writer = self.writer.lock().await;
        response::send_input_response(&mut writer, InputResponse::new(message_id, data)).await
    }

    pub(crate) async fn send_cancel_input(&self, message_id: u16) -> Result<(), CatsError> {
        let mut writer = self.writer.lock().await;
        response::send_cancel_input(&mut writer, message_id).await
    }

    pub(crate) async fn ping(&self) -> Result<(), CatsError> {
        let mut writer = self.writer.lock().await;
        response::send_ping(&mut writer, now_millis()).await
    }

    fn reserve_message_id(&self) -> u16 {
        let mut ids = self.reserved_ids.lock().unwrap();
        loop {
            let candidate = rand::thread_rng().gen_range(MESSAGE_ID_RANGE);
            if ids.insert(candidate) {
                return candidate;
            }
        }
    }

    fn release_message_id(&self, message_id: u16) {
        self.reserved_ids.lock().unwrap().remove(&message_id);
    }

    pub fn attach_to_channel(self: &Arc<Self>, channel: &str) {
        self.app.attach_conn_to_channel(self, channel);
        self.channels.lock().unwrap().insert(channel.to_string());
    }

    pub fn detach_from_channel(self: &Arc<Self>, channel: &str) {
        self.app.detach_conn_from_channel(self, channel);
        self.channels.lock().unwrap().remove(channel);
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.lock().unwrap().iter().cloned().collect()
    }

    pub fn identity(&self) -> Option<Arc<dyn Identity>> {
        self.identity.read().unwrap().clone()
    }

    pub fn signed_in(&self) -> bool {
        self.identity.read().unwrap().is_some()
    }

    /// Stores the identity and joins its model and identity channels.
    pub fn sign_in(self: &Arc<Self>, identity: Arc<dyn Identity>) {
        self.attach_to_channel(&model_channel(identity.as_ref()));
        self.attach_to_channel(&identity_channel(identity.as_ref()));
        debug!("{:?}: signed in as {}", self, identity_channel(identity.as_ref()));
        *self.identity.write().unwrap() = Some(identity);
    }

    pub fn sign_out(self: &Arc<Self>) {
        let identity = self.identity.write().unwrap().take();
        if let Some(identity) = identity {
            self.detach_from_channel(&identity_channel(identity.as_ref()));
            self.detach_from_channel(&model_channel(identity.as_ref()));
            debug!("{:?}: signed out", self);
        }
    }

    pub fn conns_with_same_identity(&self) -> Vec<Arc<Connection>> {
        match self.identity() {
            Some(identity) => self.app.channel(&identity_channel(identity.as_ref())),
            None => Vec::new(),
        }
    }

    pub fn conns_with_same_model(&self) -> Vec<Arc<Connection>> {
        match self.identity() {
            Some(identity) => self.app.channel(&model_channel(identity.as_ref())),
            None => Vec::new(),
        }
    }

    /// Exclusive writer access for the handshake phase, before the message
    ///  loop starts.
    pub(crate) async fn writer_for_handshake(
        &self,
    ) -> tokio::sync::MutexGuard<'_, FrameWriter<BoxedWrite>> {
        self.writer.lock().await
    }

    pub(crate) fn set_ping_task(&self, task: JoinHandle<()>) {
        *self.ping_task.lock().unwrap() = Some(task);
    }

    /// Releases every resource exactly once: aborts the in-flight handler
    ///  and the ping loop, fails all pending inputs, leaves every channel,
    ///  shuts the socket down and fires CONN_CLOSE.
    pub(crate) async fn close(self: &Arc<Self>, error: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("{:?} closed: {:?}", self, error);

        if let Some(task) = self.ping_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.handler_task.lock().unwrap().take() {
            task.abort();
        }

        let pending = std::mem::take(&mut *self.pending_inputs.lock().unwrap());
        for (_, entry) in pending {
            let _ = entry.tx.send(Err(CatsError::ConnectionClosed));
        }

        self.sign_out();
        self.app.unregister_conn(self);
        self.channels.lock().unwrap().clear();
        self.reserved_ids.lock().unwrap().clear();

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        self.app
            .events()
            .emit(Event::ConnClose {
                conn: self.clone(),
                error,
            })
            .await;
    }
}

/// The default HANDLE_ERROR mapping: a 500 response with a JSON error body,
///  keeping the connection open.
fn default_error_response(error: &anyhow::Error) -> Response {
    let kind = match error.downcast_ref::<CatsError>() {
        Some(CatsError::InputCancelled) => "CancelledError",
        Some(CatsError::InputTimeout) => "TimeoutError",
        Some(CatsError::MalformedData(_)) => "MalformedDataError",
        Some(CatsError::Protocol(_)) => "ProtocolError",
        _ => "InternalServerError",
    };
    Response::json(json!({
        "error": kind,
        "message": error.to_string(),
    }))
    .with_status(500)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::io::DuplexStream;

    /// A connection over an in-memory duplex, for driving receive and send
    ///  procedures without sockets. Returns the peer end and the reader for
    ///  the connection's inbound side.
    pub(crate) fn test_connection(
        api_version: u32,
    ) -> (Arc<Connection>, DuplexStream, FrameReader<BoxedRead>) {
        let app = Arc::new(Application::new(Vec::new()));
        let config = Arc::new(ServerConfig::new());
        let (peer, local) = tokio::io::duplex(1 << 22);
        let (rx, tx) = tokio::io::split(local);
        let writer = FrameWriter::new(Box::new(tx) as BoxedWrite, 0);
        let conn = Arc::new(Connection::new(
            app,
            config,
            writer,
            "127.0.0.1:9999".parse().unwrap(),
            api_version,
        ));
        let reader = FrameReader::new(Box::new(rx) as BoxedRead);
        (conn, peer, reader)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_connection;
    use super::*;

    #[tokio::test]
    async fn test_message_id_pool_reserves_and_releases() {
        let (conn, _peer, _reader) = test_connection(1);

        let a = conn.reserve_message_id();
        let b = conn.reserve_message_id();
        assert_ne!(a, b);
        assert!(MESSAGE_ID_RANGE.contains(&a));
        assert!(MESSAGE_ID_RANGE.contains(&b));

        conn.release_message_id(a);
        assert!(!conn.reserved_ids.lock().unwrap().contains(&a));
        assert!(conn.reserved_ids.lock().unwrap().contains(&b));
    }

    #[tokio::test]
    async fn test_download_speed_validation() {
        let (conn, _peer, _reader) = test_connection(1);

        conn.apply_download_speed(0).await.unwrap();
        conn.apply_download_speed(1024).await.unwrap();
        conn.apply_download_speed(33_554_432).await.unwrap();
        assert!(conn.apply_download_speed(1023).await.is_err());
        assert!(conn.apply_download_speed(33_554_433).await.is_err());
        assert_eq!(conn.writer.lock().await.speed(), 33_554_432);
    }

    #[tokio::test]
    async fn test_cancel_unknown_input_is_ignored() {
        let (conn, _peer, _reader) = test_connection(1);
        conn.cancel_pending_input(4242);
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_sign_in_joins_identity_channels() {
        let (conn, _peer, _reader) = test_connection(1);
        let identity = Arc::new(crate::identity::test_support::TestIdentity {
            id: 7,
            model: "user",
        });

        conn.sign_in(identity);
        assert!(conn.signed_in());
        assert_eq!(conn.conns_with_same_model().len(), 1);
        assert_eq!(conn.conns_with_same_identity().len(), 1);
        assert!(conn.channel_names().contains(&"model_user".to_string()));

        conn.sign_out();
        assert!(!conn.signed_in());
        assert!(conn.app().channel("model_user").is_empty());
        assert!(conn.app().channel("model_user:7").is_empty());
    }

    #[test]
    fn test_default_error_body() {
        let response = default_error_response(&anyhow::Error::new(CatsError::InputCancelled));
        assert_eq!(response.status(), 500);
        match &response.data {
            Data::Json(value) => {
                assert_eq!(value["error"], "CancelledError");
            }
            _ => panic!("expected a JSON body"),
        }
    }
}

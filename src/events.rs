use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::server::conn::Connection;
use crate::server::request::Request;
use crate::server::response::Response;

/// Lifecycle notifications, fired synchronously at well-defined points.
///  Listener errors are logged and swallowed; they never reach the reactor.
#[derive(Clone)]
pub enum Event {
    ServerStart,
    ServerClose {
        error: Option<String>,
    },
    HandshakePass {
        peer: SocketAddr,
    },
    HandshakeFail {
        peer: SocketAddr,
        error: String,
    },
    ConnStart(Arc<Connection>),
    ConnClose {
        conn: Arc<Connection>,
        error: Option<String>,
    },
    AfterRequest {
        conn: Arc<Connection>,
        handler_id: u16,
        message_id: u16,
    },
    AfterResponse {
        conn: Arc<Connection>,
        handler_id: u16,
        message_id: u16,
        status: u16,
    },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::ServerStart => write!(f, "ServerStart"),
            Event::ServerClose { error } => write!(f, "ServerClose({:?})", error),
            Event::HandshakePass { peer } => write!(f, "HandshakePass({})", peer),
            Event::HandshakeFail { peer, error } => {
                write!(f, "HandshakeFail({}, {:?})", peer, error)
            }
            Event::ConnStart(conn) => write!(f, "ConnStart({:?})", conn),
            Event::ConnClose { conn, error } => write!(f, "ConnClose({:?}, {:?})", conn, error),
            Event::AfterRequest {
                handler_id,
                message_id,
                ..
            } => write!(f, "AfterRequest({}, {})", handler_id, message_id),
            Event::AfterResponse {
                handler_id,
                message_id,
                status,
                ..
            } => write!(f, "AfterResponse({}, {}, {})", handler_id, message_id, status),
        }
    }
}

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// BEFORE_REQUEST hook. May rewrite the request in place, including a
///  wholesale replacement of its fields.
#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn before_request(&self, request: &mut Request) -> anyhow::Result<()>;
}

/// BEFORE_RESPONSE hook, symmetric to [RequestHook].
#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn before_response(&self, response: &mut Response) -> anyhow::Result<()>;
}

/// What HANDLE_ERROR hooks get to see: the request was consumed by the
///  failing handler, so only the exchange coordinates remain.
pub struct ErrorContext {
    pub conn: Arc<Connection>,
    pub handler_id: u16,
    pub message_id: u16,
}

/// HANDLE_ERROR hook. `Ok(None)` leaves the error to the next hook (or the
///  default mapping), `Ok(Some(response))` answers the request with that
///  response instead, and `Err(other)` substitutes the error itself, which
///  the remaining hooks then see.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn handle_error(
        &self,
        ctx: &ErrorContext,
        error: &anyhow::Error,
    ) -> Result<Option<Response>, anyhow::Error>;
}

/// Fan-out registry for all event kinds. Fan-out is sequential and awaited
///  inline at the firing point.
pub struct EventBus {
    listeners: RwLock<FxHashMap<Uuid, Arc<dyn EventListener>>>,
    request_hooks: RwLock<Vec<Arc<dyn RequestHook>>>,
    response_hooks: RwLock<Vec<Arc<dyn ResponseHook>>>,
    error_hooks: RwLock<Vec<Arc<dyn ErrorHook>>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus {
            listeners: Default::default(),
            request_hooks: Default::default(),
            response_hooks: Default::default(),
            error_hooks: Default::default(),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn EventListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.write().await.insert(id, listener);
        id
    }

    pub async fn try_remove_listener(&self, id: &Uuid) -> anyhow::Result<()> {
        match self.listeners.write().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(anyhow::anyhow!(
                "tried to remove a listener that was not (no longer?) registered: {}",
                id
            )),
        }
    }

    pub async fn add_request_hook(&self, hook: Arc<dyn RequestHook>) {
        self.request_hooks.write().await.push(hook);
    }

    pub async fn add_response_hook(&self, hook: Arc<dyn ResponseHook>) {
        self.response_hooks.write().await.push(hook);
    }

    pub async fn add_error_hook(&self, hook: Arc<dyn ErrorHook>) {
        self.error_hooks.write().await.push(hook);
    }

    pub async fn emit(&self, event: Event) {
        let listeners = self
            .listeners
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for listener in listeners {
            if let Err(e) = listener.on_event(&event).await {
                warn!("event listener failed on {:?}: {}", event, e);
            }
        }
    }

    /// Runs BEFORE_REQUEST hooks in registration order. A failing hook is
    ///  logged and skipped, leaving the request as the previous hook left it.
    pub async fn apply_request_hooks(&self, request: &mut Request) {
        let hooks = self.request_hooks.read().await.clone();
        for hook in hooks {
            if let Err(e) = hook.before_request(request).await {
                warn!("before-request hook failed: {}", e);
            }
        }
    }

    pub async fn apply_response_hooks(&self, response: &mut Response) {
        let hooks = self.response_hooks.read().await.clone();
        for hook in hooks {
            if let Err(e) = hook.before_response(response).await {
                warn!("before-response hook failed: {}", e);
            }
        }
    }

    /// Runs HANDLE_ERROR hooks. Returns the (possibly substituted) error
    ///  and the replacement response, if any hook produced one.
    pub async fn apply_error_hooks(
        &self,
        ctx: &ErrorContext,
        mut error: anyhow::Error,
    ) -> (anyhow::Error, Option<Response>) {
        let hooks = self.error_hooks.read().await.clone();
        for hook in hooks {
            match hook.handle_error(ctx, &error).await {
                Ok(Some(response)) => return (error, Some(response)),
                Ok(None) => {}
                Err(substituted) => error = substituted,
            }
        }
        (error, None)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl EventListener for Recorder {
        async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("{:?}", event));
            if self.fail {
                anyhow::bail!("listener failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_all_listeners_and_swallows_errors() {
        let bus = EventBus::new();
        let failing = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let working = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        bus.add_listener(failing.clone()).await;
        bus.add_listener(working.clone()).await;

        bus.emit(Event::ServerStart).await;

        assert_eq!(failing.seen.lock().unwrap().len(), 1);
        assert_eq!(
            working.seen.lock().unwrap().as_slice(),
            ["ServerStart".to_string()]
        );
    }

    #[tokio::test]
    async fn test_listener_removal() {
        let bus = EventBus::new();
        let listener = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        let id = bus.add_listener(listener.clone()).await;

        bus.try_remove_listener(&id).await.unwrap();
        assert!(bus.try_remove_listener(&id).await.is_err());

        bus.emit(Event::ServerStart).await;
        assert!(listener.seen.lock().unwrap().is_empty());
    }
}

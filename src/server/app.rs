use std::sync::{Arc, Mutex as StdMutex, Weak};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::codecs::Data;
use crate::events::EventBus;
use crate::server::conn::Connection;
use crate::server::handlers::{Api, RoutingTable};

/// The channel every connection joins once its handshake passes.
pub const CHANNEL_ALL: &str = "__all__";

/// Shared state behind all connections of a server: the computed routing
///  table (write-once), the event bus, the connection set and the channel
///  directory. Channels hold weak references so a connection's lifetime is
///  governed by its socket task alone.
pub struct Application {
    routing: RoutingTable,
    events: EventBus,
    connections: StdMutex<Vec<Arc<Connection>>>,
    channels: StdMutex<FxHashMap<String, Vec<Weak<Connection>>>>,
}

impl Application {
    pub fn new(apis: Vec<Api>) -> Application {
        Application {
            routing: RoutingTable::from_apis(apis),
            events: EventBus::new(),
            connections: StdMutex::new(Vec::new()),
            channels: StdMutex::new(Default::default()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub(crate) fn register_conn(&self, conn: &Arc<Connection>) {
        self.connections.lock().unwrap().push(conn.clone());
    }

    /// Removes the connection from the connection set and every channel.
    ///  Called once from connection close.
    pub(crate) fn unregister_conn(&self, conn: &Arc<Connection>) {
        self.connections
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, conn));

        let mut channels = self.channels.lock().unwrap();
        for members in channels.values_mut() {
            members.retain(|w| w.upgrade().map_or(false, |c| !Arc::ptr_eq(&c, conn)));
        }
        channels.retain(|_, members| !members.is_empty());
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().clone()
    }

    /// Snapshot of a channel's live members. Dead references are pruned on
    ///  the way, so a broadcast in progress never observes them.
    pub fn channel(&self, name: &str) -> Vec<Arc<Connection>> {
        let mut channels = self.channels.lock().unwrap();
        match channels.get_mut(name) {
            Some(members) => {
                members.retain(|w| w.strong_count() > 0);
                members.iter().filter_map(|w| w.upgrade()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().unwrap().keys().cloned().collect()
    }

    pub fn attach_conn_to_channel(&self, conn: &Arc<Connection>, channel: &str) {
        let mut channels = self.channels.lock().unwrap();
        let members = channels.entry(channel.to_string()).or_default();
        let already_in = members
            .iter()
            .any(|w| w.upgrade().map_or(false, |c| Arc::ptr_eq(&c, conn)));
        if !already_in {
            members.push(Arc::downgrade(conn));
        }
    }

    pub fn detach_conn_from_channel(&self, conn: &Arc<Connection>, channel: &str) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(members) = channels.get_mut(channel) {
            members.retain(|w| w.upgrade().map_or(false, |c| !Arc::ptr_eq(&c, conn)));
            if members.is_empty() {
                channels.remove(channel);
            }
        }
    }

    pub fn clear_channel(&self, channel: &str) {
        self.channels.lock().unwrap().remove(channel);
    }

    pub fn clear_all_channels(&self) {
        self.channels.lock().unwrap().clear();
    }

    /// Best-effort fan-out to every member of a channel. A slow or closed
    ///  recipient does not block the others; failures are logged and
    ///  skipped. Returns the number of successful deliveries.
    pub async fn broadcast(&self, channel: &str, handler_id: u16, data: Data) -> usize {
        let members = self.channel(channel);
        debug!("broadcast to {:?}: {} members", channel, members.len());

        let mut delivered = 0;
        for conn in members {
            match conn.send(handler_id, data.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("broadcast to {:?} failed: {}", conn, e),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::conn::test_support::test_connection;

    #[tokio::test]
    async fn test_channel_attach_detach() {
        let (conn, _peer, _reader) = test_connection(1);
        let app = conn.app().clone();

        app.attach_conn_to_channel(&conn, "room");
        app.attach_conn_to_channel(&conn, "room");
        assert_eq!(app.channel("room").len(), 1);
        assert_eq!(app.channels(), vec!["room".to_string()]);

        app.detach_conn_from_channel(&conn, "room");
        assert!(app.channel("room").is_empty());
        assert!(app.channels().is_empty());
    }

    #[tokio::test]
    async fn test_channel_iteration_is_a_snapshot() {
        let (conn, _peer, _reader) = test_connection(1);
        let app = conn.app().clone();

        app.attach_conn_to_channel(&conn, "room");
        let snapshot = app.channel("room");
        app.detach_conn_from_channel(&conn, "room");
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_members_are_pruned() {
        let (conn, _peer, _reader) = test_connection(1);
        let app = conn.app().clone();

        app.attach_conn_to_channel(&conn, "room");
        drop(conn);
        drop(_reader);
        assert!(app.channel("room").is_empty());
    }

    #[tokio::test]
    async fn test_unregister_removes_from_all_channels() {
        let (conn, _peer, _reader) = test_connection(1);
        let app = conn.app().clone();

        app.register_conn(&conn);
        app.attach_conn_to_channel(&conn, CHANNEL_ALL);
        app.attach_conn_to_channel(&conn, "room");

        app.unregister_conn(&conn);
        assert!(app.connections().is_empty());
        assert!(app.channel(CHANNEL_ALL).is_empty());
        assert!(app.channel("room").is_empty());
    }
}

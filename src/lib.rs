pub mod codecs;
pub mod compression;
pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod headers;
pub mod identity;
pub mod server;
pub mod util;
pub mod wire;

pub use crate::codecs::{Data, DataType, FileSource, Payload, ReceivedFile};
pub use crate::compression::Compression;
pub use crate::config::ServerConfig;
pub use crate::error::CatsError;
pub use crate::handshake::{Handshake, Sha256TimeHandshake};
pub use crate::headers::{FileEntry, Headers};
pub use crate::identity::Identity;
pub use crate::server::app::Application;
pub use crate::server::conn::Connection;
pub use crate::server::handlers::{Api, HandlerItem, HandlerResult};
pub use crate::server::request::{InputPrompt, InputRequest, Request};
pub use crate::server::response::{ChunkSource, Reply, Response, StreamResponse};
pub use crate::server::server::Server;

#[cfg(test)]
pub(crate) mod test_util;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;

use crate::server::request::Request;
use crate::server::response::Reply;

pub type HandlerResult = anyhow::Result<Option<Reply>>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A registered handler function. Boxed so user closures and adapted
///  methods share one callable shape.
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// One registration: a handler id plus the api-version range it serves.
///  `version = None` means the handler serves every version (and must then
///  be the only registration for its id).
#[derive(Clone)]
pub struct HandlerItem {
    pub id: u16,
    pub name: Option<String>,
    pub version: Option<u32>,
    pub end_version: Option<u32>,
    pub callback: Handler,
}

impl std::fmt::Debug for HandlerItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HandlerItem(id={}, name={:?}, versions=[{:?}..{:?}])",
            self.id, self.name, self.version, self.end_version
        )
    }
}

impl HandlerItem {
    /// Whether this item serves the given api version. An item without an
    ///  end version is open-ended.
    fn matches(&self, api_version: u32) -> bool {
        match self.version {
            None => true,
            Some(version) => {
                version <= api_version && self.end_version.map_or(true, |end| api_version <= end)
            }
        }
    }
}

/// A group of handler registrations, merged into an [Application] at
///  construction time. Registration is explicit; version ranges are closed
///  as later bases arrive:
///
/// - an explicit `end_version` covers `[version, end_version]` inclusive,
/// - otherwise registering a later base caps the previous open range at
///   `base - 1`,
/// - otherwise the range stays open-ended,
/// - versions not covered by any range are not-found for that id.
pub struct Api {
    handlers: FxHashMap<u16, Vec<HandlerItem>>,
}

impl Api {
    pub fn new() -> Api {
        Api {
            handlers: Default::default(),
        }
    }

    /// Registers a handler for every api version of `id`.
    pub fn on<F, Fut>(&mut self, id: u16, name: &str, callback: F) -> anyhow::Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(HandlerItem {
            id,
            name: Some(name.to_string()),
            version: None,
            end_version: None,
            callback: box_handler(callback),
        })
    }

    /// Registers a handler for `id` starting at `version`, optionally up to
    ///  `end_version` inclusive.
    pub fn on_versioned<F, Fut>(
        &mut self,
        id: u16,
        name: &str,
        version: u32,
        end_version: Option<u32>,
        callback: F,
    ) -> anyhow::Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(HandlerItem {
            id,
            name: Some(name.to_string()),
            version: Some(version),
            end_version,
            callback: box_handler(callback),
        })
    }

    pub fn register(&mut self, handler: HandlerItem) -> anyhow::Result<()> {
        if let (Some(version), Some(end_version)) = (handler.version, handler.end_version) {
            if version > end_version {
                bail!(
                    "invalid version range for handler {}: [{}..{}]",
                    handler.id,
                    version,
                    end_version
                );
            }
        }
        if handler.version.is_none() && handler.end_version.is_some() {
            bail!("initial version is not provided for {:?}", handler);
        }

        let list = self.handlers.entry(handler.id).or_default();
        match handler.version {
            None => {
                if !list.is_empty() {
                    bail!(
                        "attempted to add wildcard {:?} to versioned handlers",
                        handler
                    );
                }
            }
            Some(version) => {
                if let Some(last) = list.last_mut() {
                    let last_version = last
                        .version
                        .ok_or_else(|| anyhow!("attempted to add versioned {:?} to wildcard", handler))?;
                    match last.end_version {
                        Some(end) => {
                            if end >= version {
                                bail!("handler {:?} overlaps {:?}", handler, last);
                            }
                        }
                        None => {
                            if last_version >= version {
                                bail!("handler {:?} overlaps {:?}", handler, last);
                            }
                            last.end_version = Some(version - 1);
                        }
                    }
                }
            }
        }

        list.push(handler);
        Ok(())
    }

    /// Merges `other` into this api. Handler ids present in `other` replace
    ///  this api's registrations for those ids wholesale.
    pub fn update(&mut self, other: Api) {
        for (id, list) in other.handlers {
            self.handlers.insert(id, list);
        }
    }

    pub(crate) fn into_handlers(self) -> FxHashMap<u16, Vec<HandlerItem>> {
        self.handlers
    }
}

impl Default for Api {
    fn default() -> Self {
        Api::new()
    }
}

fn box_handler<F, Fut>(callback: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |request| Box::pin(callback(request)))
}

/// The computed routing table, write-once at application construction.
pub struct RoutingTable {
    routes: FxHashMap<u16, Vec<HandlerItem>>,
}

impl RoutingTable {
    pub fn from_apis(apis: Vec<Api>) -> RoutingTable {
        let mut merged = Api::new();
        for api in apis {
            merged.update(api);
        }
        RoutingTable {
            routes: merged.into_handlers(),
        }
    }

    /// Finds the handler serving `(handler_id, api_version)`; `None` means
    ///  not-found, which the connection answers with a 404 status.
    pub fn lookup(&self, handler_id: u16, api_version: u32) -> Option<&HandlerItem> {
        self.routes
            .get(&handler_id)?
            .iter()
            .find(|item| item.matches(api_version))
    }
}

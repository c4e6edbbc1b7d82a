use std::{cmp::Reverse, fmt, sync::Arc};

use futures::future::select_all;
use itertools::Itertools;
use tracing::{debug, trace};

use crate::error::TransportError;

use super::{
    split_url, stream::StreamConnection, BasicChannel, ChannelBackend, Connection, RawListener,
    TcpTransport, TransportBackend,
};

/// Name of the default channel.
pub const BASIC_CHANNEL: &str = "basic";

struct Registered<T: ?Sized> {
    name: String,
    priority: i64,
    backend: Arc<T>,
}

impl<T: ?Sized> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Registered {
            name: self.name.clone(),
            priority: self.priority,
            backend: self.backend.clone(),
        }
    }
}

/// Inserts a registration, replacing one with the same name, keeping the list ordered by descending
/// priority. Ties keep registration order.
fn register<T: ?Sized>(list: &mut Vec<Registered<T>>, entry: Registered<T>) {
    list.retain(|existing| existing.name != entry.name);
    list.push(entry);
    list.sort_by_key(|entry| Reverse(entry.priority));
}

/// Channels known to a context, ordered by preference.
#[derive(Clone, Default)]
pub(crate) struct ChannelSet {
    channels: Vec<Registered<dyn ChannelBackend>>,
}

impl ChannelSet {
    pub(crate) fn preferred(&self) -> Option<(&str, Arc<dyn ChannelBackend>)> {
        self.channels
            .first()
            .map(|entry| (entry.name.as_str(), entry.backend.clone()))
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ChannelBackend>> {
        self.channels
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.backend.clone())
    }
}

/// Registry of transport and channel backends, creating listeners and dialing connections.
///
/// # Example
///
/// ```
/// use pipe_agent::transport::{MemoryTransport, TransportContext};
///
/// let mem = MemoryTransport::new();
/// let mut context = TransportContext::with_defaults();
/// context.register_transport(10, "mem", mem);
///
/// assert_eq!(context.transports().collect::<Vec<_>>(), ["mem", "tcp"]);
/// ```
#[derive(Clone)]
pub struct TransportContext {
    transports: Vec<Registered<dyn TransportBackend>>,
    channels: ChannelSet,
    max_message_size: u64,
}

impl TransportContext {
    /// Creates a context with no backends registered.
    pub fn new() -> Self {
        TransportContext {
            transports: Vec::new(),
            channels: ChannelSet::default(),
            max_message_size: u64::MAX,
        }
    }

    /// Creates a context with the `tcp` transport and the `basic` channel registered.
    pub fn with_defaults() -> Self {
        let mut context = TransportContext::new();
        context.register_transport(1, "tcp", TcpTransport::new());
        context.register_channel(1, BASIC_CHANNEL, BasicChannel);
        context
    }

    /// Registers a transport backend for the scheme `name`. Higher priorities are preferred.
    pub fn register_transport(
        &mut self,
        priority: i64,
        name: impl Into<String>,
        backend: impl TransportBackend,
    ) -> &mut Self {
        let backend: Arc<dyn TransportBackend> = Arc::new(backend);
        register(
            &mut self.transports,
            Registered {
                name: name.into(),
                priority,
                backend,
            },
        );
        self
    }

    /// Registers a channel backend. Dialed connections use the highest priority channel.
    pub fn register_channel(
        &mut self,
        priority: i64,
        name: impl Into<String>,
        backend: impl ChannelBackend,
    ) -> &mut Self {
        let backend: Arc<dyn ChannelBackend> = Arc::new(backend);
        register(
            &mut self.channels.channels,
            Registered {
                name: name.into(),
                priority,
                backend,
            },
        );
        self
    }

    /// Sets the largest message, payload and buffers combined, accepted from a connection.
    pub fn set_max_message_size(&mut self, max: u64) -> &mut Self {
        self.max_message_size = max;
        self
    }

    /// Registered transport names, most preferred first.
    pub fn transports(&self) -> impl Iterator<Item = &str> {
        self.transports.iter().map(|entry| entry.name.as_str())
    }

    /// Registered channel names, most preferred first.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.channels.iter().map(|entry| entry.name.as_str())
    }

    fn transport(&self, scheme: &str) -> Result<&Registered<dyn TransportBackend>, TransportError> {
        self.transports
            .iter()
            .find(|entry| entry.name == scheme)
            .ok_or_else(|| TransportError::UnknownTransport(scheme.to_string()))
    }

    /// Binds every address, returning a listener accepting on all of them.
    pub async fn listen<I, S>(&self, urls: I) -> Result<Listener, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bound = Vec::new();
        for url in urls {
            let (scheme, address) = split_url(url.as_ref())?;
            let transport = self.transport(scheme)?;
            let raw = transport.backend.listen(address).await?;
            let url = format!("{scheme}://{}", raw.local_address());
            debug!(%url, "listening");
            bound.push(BoundListener {
                name: transport.name.clone(),
                priority: transport.priority,
                url,
                raw,
            });
        }
        if bound.is_empty() {
            return Err(TransportError::InvalidAddress(String::new()));
        }

        let listeners = bound
            .into_iter()
            .sorted_by_key(|listener| Reverse(listener.priority))
            .collect();
        Ok(Listener {
            listeners,
            channels: Arc::new(self.channels.clone()),
            max_message_size: self.max_message_size,
        })
    }

    /// Dials a `scheme://address` URL.
    pub async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let (scheme, address) = split_url(url)?;
        let stream = self.transport(scheme)?.backend.connect(address).await?;
        let conn = StreamConnection::dialed(
            stream,
            Arc::new(self.channels.clone()),
            self.max_message_size,
        )
        .await?;
        Ok(Arc::new(conn))
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        TransportContext::with_defaults()
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("transports", &self.transports().collect::<Vec<_>>())
            .field("channels", &self.channels().collect::<Vec<_>>())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

struct BoundListener {
    name: String,
    priority: i64,
    url: String,
    raw: Box<dyn RawListener>,
}

/// Accepts inbound connections on every bound address.
pub struct Listener {
    listeners: Vec<BoundListener>,
    channels: Arc<ChannelSet>,
    max_message_size: u64,
}

impl Listener {
    /// The bound URL for a transport name, such as `tcp://127.0.0.1:41234`.
    pub fn url(&self, transport: &str) -> Option<&str> {
        self.listeners
            .iter()
            .find(|listener| listener.name == transport)
            .map(|listener| listener.url.as_str())
    }

    /// All bound URLs, most preferred first.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.listeners.iter().map(|listener| listener.url.as_str())
    }

    /// The bound URL of the most preferred transport.
    pub fn preferred_url(&self) -> Option<&str> {
        self.urls().next()
    }

    /// Waits for the next inbound connection on any bound address.
    ///
    /// Cancel safe: dropping the returned future loses no connection.
    pub async fn accept(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let accepts = self.listeners.iter().map(|listener| listener.raw.accept());
        let (res, idx, _) = select_all(accepts).await;
        let stream = res?;
        trace!(url = %self.listeners[idx].url, peer = %stream.peer, "accepted stream");

        Ok(Arc::new(StreamConnection::accepted(
            stream,
            self.channels.clone(),
            self.max_message_size,
        )))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("urls", &self.urls().collect::<Vec<_>>())
            .finish()
    }
}

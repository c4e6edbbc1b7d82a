//! Defines error handling constructs for pipe-agent.
//!
//! Errors are split by who observes them. [`SendError`] is returned synchronously from
//! [`Agent::send`](crate::agent::Agent::send) before any I/O takes place. [`ResponseError`] is delivered
//! asynchronously through a [`FutureMessage`](crate::future_message::FutureMessage) once a request is in
//! flight. [`TransportError`] describes failures of the connection layer itself, and is wrapped into a
//! `ResponseError` whenever it affects an outstanding request.

use std::{error, fmt, io, sync::Arc};

use crate::{message::MessageKind, worker::WorkerId};

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// An error raised by a transport backend, a channel backend, or a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The remote endpoint could not be reached.
    ConnectionRefused(String),
    /// The connection was closed by the peer or severed.
    ConnectionClosed,
    /// An I/O failure happened on the underlying stream.
    Io {
        /// The kind of the underlying I/O error.
        kind: io::ErrorKind,
        /// The rendered I/O error.
        message: String,
    },
    /// No transport backend is registered for the scheme of an address.
    UnknownTransport(String),
    /// The peer asked for a channel backend which is not registered locally.
    UnsupportedChannel(String),
    /// A frame could not be decoded.
    MalformedFrame(String),
    /// A descriptor announced more bytes than the configured maximum.
    FrameTooLarge {
        /// Total size announced by the descriptor.
        size: u64,
        /// Configured maximum.
        max: u64,
    },
    /// The address could not be parsed.
    InvalidAddress(String),
    /// The listener has been closed and will never accept again.
    ListenerClosed,
}

impl TransportError {
    /// Returns `true` if the peer is gone, as opposed to a local or framing failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::ConnectionClosed => true,
            TransportError::Io { kind, .. } => matches!(
                kind,
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl TransportError {
    /// Returns `true` if the stream may be left mid-frame, so the connection can no longer be used.
    ///
    /// Encoding and size errors are raised before any byte of the frame is written and leave the stream intact.
    pub fn is_stream_fault(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused(_)
                | TransportError::ConnectionClosed
                | TransportError::Io { .. }
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
            io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused(err.to_string()),
            kind => TransportError::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        TransportError::MalformedFrame(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        TransportError::MalformedFrame(err.to_string())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionRefused(addr) => write!(f, "connection refused: {addr}"),
            TransportError::ConnectionClosed => write!(f, "connection closed"),
            TransportError::Io { message, .. } => write!(f, "io error: {message}"),
            TransportError::UnknownTransport(scheme) => {
                write!(f, "no transport registered for '{scheme}'")
            }
            TransportError::UnsupportedChannel(name) => {
                write!(f, "channel '{name}' is not supported")
            }
            TransportError::MalformedFrame(err) => write!(f, "malformed frame: {err}"),
            TransportError::FrameTooLarge { size, max } => {
                write!(f, "frame of {size} bytes exceeds the maximum of {max} bytes")
            }
            TransportError::InvalidAddress(addr) => write!(f, "invalid address '{addr}'"),
            TransportError::ListenerClosed => write!(f, "listener closed"),
        }
    }
}

impl error::Error for TransportError {}

/// The error a [`FutureMessage`](crate::future_message::FutureMessage) completes with.
///
/// This is cheap to clone so that every waiter and callback on a handle observes the same value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseError {
    /// The connection failed before the response arrived.
    Transport(TransportError),
    /// The peer handled the request and reported a failure.
    Remote(Arc<str>),
    /// The local request handler failed.
    Handler(Arc<str>),
    /// The connection violated the request/response protocol and was torn down.
    Protocol(Arc<str>),
    /// The agent shut down before the response arrived.
    Shutdown,
    /// No response arrived within the allotted time.
    Timeout,
}

impl ResponseError {
    /// Creates a remote exception error from its textual description.
    pub fn remote(description: impl Into<Arc<str>>) -> Self {
        ResponseError::Remote(description.into())
    }

    /// Creates a local handler error from its textual description.
    pub fn handler(description: impl Into<Arc<str>>) -> Self {
        ResponseError::Handler(description.into())
    }

    /// Creates a protocol violation error.
    pub fn protocol(description: impl Into<Arc<str>>) -> Self {
        ResponseError::Protocol(description.into())
    }

    /// Returns the description carried across the wire in an exception response.
    ///
    /// Remote and handler errors return their text verbatim so that re-raising an error on another hop does
    /// not stack prefixes.
    pub fn description(&self) -> String {
        match self {
            ResponseError::Remote(text)
            | ResponseError::Handler(text)
            | ResponseError::Protocol(text) => text.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<TransportError> for ResponseError {
    fn from(err: TransportError) -> Self {
        ResponseError::Transport(err)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseError::Transport(err) => write!(f, "transport error: {err}"),
            ResponseError::Remote(text) => write!(f, "remote exception: {text}"),
            ResponseError::Handler(text) => write!(f, "handler failed: {text}"),
            ResponseError::Protocol(text) => write!(f, "protocol violation: {text}"),
            ResponseError::Shutdown => write!(f, "agent shut down"),
            ResponseError::Timeout => write!(f, "timeout"),
        }
    }
}

impl error::Error for ResponseError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ResponseError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

/// Identifies a worker in a lookup which failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerKey {
    /// Looked up by name.
    Name(String),
    /// Looked up by id.
    Id(WorkerId),
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKey::Name(name) => write!(f, "{name}"),
            WorkerKey::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Error that can occur synchronously when sending a request, before any network I/O.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendError {
    /// The destination worker is not part of the static worker table, or its address was never published.
    UnknownWorker(WorkerKey),
    /// The agent isn't running.
    NotRunning {
        /// Id of the local worker.
        worker_id: WorkerId,
        /// Kind of the message which was refused.
        kind: MessageKind,
    },
    /// Only request messages can be sent.
    NotARequest(MessageKind),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::UnknownWorker(key) => write!(f, "unknown destination worker {key}"),
            SendError::NotRunning { worker_id, kind } => write!(
                f,
                "node {worker_id} tried to send a message of type {kind} but rpc is no longer running on this node"
            ),
            SendError::NotARequest(kind) => {
                write!(f, "send is only for requests, got a message of type {kind}")
            }
        }
    }
}

impl error::Error for SendError {}

/// An error returned by a rendezvous [`Store`](crate::store::Store).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The key was not published before the wait timed out.
    Timeout(String),
    /// The backing service failed.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Timeout(key) => write!(f, "timed out waiting for key '{key}'"),
            StoreError::Backend(err) => write!(f, "store failure: {err}"),
        }
    }
}

impl error::Error for StoreError {}

/// An error that can occur when starting an agent.
#[derive(Debug)]
pub enum BootstrapError {
    /// The agent was already started.
    AlreadyStarted,
    /// Starting must happen from within a Tokio runtime.
    NoRuntime,
    /// The worker pool threads could not be spawned.
    Pool(io::Error),
    /// Binding the listener failed.
    Listen(TransportError),
    /// The listener did not bind any address usable by peers.
    NoPublishableAddress,
    /// Exchanging addresses through the rendezvous store failed.
    Rendezvous(StoreError),
    /// A published address was not valid UTF-8.
    InvalidPeerAddress {
        /// Name of the worker whose address was invalid.
        worker: String,
    },
}

impl From<TransportError> for BootstrapError {
    fn from(err: TransportError) -> Self {
        BootstrapError::Listen(err)
    }
}

impl From<StoreError> for BootstrapError {
    fn from(err: StoreError) -> Self {
        BootstrapError::Rendezvous(err)
    }
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::AlreadyStarted => write!(f, "agent already started"),
            BootstrapError::NoRuntime => write!(f, "agent must be started within a tokio runtime"),
            BootstrapError::Pool(err) => write!(f, "failed to spawn worker pool: {err}"),
            BootstrapError::Listen(err) => write!(f, "failed to listen: {err}"),
            BootstrapError::NoPublishableAddress => {
                write!(f, "listener has no address to publish")
            }
            BootstrapError::Rendezvous(err) => err.fmt(f),
            BootstrapError::InvalidPeerAddress { worker } => {
                write!(f, "address published by worker '{worker}' is not valid utf-8")
            }
        }
    }
}

impl error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            BootstrapError::Pool(err) => Some(err),
            BootstrapError::Listen(err) => Some(err),
            BootstrapError::Rendezvous(err) => Some(err),
            _ => None,
        }
    }
}

/// An error in the agent options detected at construction time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Two workers share the same id.
    DuplicateWorkerId(WorkerId),
    /// The local worker is missing from the worker table or registered under another id.
    SelfNotListed {
        /// The local worker name.
        name: String,
        /// The local worker id.
        id: WorkerId,
    },
    /// The worker pool must contain at least one thread.
    EmptyWorkerPool,
    /// No listen address was configured.
    NoListenAddress,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::DuplicateWorkerId(id) => write!(f, "worker id {id} is used twice"),
            ConfigError::SelfNotListed { name, id } => {
                write!(f, "worker '{name}' with id {id} is missing from the worker table")
            }
            ConfigError::EmptyWorkerPool => write!(f, "worker pool needs at least one thread"),
            ConfigError::NoListenAddress => write!(f, "no listen address configured"),
        }
    }
}

impl error::Error for ConfigError {}

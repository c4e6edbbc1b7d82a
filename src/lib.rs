#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod agent;
pub mod config;
pub mod error;
pub mod future_message;
pub mod message;
pub mod store;
pub mod transport;
pub mod worker;

pub use agent::{Agent, RequestHandler};
pub use config::AgentOptions;
pub use future_message::FutureMessage;
pub use message::{Message, MessageKind, TypedBuffer};
pub use store::{MemoryStore, Store};
pub use worker::{WorkerId, WorkerInfo};

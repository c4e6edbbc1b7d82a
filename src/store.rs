//! Rendezvous key-value store used to exchange listening addresses at start up.
//!
//! Each agent publishes its own address under its worker name with [`Store::set`], then fetches the
//! address of every worker in the group with [`Store::get`]. Nothing else goes through the store.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::error::StoreError;

/// A key-value rendezvous service.
pub trait Store: Send + Sync + 'static {
    /// Publishes a value under a key, replacing any earlier value.
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Fetches the value of a key, waiting for it to be published for at most `timeout`.
    fn get<'a>(
        &'a self,
        key: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<u8>, StoreError>>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).set(key, value)
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<u8>, StoreError>> {
        (**self).get(key, timeout)
    }
}

/// An in-process store shared by agents running in the same process.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    values: Mutex<HashMap<String, Vec<u8>>>,
    published: Notify,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(key)
            .cloned()
    }
}

impl Store for MemoryStore {
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.inner
                .values
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .insert(key.to_string(), value);
            self.inner.published.notify_waiters();
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<u8>, StoreError>> {
        Box::pin(async move {
            let wait = async {
                loop {
                    // Register interest before checking so a concurrent set cannot be missed.
                    let published = self.inner.published.notified();
                    if let Some(value) = self.lookup(key) {
                        return value;
                    }
                    published.await;
                }
            };
            tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| StoreError::Timeout(key.to_string()))
        })
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .inner
            .values
            .lock()
            .map(|values| values.len())
            .unwrap_or_default();
        f.debug_struct("MemoryStore").field("keys", &keys).finish()
    }
}

//! Agent configuration.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    worker::{WorkerDirectory, WorkerId},
};

/// Options for an [`Agent`](crate::agent::Agent).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    /// Name of the local worker.
    pub worker_name: String,
    /// Id of the local worker.
    pub worker_id: WorkerId,
    /// Every worker in the group, including the local one.
    pub worker_name_to_id: BTreeMap<String, WorkerId>,
    /// Addresses to listen on, as `scheme://address` URLs.
    pub listen_addresses: Vec<String>,
    /// Number of worker pool threads running request handlers and response completions.
    pub num_worker_threads: usize,
    /// Default time callers should wait for a response.
    pub rpc_timeout: Duration,
    /// How long to wait for each peer to publish its address during start up.
    pub rendezvous_timeout: Duration,
    /// Largest message, payload and buffers combined, accepted from a connection.
    pub max_message_size: u64,
    /// First delay before accepting again after an accept error.
    pub accept_backoff_initial: Duration,
    /// Upper bound of the accept retry delay.
    pub accept_backoff_max: Duration,
}

impl AgentOptions {
    /// Creates options for the local worker with defaults for everything else.
    pub fn new(worker_name: impl Into<String>, worker_id: WorkerId) -> Self {
        AgentOptions {
            worker_name: worker_name.into(),
            worker_id,
            ..Default::default()
        }
    }

    /// Sets the worker table.
    pub fn with_workers<I, S>(mut self, workers: I) -> Self
    where
        I: IntoIterator<Item = (S, WorkerId)>,
        S: Into<String>,
    {
        self.worker_name_to_id = workers
            .into_iter()
            .map(|(name, id)| (name.into(), id))
            .collect();
        self
    }

    /// Sets the listen addresses.
    pub fn with_listen_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listen_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the number of worker pool threads.
    pub fn with_num_worker_threads(mut self, num: usize) -> Self {
        self.num_worker_threads = num;
        self
    }

    /// Sets the rpc timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Sets the rendezvous timeout.
    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    /// Sets the maximum accepted message size.
    pub fn with_max_message_size(mut self, max: u64) -> Self {
        self.max_message_size = max;
        self
    }

    /// Checks the options and builds the worker directory.
    pub(crate) fn validate(&self) -> Result<WorkerDirectory, ConfigError> {
        if self.num_worker_threads == 0 {
            return Err(ConfigError::EmptyWorkerPool);
        }
        if self.listen_addresses.is_empty() {
            return Err(ConfigError::NoListenAddress);
        }

        let directory = WorkerDirectory::from_table(&self.worker_name_to_id)?;
        match directory.by_name(&self.worker_name) {
            Ok(info) if info.id() == self.worker_id => Ok(directory),
            _ => Err(ConfigError::SelfNotListed {
                name: self.worker_name.clone(),
                id: self.worker_id,
            }),
        }
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        AgentOptions {
            worker_name: String::new(),
            worker_id: 0,
            worker_name_to_id: BTreeMap::new(),
            listen_addresses: vec!["tcp://127.0.0.1:0".to_string()],
            num_worker_threads: 16,
            rpc_timeout: Duration::from_secs(60),
            rendezvous_timeout: Duration::from_secs(30),
            max_message_size: 1 << 30,
            accept_backoff_initial: Duration::from_millis(10),
            accept_backoff_max: Duration::from_secs(1),
        }
    }
}

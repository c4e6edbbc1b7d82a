//! Worker identities and the static worker directory.
//!
//! Every participant in the system is a worker identified by a numeric id and a unique name. The full set of
//! workers is known up front: the [`WorkerDirectory`] builds its id and name indexes once, when an agent is
//! constructed, and never changes afterwards.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use crate::error::{ConfigError, WorkerKey};

/// Numeric identity of a worker.
pub type WorkerId = u16;

/// Identity of a peer: its numeric id and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerInfo {
    name: Arc<str>,
    id: WorkerId,
}

impl WorkerInfo {
    /// Creates a new worker identity.
    pub fn new(name: impl Into<Arc<str>>, id: WorkerId) -> Self {
        WorkerInfo {
            name: name.into(),
            id,
        }
    }

    /// The worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The worker id.
    pub fn id(&self) -> WorkerId {
        self.id
    }
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Read-only lookup of workers by id and by name.
#[derive(Clone, Debug)]
pub struct WorkerDirectory {
    by_id: BTreeMap<WorkerId, WorkerInfo>,
    by_name: HashMap<Arc<str>, WorkerInfo>,
}

impl WorkerDirectory {
    /// Builds both indexes from a worker name to id table.
    pub fn from_table<'a, I>(table: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a String, &'a WorkerId)>,
    {
        let mut by_id = BTreeMap::new();
        let mut by_name = HashMap::new();
        for (name, &id) in table {
            let info = WorkerInfo::new(name.as_str(), id);
            if by_id.insert(id, info.clone()).is_some() {
                return Err(ConfigError::DuplicateWorkerId(id));
            }
            by_name.insert(info.name.clone(), info);
        }

        Ok(WorkerDirectory { by_id, by_name })
    }

    /// Looks up a worker by name.
    pub fn by_name(&self, name: &str) -> Result<&WorkerInfo, WorkerKey> {
        self.by_name
            .get(name)
            .ok_or_else(|| WorkerKey::Name(name.to_string()))
    }

    /// Looks up a worker by id.
    pub fn by_id(&self, id: WorkerId) -> Result<&WorkerInfo, WorkerKey> {
        self.by_id.get(&id).ok_or(WorkerKey::Id(id))
    }

    /// Iterates all workers ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.by_id.values()
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns `true` if there are no workers.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HashMap<String, WorkerId> {
        HashMap::from([
            ("trainer".to_string(), 0),
            ("ps".to_string(), 1),
            ("observer".to_string(), 2),
        ])
    }

    #[test]
    fn indexes_agree() {
        let table = table();
        let dir = WorkerDirectory::from_table(&table).unwrap();

        assert_eq!(dir.len(), 3);
        for info in dir.iter() {
            assert_eq!(dir.by_name(info.name()).unwrap(), info);
            assert_eq!(dir.by_id(info.id()).unwrap(), info);
        }
        assert_eq!(
            dir.iter().map(WorkerInfo::id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn unknown_lookups_report_key() {
        let table = table();
        let dir = WorkerDirectory::from_table(&table).unwrap();

        assert_eq!(
            dir.by_name("missing").unwrap_err(),
            WorkerKey::Name("missing".into())
        );
        assert_eq!(dir.by_id(9).unwrap_err(), WorkerKey::Id(9));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let table = HashMap::from([("a".to_string(), 4), ("b".to_string(), 4)]);
        assert_eq!(
            WorkerDirectory::from_table(&table).unwrap_err(),
            ConfigError::DuplicateWorkerId(4)
        );
    }
}

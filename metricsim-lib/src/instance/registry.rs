use std::{collections::BTreeMap, fmt, sync::Arc};

use parking_lot::RwLock;
use rama::telemetry::tracing;

use super::Instance;

/// Shared mapping of instance name to [`Instance`].
///
/// Mutations take the write side of the lock and never run concurrently
/// with a [`snapshot`](Self::snapshot). The map itself is kept behind an
/// [`Arc`] which is copied on write, so a snapshot is just a reference
/// count bump and stays valid (and unchanged) after the lock is released.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    instances: Arc<RwLock<Arc<BTreeMap<String, Instance>>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `instance` unless an instance with that name already exists.
    pub fn add(&self, name: impl Into<String>, instance: Instance) -> Result<(), RegistryError> {
        let name = name.into();
        let mut guard = self.instances.write();
        if guard.contains_key(&name) {
            return Err(RegistryError::AlreadyExists(name));
        }
        tracing::info!(instance.name = %name, ?instance, "adding instance");
        Arc::make_mut(&mut *guard).insert(name, instance);
        Ok(())
    }

    /// Overwrite the full record of an existing instance.
    pub fn replace(&self, name: &str, instance: Instance) -> Result<(), RegistryError> {
        let mut guard = self.instances.write();
        if !guard.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_owned()));
        }
        tracing::info!(instance.name = %name, ?instance, "updating instance");
        Arc::make_mut(&mut *guard).insert(name.to_owned(), instance);
        Ok(())
    }

    /// Remove an existing instance, returning its last record.
    pub fn remove(&self, name: &str) -> Result<Instance, RegistryError> {
        let mut guard = self.instances.write();
        if !guard.contains_key(name) {
            // avoid the copy-on-write for a miss
            return Err(RegistryError::NotFound(name.to_owned()));
        }
        match Arc::make_mut(&mut *guard).remove(name) {
            Some(instance) => {
                tracing::info!(instance.name = %name, "deleting instance");
                Ok(instance)
            }
            None => Err(RegistryError::NotFound(name.to_owned())),
        }
    }

    pub fn get(&self, name: &str) -> Option<Instance> {
        self.instances.read().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of all instances.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            instances: self.instances.read().clone(),
        }
    }
}

/// Immutable view of the registry as it was when taken.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    instances: Arc<BTreeMap<String, Instance>>,
}

impl RegistrySnapshot {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Instance)> {
        self.instances
            .iter()
            .map(|(name, instance)| (name.as_str(), instance))
    }

    pub fn as_map(&self) -> &BTreeMap<String, Instance> {
        &self.instances
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyExists(String),
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyExists(name) => write!(f, "instance '{name}' already exists"),
            RegistryError::NotFound(name) => write!(f, "instance '{name}' not found"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn instance(latency_min_ms: i64) -> Instance {
        Instance {
            error_pct: Some(1),
            latency_min_ms,
            latency_max_ms: 300,
            latency_offset_ms: Some(0),
        }
    }

    #[test]
    fn test_add_duplicate_keeps_original() {
        let registry = InstanceRegistry::new();
        registry.add("A", instance(100)).unwrap();

        assert_eq!(
            Err(RegistryError::AlreadyExists("A".to_owned())),
            registry.add("A", instance(999))
        );
        assert_eq!(Some(instance(100)), registry.get("A"));
        assert_eq!(1, registry.len());
    }

    #[test]
    fn test_replace_missing_is_not_found() {
        let registry = InstanceRegistry::new();
        registry.add("A", instance(100)).unwrap();

        assert_eq!(
            Err(RegistryError::NotFound("B".to_owned())),
            registry.replace("B", instance(200))
        );
        assert!(registry.get("B").is_none());
        assert_eq!(1, registry.len());

        registry.replace("A", instance(200)).unwrap();
        assert_eq!(Some(instance(200)), registry.get("A"));
    }

    #[test]
    fn test_remove() {
        let registry = InstanceRegistry::new();
        assert_eq!(
            Err(RegistryError::NotFound("A".to_owned())),
            registry.remove("A")
        );
        assert!(registry.is_empty());

        registry.add("A", instance(100)).unwrap();
        assert_eq!(Ok(instance(100)), registry.remove("A"));
        assert!(registry.is_empty());
        assert!(registry.remove("A").is_err());
    }

    #[test]
    fn test_snapshot_isolation() {
        let registry = InstanceRegistry::new();
        registry.add("A", instance(100)).unwrap();

        let snapshot = registry.snapshot();

        registry.add("B", instance(200)).unwrap();
        registry.replace("A", instance(300)).unwrap();

        assert_eq!(1, snapshot.len());
        assert_eq!(Some(&instance(100)), snapshot.get("A"));
        assert!(snapshot.get("B").is_none());

        registry.remove("A").unwrap();
        assert_eq!(Some(&instance(100)), snapshot.get("A"));

        let snapshot = registry.snapshot();
        assert_eq!(
            vec![("B", &instance(200))],
            snapshot.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_operation_sequence_matches_model() {
        #[derive(Debug, Clone, Copy)]
        enum Op {
            Add(&'static str, i64),
            Replace(&'static str, i64),
            Remove(&'static str),
        }

        let ops = [
            Op::Add("A", 1),
            Op::Add("B", 2),
            Op::Add("A", 3),
            Op::Replace("C", 4),
            Op::Remove("B"),
            Op::Remove("B"),
            Op::Replace("A", 5),
            Op::Add("C", 6),
            Op::Add("B", 7),
            Op::Remove("D"),
        ];

        let registry = InstanceRegistry::new();
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Add(name, v) => {
                    let result = registry.add(name, instance(v));
                    if model.contains_key(name) {
                        assert!(result.is_err(), "{op:?}");
                    } else {
                        assert!(result.is_ok(), "{op:?}");
                        model.insert(name, instance(v));
                    }
                }
                Op::Replace(name, v) => {
                    let result = registry.replace(name, instance(v));
                    match model.get_mut(name) {
                        Some(existing) => {
                            assert!(result.is_ok(), "{op:?}");
                            *existing = instance(v);
                        }
                        None => assert!(result.is_err(), "{op:?}"),
                    }
                }
                Op::Remove(name) => {
                    let result = registry.remove(name);
                    assert_eq!(model.remove(name).is_some(), result.is_ok(), "{op:?}");
                }
            }
        }

        let snapshot = registry.snapshot();
        assert_eq!(
            model.keys().copied().collect::<BTreeSet<_>>(),
            snapshot.iter().map(|(name, _)| name).collect::<BTreeSet<_>>()
        );
        for (name, expected) in model {
            assert_eq!(Some(&expected), snapshot.get(name));
        }
    }

    #[test]
    fn test_concurrent_mutations_and_snapshots() {
        let registry = InstanceRegistry::new();

        std::thread::scope(|s| {
            for t in 0..4 {
                let registry = registry.clone();
                s.spawn(move || {
                    for i in 0..100 {
                        let name = format!("{t}-{i}");
                        registry.add(name.clone(), instance(i)).unwrap();
                        registry.replace(&name, instance(i + 1)).unwrap();
                        if i % 2 == 0 {
                            registry.remove(&name).unwrap();
                        }
                    }
                });
            }

            let registry = registry.clone();
            s.spawn(move || {
                for _ in 0..100 {
                    let snapshot = registry.snapshot();
                    assert_eq!(snapshot.len(), snapshot.iter().count());
                }
            });
        });

        assert_eq!(4 * 50, registry.len());
        assert_eq!(Some(instance(2)), registry.get("0-1"));
    }
}

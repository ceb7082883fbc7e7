//! In-memory object store.

use crate::error::{OperatorError, OperatorResult};
use crate::store::{ObjectStore, StoreObject, labels_match};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

type Key = (String, String, String);

fn kind_of<K: StoreObject>() -> String {
    K::kind(&()).into_owned()
}

fn key<K: StoreObject>(namespace: &str, name: &str) -> Key {
    (kind_of::<K>(), namespace.to_string(), name.to_string())
}

fn name_of(value: &Value) -> String {
    value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn resource_version(value: &Value) -> Option<&str> {
    value
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
}

fn finalizers_empty(value: &Value) -> bool {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_none_or(Vec::is_empty)
}

/// Object store keeping objects as JSON in memory.
///
/// Follows the API server rules the controller depends on:
///
/// - `update` and `update_status` fail with a conflict on a stale resourceVersion
/// - `update` keeps the stored status, `update_status` only replaces it
/// - deleting an object with finalizers only marks it; it goes away once an
///   update empties its finalizers
///
/// The `insert`/`fetch`/`modify` helpers bypass those rules so tests can play
/// the part of the kubelet or the StatefulSet controller.
///
/// # Example
///
/// ```
/// use cassandra_operator::testing::MemoryStore;
/// use k8s_openapi::api::core::v1::Pod;
///
/// let store = MemoryStore::new();
/// let mut pod = Pod::default();
/// pod.metadata.name = Some("p".into());
/// store.insert("ns", &pod);
/// assert!(store.fetch::<Pod>("ns", "p").is_some());
/// ```
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<Key, Value>>,
    version: AtomicU64,
    conflicts: Mutex<HashMap<String, usize>>,
    writes: Mutex<HashMap<String, usize>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, value: &mut Value, namespace: &str) {
        let name = name_of(value);
        let meta = &mut value["metadata"];
        meta["namespace"] = json!(namespace);
        meta["resourceVersion"] = json!(self.next_version());
        if meta.get("uid").is_none_or(Value::is_null) {
            meta["uid"] = json!(format!("uid-{namespace}-{name}"));
        }
    }

    fn check_write<K: StoreObject>(&self, stored: &Value, incoming: &Value) -> OperatorResult<()> {
        let kind = kind_of::<K>();
        let conflict = || OperatorError::Conflict {
            kind: kind.clone(),
            name: name_of(incoming),
        };
        if let Some(left) = self.conflicts.lock().get_mut(&kind).filter(|n| **n > 0) {
            *left -= 1;
            return Err(conflict());
        }
        match resource_version(incoming) {
            Some(rv) if Some(rv) != resource_version(stored) => Err(conflict()),
            _ => Ok(()),
        }
    }

    fn count_write<K: StoreObject>(&self) {
        *self.writes.lock().entry(kind_of::<K>()).or_default() += 1;
    }

    /// Store an object as is, replacing any previous one.
    pub fn insert<K: StoreObject>(&self, namespace: &str, obj: &K) -> K {
        let mut value = serde_json::to_value(obj).unwrap_or(Value::Null);
        self.stamp(&mut value, namespace);
        let name = name_of(&value);
        self.objects
            .write()
            .insert(key::<K>(namespace, &name), value.clone());
        serde_json::from_value(value).unwrap_or_else(|_| obj.clone())
    }

    /// Read an object without going through the store rules.
    pub fn fetch<K: StoreObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let value = self.objects.read().get(&key::<K>(namespace, name)).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Every object of a kind in `namespace`, ordered by name.
    pub fn fetch_all<K: StoreObject>(&self, namespace: &str) -> Vec<K> {
        let kind = kind_of::<K>();
        self.objects
            .read()
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Mutate a stored object in place, status included.
    ///
    /// Returns `false` when the object does not exist.
    pub fn modify<K: StoreObject>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) -> bool {
        let Some(mut obj) = self.fetch::<K>(namespace, name) else {
            return false;
        };
        f(&mut obj);
        self.insert(namespace, &obj);
        true
    }

    /// Drop an object, finalizers or not.
    pub fn remove<K: StoreObject>(&self, namespace: &str, name: &str) -> bool {
        self.objects
            .write()
            .remove(&key::<K>(namespace, name))
            .is_some()
    }

    /// Make the next `count` writes of kind `K` fail with a conflict.
    pub fn inject_conflicts<K: StoreObject>(&self, count: usize) {
        self.conflicts.lock().insert(kind_of::<K>(), count);
    }

    /// Successful `update` and `update_status` calls on kind `K`.
    pub fn writes<K: StoreObject>(&self) -> usize {
        self.writes
            .lock()
            .get(&kind_of::<K>())
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> OperatorResult<K> {
        let value = self
            .objects
            .read()
            .get(&key::<K>(namespace, name))
            .cloned()
            .ok_or_else(|| OperatorError::NotFound {
                kind: kind_of::<K>(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;
        Ok(serde_json::from_value(value)?)
    }

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K> {
        let mut value = serde_json::to_value(obj)?;
        let name = name_of(&value);
        let key = key::<K>(namespace, &name);
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind: kind_of::<K>(),
                name,
            });
        }
        if let Some(meta) = value["metadata"].as_object_mut() {
            meta.remove("resourceVersion");
        }
        self.stamp(&mut value, namespace);
        objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn update<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K> {
        let mut value = serde_json::to_value(obj)?;
        let name = name_of(&value);
        let key = key::<K>(namespace, &name);
        let mut objects = self.objects.write();
        let stored = objects.get(&key).ok_or_else(|| OperatorError::NotFound {
            kind: kind_of::<K>(),
            name: name.clone(),
            namespace: namespace.to_string(),
        })?;
        self.check_write::<K>(stored, &value)?;

        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        for field in ["uid", "deletionTimestamp", "creationTimestamp"] {
            if let Some(v) = stored["metadata"].get(field) {
                value["metadata"][field] = v.clone();
            }
        }
        self.stamp(&mut value, namespace);
        self.count_write::<K>();

        if value.pointer("/metadata/deletionTimestamp").is_some() && finalizers_empty(&value) {
            objects.remove(&key);
        } else {
            objects.insert(key, value.clone());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn update_status<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K> {
        let value = serde_json::to_value(obj)?;
        let name = name_of(&value);
        let key = key::<K>(namespace, &name);
        let mut objects = self.objects.write();
        let stored = objects.get_mut(&key).ok_or_else(|| OperatorError::NotFound {
            kind: kind_of::<K>(),
            name: name.clone(),
            namespace: namespace.to_string(),
        })?;
        self.check_write::<K>(stored, &value)?;

        stored["status"] = value.get("status").cloned().unwrap_or(Value::Null);
        stored["metadata"]["resourceVersion"] = json!(self.next_version());
        let updated = stored.clone();
        self.count_write::<K>();
        Ok(serde_json::from_value(updated)?)
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        _grace_period: Option<u32>,
    ) -> OperatorResult<()> {
        let key = key::<K>(namespace, name);
        let mut objects = self.objects.write();
        let Some(stored) = objects.get_mut(&key) else {
            return Err(OperatorError::NotFound {
                kind: kind_of::<K>(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        };
        if finalizers_empty(stored) {
            objects.remove(&key);
        } else if stored.pointer("/metadata/deletionTimestamp").is_none() {
            stored["metadata"]["deletionTimestamp"] = json!(chrono::Utc::now().to_rfc3339());
            stored["metadata"]["resourceVersion"] = json!(self.next_version());
        }
        Ok(())
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<K>> {
        let kind = kind_of::<K>();
        let objects = self.objects.read();
        let mut out = Vec::new();
        for ((k, ns, _), value) in objects.iter() {
            if *k != kind || ns != namespace {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if labels_match(obj.meta().labels.as_ref(), selector) {
                out.push(obj);
            }
        }
        Ok(out)
    }
}

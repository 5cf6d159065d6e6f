use crate::{
    resolver::{self, Resolution},
    snapshot::{Bucket, Grant, Reader, Snapshot},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use rbac_policy_core::{
    EventType, Kind, Object, ObjectKey, PolicyRule, Record, Role, RoleBinding, StoreError,
    WatchEvent,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info, trace};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Maintains the resolved grants for every role binding and publishes a new [`Snapshot`] each
/// time they change.
///
/// Each role event re-resolves the bindings that reference the role; each binding event
/// re-resolves only that binding. Buckets that an update does not touch are shared with the
/// previous snapshot.
#[derive(Debug)]
pub struct Index {
    roles: HashMap<ObjectKey, IndexedRole>,
    bindings: HashMap<ObjectKey, IndexedBinding>,

    /// Maps each role to the bindings that reference it, whether or not the role exists.
    dependents: HashMap<ObjectKey, HashSet<ObjectKey>>,

    synced: HashSet<Kind>,
    state: Snapshot,
    tx: watch::Sender<Arc<Snapshot>>,
}

#[derive(Debug)]
struct IndexedRole {
    version: Option<String>,
    rules: Arc<[PolicyRule]>,
}

#[derive(Debug)]
struct IndexedBinding {
    version: Option<String>,
    binding: RoleBinding,
    resolved: bool,
}

/// Resolves role references against the roles currently held by the index.
struct Roles<'a>(&'a HashMap<ObjectKey, IndexedRole>);

// === impl Index ===

impl Index {
    pub fn new() -> (Self, Reader) {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::default()));
        let index = Self {
            roles: HashMap::new(),
            bindings: HashMap::new(),
            dependents: HashMap::new(),
            synced: HashSet::new(),
            state: Snapshot::default(),
            tx,
        };
        (index, Reader::new(rx))
    }

    pub fn shared() -> (SharedIndex, Reader) {
        let (index, reader) = Self::new();
        (Arc::new(RwLock::new(index)), reader)
    }

    pub fn reader(&self) -> Reader {
        Reader::new(self.tx.subscribe())
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn is_synced(&self) -> bool {
        self.state.synced
    }

    /// The number of indexed records of `kind` in `namespace` (`None` for cluster scope).
    pub fn len(&self, kind: Kind, namespace: Option<&str>) -> usize {
        match kind {
            Kind::Role => self
                .roles
                .keys()
                .filter(|k| k.namespace.as_deref() == namespace)
                .count(),
            Kind::RoleBinding => self
                .bindings
                .keys()
                .filter(|k| k.namespace.as_deref() == namespace)
                .count(),
        }
    }

    pub fn apply(&mut self, object: Object) -> bool {
        match object {
            Object::Role(role) => self.apply_role(role),
            Object::RoleBinding(binding) => self.apply_binding(binding),
        }
    }

    pub fn delete(&mut self, key: &ObjectKey) -> bool {
        match key.kind {
            Kind::Role => self.delete_role(key),
            Kind::RoleBinding => self.delete_binding(key),
        }
    }

    pub fn apply_role(&mut self, role: Role) -> bool {
        let changed = self.insert_role(role);
        self.publish_if(changed)
    }

    pub fn delete_role(&mut self, key: &ObjectKey) -> bool {
        let changed = self.remove_role(key);
        self.publish_if(changed)
    }

    pub fn apply_binding(&mut self, binding: RoleBinding) -> bool {
        let changed = self.insert_binding(binding);
        self.publish_if(changed)
    }

    pub fn delete_binding(&mut self, key: &ObjectKey) -> bool {
        let changed = self.remove_binding(key);
        self.publish_if(changed)
    }

    /// Applies a single watch event, recording its version.
    pub fn apply_event(&mut self, event: WatchEvent) -> bool {
        let kind = event.object.kind();
        self.state.versions.insert(kind, event.resource_version);
        let changed = match event.event_type {
            EventType::Added | EventType::Modified => match event.object {
                Object::Role(role) => self.insert_role(role),
                Object::RoleBinding(binding) => self.insert_binding(binding),
            },
            EventType::Deleted => {
                let key = event.object.key();
                match kind {
                    Kind::Role => self.remove_role(&key),
                    Kind::RoleBinding => self.remove_binding(&key),
                }
            }
        };
        self.publish_if(changed)
    }

    /// Replaces every record of `kind` with `items`, as listed at `version`.
    ///
    /// Records absent from `items` are removed. The first reset of each kind marks it synced; once
    /// every kind is synced, snapshots report [`Snapshot::is_synced`].
    pub fn reset(&mut self, kind: Kind, items: Vec<Object>, version: String) -> bool {
        let live = items.iter().map(Object::key).collect::<HashSet<_>>();
        let stale = match kind {
            Kind::Role => stale_keys(self.roles.keys(), &live),
            Kind::RoleBinding => stale_keys(self.bindings.keys(), &live),
        };

        let mut changed = false;
        for key in &stale {
            debug!(%key, "Removing stale record");
            changed |= match kind {
                Kind::Role => self.remove_role(key),
                Kind::RoleBinding => self.remove_binding(key),
            };
        }
        for object in items.into_iter().filter(|o| o.kind() == kind) {
            changed |= match object {
                Object::Role(role) => self.insert_role(role),
                Object::RoleBinding(binding) => self.insert_binding(binding),
            };
        }

        self.state.versions.insert(kind, version);
        changed |= self.state.disconnected.remove(&kind).is_some();
        if self.synced.insert(kind) {
            debug!(%kind, "Synced");
            if Kind::ALL.iter().all(|k| self.synced.contains(k)) {
                info!("Policy index synced");
                self.state.synced = true;
                changed = true;
            }
        }
        self.publish_if(changed)
    }

    /// Records that `kind` could not be listed.
    ///
    /// Until the index syncs, the error is published so that readers can fail fast instead of
    /// waiting on a store that cannot be reached. Once synced, readers keep the last snapshot and
    /// the error is not recorded.
    pub fn set_disconnected(&mut self, kind: Kind, error: &StoreError) -> bool {
        if self.state.synced {
            return false;
        }
        let error = error.to_string();
        if self.state.disconnected.get(&kind) == Some(&error) {
            return false;
        }
        debug!(%kind, %error, "Unsynced kind disconnected");
        self.state.disconnected.insert(kind, error);
        self.publish_if(true)
    }

    fn publish_if(&mut self, changed: bool) -> bool {
        if changed {
            self.state.generation += 1;
            self.tx.send_replace(Arc::new(self.state.clone()));
        }
        changed
    }

    fn insert_role(&mut self, role: Role) -> bool {
        let key = role.key();
        let version = role.resource_version().map(Into::into);
        if let Some(current) = self.roles.get(&key) {
            if version.is_some() && current.version == version {
                return false;
            }
        }

        self.roles.insert(
            key.clone(),
            IndexedRole {
                version,
                rules: role.rules.into(),
            },
        );
        self.resolve_dependents(&key);
        true
    }

    fn remove_role(&mut self, key: &ObjectKey) -> bool {
        if self.roles.remove(key).is_none() {
            return false;
        }
        self.resolve_dependents(key);
        true
    }

    fn insert_binding(&mut self, binding: RoleBinding) -> bool {
        let key = binding.key();
        let version = binding.resource_version().map(Into::into);
        if let Some(current) = self.bindings.get(&key) {
            if version.is_some() && current.version == version {
                return false;
            }
            let role = current.binding.role_key();
            if role != binding.role_key() {
                self.forget_dependent(&role, &key);
            }
        }
        let resolved = self.bindings.get(&key).is_some_and(|b| b.resolved);

        self.dependents
            .entry(binding.role_key())
            .or_default()
            .insert(key.clone());
        self.bindings.insert(
            key.clone(),
            IndexedBinding {
                version,
                binding,
                resolved,
            },
        );
        self.resolve_binding(&key);
        true
    }

    fn remove_binding(&mut self, key: &ObjectKey) -> bool {
        let Some(indexed) = self.bindings.remove(key) else {
            return false;
        };
        self.forget_dependent(&indexed.binding.role_key(), key);
        if indexed.resolved {
            self.update_bucket(key.namespace.as_deref(), |bucket| bucket.remove(&key.name));
        }
        if self.state.unresolved.contains_key(key) {
            Arc::make_mut(&mut self.state.unresolved).remove(key);
        }
        true
    }

    fn forget_dependent(&mut self, role: &ObjectKey, binding: &ObjectKey) {
        if let Some(bindings) = self.dependents.get_mut(role) {
            bindings.remove(binding);
            if bindings.is_empty() {
                self.dependents.remove(role);
            }
        }
    }

    fn resolve_dependents(&mut self, role: &ObjectKey) {
        let bindings = match self.dependents.get(role) {
            Some(bindings) => bindings.iter().cloned().collect::<Vec<_>>(),
            None => return,
        };
        for binding in bindings {
            self.resolve_binding(&binding);
        }
    }

    /// Recomputes the grant for an indexed binding and updates its bucket.
    fn resolve_binding(&mut self, key: &ObjectKey) {
        let Some(indexed) = self.bindings.get(key) else {
            return;
        };
        let resolution = resolver::resolve(&indexed.binding, &Roles(&self.roles));
        let was_resolved = indexed.resolved;

        match resolution {
            Resolution::Resolved(resolved) => {
                if self.state.unresolved.contains_key(key) {
                    info!(binding = %key, role = %resolved.role, "Binding resolved");
                    Arc::make_mut(&mut self.state.unresolved).remove(key);
                }
                let grant = Grant {
                    binding: key.name.clone(),
                    namespace: resolved.scope,
                    role: resolved.role,
                    subjects: resolved.subjects,
                    rules: resolved.rules,
                };
                self.update_bucket(key.namespace.as_deref(), move |bucket| {
                    bucket.insert(grant);
                    true
                });
                self.set_resolved(key, true);
            }
            Resolution::Unresolved { role } => {
                if self.state.unresolved.get(key) != Some(&role) {
                    info!(binding = %key, %role, "Binding references a missing role");
                    Arc::make_mut(&mut self.state.unresolved).insert(key.clone(), role);
                }
                if was_resolved {
                    self.update_bucket(key.namespace.as_deref(), |bucket| {
                        bucket.remove(&key.name)
                    });
                }
                self.set_resolved(key, false);
            }
        }
    }

    fn set_resolved(&mut self, key: &ObjectKey, resolved: bool) {
        if let Some(indexed) = self.bindings.get_mut(key) {
            indexed.resolved = resolved;
        }
    }

    /// Mutates the bucket for `namespace`, copying it first if a published snapshot shares it.
    /// Empty namespace buckets are dropped.
    fn update_bucket(&mut self, namespace: Option<&str>, f: impl FnOnce(&mut Bucket) -> bool) {
        match namespace {
            None => {
                if f(Arc::make_mut(&mut self.state.cluster)) {
                    trace_bucket(None, &self.state.cluster);
                }
            }
            Some(ns) => {
                let bucket = self.state.namespaces.entry(ns.to_string()).or_default();
                if f(Arc::make_mut(bucket)) {
                    trace_bucket(Some(ns), bucket);
                }
                if bucket.is_empty() {
                    self.state.namespaces.remove(ns);
                }
            }
        }
    }
}

fn stale_keys<'a>(
    keys: impl Iterator<Item = &'a ObjectKey>,
    live: &HashSet<ObjectKey>,
) -> Vec<ObjectKey> {
    keys.filter(|k| !live.contains(*k)).cloned().collect()
}

fn trace_bucket(namespace: Option<&str>, bucket: &Bucket) {
    trace!(
        namespace = namespace.unwrap_or_default(),
        grants = bucket.len(),
        "Updated bucket"
    );
}

// === impl Roles ===

impl resolver::RoleLookup for Roles<'_> {
    fn rules(&self, role: &ObjectKey) -> Option<Arc<[PolicyRule]>> {
        self.0.get(role).map(|r| r.rules.clone())
    }
}

/// Counts the unresolved bindings per namespace, for metrics.
pub(crate) fn unresolved_by_namespace(snapshot: &Snapshot) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for (binding, _) in snapshot.unresolved() {
        *counts
            .entry(binding.namespace.as_deref().unwrap_or_default())
            .or_default() += 1;
    }
    counts
}

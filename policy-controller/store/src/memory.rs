use parking_lot::Mutex;
use rbac_policy_core::{
    EventType, Kind, List, Object, ObjectKey, PolicyStore, StoreError, WatchEvent, WatchStream,
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

#[derive(Clone, Debug)]
pub struct MemoryStoreConfig {
    /// The number of past events retained to serve resumed watches. Watches resuming from an
    /// older version fail with `Expired`.
    pub history: usize,

    /// The number of live events buffered per watcher before it is considered lagging.
    pub broadcast_capacity: usize,
}

/// An in-memory, revisioned policy store.
///
/// A single revision counter is bumped on every write and stamped as the written record's
/// `resourceVersion`, so versions are totally ordered across kinds.
#[derive(Clone, Debug)]
pub struct MemoryStore(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notices: broadcast::Sender<Notice>,
    history_limit: usize,
}

#[derive(Debug)]
struct State {
    revision: u64,
    available: bool,
    objects: BTreeMap<ObjectKey, Object>,
    history: VecDeque<Revisioned>,

    /// Events at or below this revision have been dropped from `history`.
    compacted: u64,
}

#[derive(Clone, Debug)]
struct Revisioned {
    revision: u64,
    event: WatchEvent,
}

#[derive(Clone, Debug)]
enum Notice {
    Event(Revisioned),
    Outage,
}

// === impl MemoryStoreConfig ===

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            history: 1024,
            broadcast_capacity: 256,
        }
    }
}

// === impl MemoryStore ===

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let (notices, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self(Arc::new(Inner {
            state: Mutex::new(State {
                revision: 0,
                available: true,
                objects: BTreeMap::new(),
                history: VecDeque::new(),
                compacted: 0,
            }),
            notices,
            history_limit: config.history,
        }))
    }

    /// Simulates losing (or regaining) the connection to the backend.
    ///
    /// While unavailable every call fails with `Unavailable`. Going unavailable also terminates
    /// all open watches.
    pub fn set_available(&self, available: bool) {
        let mut state = self.0.state.lock();
        if state.available == available {
            return;
        }
        state.available = available;
        if available {
            info!("Store available");
        } else {
            info!("Store unavailable");
            let _ = self.0.notices.send(Notice::Outage);
        }
    }

    /// The current store revision.
    pub fn revision(&self) -> String {
        self.0.state.lock().revision.to_string()
    }

    /// Subscribes to live events and collects the retained events after `since`.
    ///
    /// Both happen under the state lock so that no event falls between the backlog and the live
    /// subscription.
    fn start_watch(
        &self,
        kind: Kind,
        since: Option<&str>,
    ) -> Result<(broadcast::Receiver<Notice>, Vec<WatchEvent>, u64), StoreError> {
        let state = self.0.state.lock();
        state.check_available()?;

        let since = match since {
            None => state.revision,
            Some(v) => match v.parse::<u64>() {
                Ok(since) if since >= state.compacted && since <= state.revision => since,
                _ => return Err(StoreError::Expired(v.to_string())),
            },
        };

        let backlog = state
            .history
            .iter()
            .filter(|r| r.revision > since && r.event.object.kind() == kind)
            .map(|r| r.event.clone())
            .collect::<Vec<_>>();
        trace!(%kind, since, backlog = backlog.len(), "Starting watch");

        Ok((self.0.notices.subscribe(), backlog, state.revision))
    }

    fn commit(&self, state: &mut State, event_type: EventType, object: Object) -> Object {
        let rev = state.commit(event_type, object, self.0.history_limit);
        let object = rev.event.object.clone();
        debug!(key = %object.key(), version = rev.revision, ?event_type, "Committed");
        let _ = self.0.notices.send(Notice::Event(rev));
        object
    }
}

#[async_trait::async_trait]
impl PolicyStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Object, StoreError> {
        let state = self.0.state.lock();
        state.check_available()?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<List, StoreError> {
        let state = self.0.state.lock();
        state.check_available()?;
        let items = state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .map(|(_, object)| object.clone())
            .collect();
        Ok(List {
            items,
            resource_version: state.revision.to_string(),
        })
    }

    async fn create(&self, object: Object) -> Result<Object, StoreError> {
        let mut state = self.0.state.lock();
        state.check_available()?;

        let key = object.key();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        let object = self.commit(&mut state, EventType::Added, object);
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(&self, object: Object) -> Result<Object, StoreError> {
        let mut state = self.0.state.lock();
        state.check_available()?;

        let key = object.key();
        let current = match state.objects.get(&key) {
            Some(current) => current.resource_version().unwrap_or_default().to_string(),
            None => return Err(StoreError::NotFound(key)),
        };
        if object.resource_version() != Some(current.as_str()) {
            return Err(StoreError::Conflict {
                key,
                expected: object.resource_version().map(Into::into),
                current,
            });
        }

        let object = self.commit(&mut state, EventType::Modified, object);
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.0.state.lock();
        state.check_available()?;

        let object = state
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        self.commit(&mut state, EventType::Deleted, object);
        Ok(())
    }

    fn watch(&self, kind: Kind, since: Option<String>) -> WatchStream {
        // Subscribe before returning so that writes made before the stream is first polled are
        // still observed.
        let start = self.start_watch(kind, since.as_deref());
        Box::pin(async_stream::stream! {
            let (mut notices, backlog, mut last) = match start {
                Ok(start) => start,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            for event in backlog {
                yield Ok(event);
            }

            loop {
                match notices.recv().await {
                    Ok(Notice::Event(rev)) => {
                        if rev.revision <= last || rev.event.object.kind() != kind {
                            continue;
                        }
                        last = rev.revision;
                        yield Ok(rev.event);
                    }
                    Ok(Notice::Outage) => {
                        yield Err(StoreError::Unavailable("connection lost".to_string()));
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%kind, skipped, "Watch lagged");
                        yield Err(StoreError::Expired(last.to_string()));
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        yield Err(StoreError::Unavailable("store closed".to_string()));
                        return;
                    }
                }
            }
        })
    }
}

// === impl State ===

impl State {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.available {
            return Ok(());
        }
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn commit(&mut self, event_type: EventType, mut object: Object, limit: usize) -> Revisioned {
        self.revision += 1;
        let resource_version = self.revision.to_string();
        object.meta_mut().resource_version = Some(resource_version.clone());
        let rev = Revisioned {
            revision: self.revision,
            event: WatchEvent {
                event_type,
                object,
                resource_version,
            },
        };

        if limit == 0 {
            self.compacted = self.revision;
            return rev;
        }
        while self.history.len() >= limit {
            if let Some(old) = self.history.pop_front() {
                self.compacted = old.revision;
            }
        }
        self.history.push_back(rev.clone());
        rev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::prelude::*;
    use rbac_policy_core::{PolicyRule, Record, Role, RoleBinding, RoleRef, Subject};
    use tokio::time;

    fn mk_role(name: &str) -> Object {
        Role::cluster(name, [PolicyRule::resources(["get"], ["pods"])]).into()
    }

    fn mk_binding(ns: &str, name: &str) -> Object {
        RoleBinding::namespaced(ns, name, RoleRef::cluster("r"), [Subject::user("u")]).into()
    }

    async fn next(watch: &mut WatchStream) -> Result<WatchEvent, StoreError> {
        time::timeout(time::Duration::from_secs(1), watch.next())
            .await
            .expect("watch must yield an event")
            .expect("watch must not end without an error")
    }

    #[tokio::test]
    async fn writes_bump_resource_versions() {
        let store = MemoryStore::default();
        let created = store.create(mk_role("r")).await.unwrap();
        assert_eq!(created.resource_version(), Some("1"));

        let err = store.create(mk_role("r")).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(created.key()));
        assert!(err.is_conflict());

        let updated = store.update(created.clone()).await.unwrap();
        assert_eq!(updated.resource_version(), Some("2"));
        assert_eq!(store.get(&created.key()).await.unwrap(), updated);
        assert_eq!(store.revision(), "2");
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let store = MemoryStore::default();
        let created = store.create(mk_role("r")).await.unwrap();
        store.update(created.clone()).await.unwrap();

        let err = store.update(created.clone()).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                key: created.key(),
                expected: Some("1".to_string()),
                current: "2".to_string(),
            }
        );

        let mut unversioned = created;
        unversioned.meta_mut().resource_version = None;
        assert!(store.update(unversioned).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let store = MemoryStore::default();
        let key = ObjectKey::role(None, "r");
        assert!(store.get(&key).await.unwrap_err().is_not_found());
        assert!(store.delete(&key).await.unwrap_err().is_not_found());
        assert!(store.update(mk_role("r")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_namespace() {
        let store = MemoryStore::default();
        store.create(mk_role("r")).await.unwrap();
        store.create(mk_binding("ns-0", "b0")).await.unwrap();
        store.create(mk_binding("ns-1", "b1")).await.unwrap();

        let all = store.list(Kind::RoleBinding, None).await.unwrap();
        assert_eq!(all.items.len(), 2);
        assert_eq!(all.resource_version, "3");

        let ns0 = store.list(Kind::RoleBinding, Some("ns-0")).await.unwrap();
        let names = ns0
            .items
            .into_iter()
            .filter_map(RoleBinding::from_object)
            .map(|b| b.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["b0"]);

        let roles = store.list(Kind::Role, None).await.unwrap();
        assert_eq!(roles.items.len(), 1);
    }

    #[tokio::test]
    async fn watch_delivers_events_of_one_kind() {
        let store = MemoryStore::default();
        let mut watch = store.watch(Kind::Role, None);

        let role = store.create(mk_role("r")).await.unwrap();
        store.create(mk_binding("ns-0", "b")).await.unwrap();
        store.delete(&role.key()).await.unwrap();

        let ev = next(&mut watch).await.unwrap();
        assert_eq!(ev.event_type, EventType::Added);
        assert_eq!(ev.resource_version, "1");
        assert_eq!(ev.object, role);

        let ev = next(&mut watch).await.unwrap();
        assert_eq!(ev.event_type, EventType::Deleted);
        assert_eq!(ev.resource_version, "3");
        assert_eq!(ev.object.key(), role.key());
    }

    #[tokio::test]
    async fn watch_resumes_from_version() {
        let store = MemoryStore::default();
        store.create(mk_role("a")).await.unwrap();
        let list = store.list(Kind::Role, None).await.unwrap();
        store.create(mk_role("b")).await.unwrap();
        store.create(mk_role("c")).await.unwrap();

        let mut watch = store.watch(Kind::Role, Some(list.resource_version));
        assert_eq!(next(&mut watch).await.unwrap().object.key().name, "b");
        assert_eq!(next(&mut watch).await.unwrap().object.key().name, "c");

        store.create(mk_role("d")).await.unwrap();
        assert_eq!(next(&mut watch).await.unwrap().object.key().name, "d");
    }

    #[tokio::test]
    async fn watch_from_compacted_version_expires() {
        let store = MemoryStore::new(MemoryStoreConfig {
            history: 2,
            ..Default::default()
        });
        for name in ["a", "b", "c", "d"] {
            store.create(mk_role(name)).await.unwrap();
        }

        let mut watch = store.watch(Kind::Role, Some("1".to_string()));
        assert!(next(&mut watch).await.unwrap_err().is_expired());
        assert!(watch.next().await.is_none());

        let mut watch = store.watch(Kind::Role, Some("2".to_string()));
        assert_eq!(next(&mut watch).await.unwrap().object.key().name, "c");
        assert_eq!(next(&mut watch).await.unwrap().object.key().name, "d");
    }

    #[tokio::test]
    async fn outage_fails_calls_and_terminates_watches() {
        let store = MemoryStore::default();
        let mut watch = store.watch(Kind::Role, None);

        store.set_available(false);
        assert!(next(&mut watch).await.unwrap_err().is_unavailable());
        assert!(watch.next().await.is_none());
        assert!(store
            .list(Kind::Role, None)
            .await
            .unwrap_err()
            .is_unavailable());
        assert!(store.create(mk_role("r")).await.unwrap_err().is_unavailable());

        let mut watch = store.watch(Kind::Role, None);
        assert!(next(&mut watch).await.unwrap_err().is_unavailable());

        store.set_available(true);
        store.create(mk_role("r")).await.unwrap();
    }
}

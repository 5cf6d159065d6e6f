use ahash::AHashMap as HashMap;
use rbac_policy_core::{Kind, ObjectKey, PolicyRule, Subject, UserInfo};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;

/// An immutable view of every resolved grant, as of a single index generation.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub(crate) generation: u64,
    pub(crate) synced: bool,
    pub(crate) versions: BTreeMap<Kind, String>,
    pub(crate) cluster: Arc<Bucket>,
    pub(crate) namespaces: HashMap<String, Arc<Bucket>>,

    /// Maps each unresolved binding to the role it references.
    pub(crate) unresolved: Arc<BTreeMap<ObjectKey, ObjectKey>>,

    /// The last list error for each kind that has not yet synced.
    pub(crate) disconnected: BTreeMap<Kind, String>,
}

/// The grants that apply within a single scope, indexed by subject.
#[derive(Clone, Debug, Default)]
pub struct Bucket {
    grants: HashMap<String, Arc<Grant>>,
    by_subject: HashMap<Subject, Vec<Arc<Grant>>>,
}

/// The rules one binding grants to its subjects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub binding: String,
    pub namespace: Option<String>,
    pub role: ObjectKey,
    pub subjects: Vec<Subject>,
    pub rules: Arc<[PolicyRule]>,
}

/// Observes the snapshots published by an [`Index`](crate::Index).
#[derive(Clone, Debug)]
pub struct Reader(watch::Receiver<Arc<Snapshot>>);

/// The index has been dropped.
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("policy index closed")]
pub struct Closed(());

// === impl Snapshot ===

impl Snapshot {
    /// Incremented each time the index publishes a changed view.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Indicates whether every kind has been listed at least once.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// The first kind that has failed to list before the index synced, with the error that the
    /// store reported. Always `None` once synced.
    pub fn disconnected(&self) -> Option<(Kind, &str)> {
        self.disconnected
            .iter()
            .next()
            .map(|(kind, error)| (*kind, error.as_str()))
    }

    /// The last store version observed for `kind`.
    pub fn version(&self, kind: Kind) -> Option<&str> {
        self.versions.get(&kind).map(String::as_str)
    }

    pub fn cluster(&self) -> &Bucket {
        &self.cluster
    }

    pub fn namespace(&self, namespace: &str) -> Option<&Bucket> {
        self.namespaces.get(namespace).map(|b| &**b)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = (&str, &Bucket)> + '_ {
        self.namespaces.iter().map(|(ns, b)| (ns.as_str(), &**b))
    }

    /// Iterates over `(binding, role)` pairs for bindings whose role could not be found.
    pub fn unresolved(&self) -> impl Iterator<Item = (&ObjectKey, &ObjectKey)> + '_ {
        self.unresolved.iter()
    }

    /// Iterates over every grant that may apply to `user`: cluster grants first, then grants in
    /// `namespace`.
    pub fn candidates<'a>(
        &'a self,
        user: &UserInfo,
        namespace: Option<&str>,
    ) -> impl Iterator<Item = &'a Grant> + 'a {
        let subjects = user.subjects();
        let ns = namespace.and_then(|ns| self.namespace(ns));
        let bucket = self.cluster();
        let cluster = subjects
            .clone()
            .into_iter()
            .flat_map(move |s| bucket.grants_for(&s).iter().map(|g| &**g));
        let namespaced = ns.into_iter().flat_map(move |bucket| {
            subjects
                .clone()
                .into_iter()
                .flat_map(move |s| bucket.grants_for(&s).iter().map(|g| &**g))
        });
        cluster.chain(namespaced)
    }
}

// === impl Bucket ===

impl Bucket {
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn get(&self, binding: &str) -> Option<&Grant> {
        self.grants.get(binding).map(|g| &**g)
    }

    /// Grants that name `subject`, ordered by binding name.
    pub fn grants_for(&self, subject: &Subject) -> &[Arc<Grant>] {
        self.by_subject
            .get(subject)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn insert(&mut self, grant: Grant) {
        self.remove(&grant.binding);
        let grant = Arc::new(grant);
        for subject in &grant.subjects {
            let grants = self.by_subject.entry(subject.clone()).or_default();
            let i = grants.partition_point(|g| g.binding < grant.binding);
            grants.insert(i, grant.clone());
        }
        self.grants.insert(grant.binding.clone(), grant);
    }

    pub(crate) fn remove(&mut self, binding: &str) -> bool {
        let Some(grant) = self.grants.remove(binding) else {
            return false;
        };
        for subject in &grant.subjects {
            if let Some(grants) = self.by_subject.get_mut(subject) {
                grants.retain(|g| g.binding != binding);
                if grants.is_empty() {
                    self.by_subject.remove(subject);
                }
            }
        }
        true
    }
}

// === impl Reader ===

impl Reader {
    pub(crate) fn new(rx: watch::Receiver<Arc<Snapshot>>) -> Self {
        Self(rx)
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.0.borrow().clone()
    }

    /// Indicates the index has been dropped and no further updates will be published.
    pub fn is_closed(&self) -> bool {
        self.0.has_changed().is_err()
    }

    /// Waits for the first snapshot to satisfy `f`.
    ///
    /// The current snapshot is checked first, even if the index has already been dropped.
    pub async fn wait_for(
        &mut self,
        mut f: impl FnMut(&Snapshot) -> bool,
    ) -> Result<Arc<Snapshot>, Closed> {
        let snapshot = self.0.wait_for(|s| f(&**s)).await.map_err(|_| Closed(()))?;
        Ok(snapshot.clone())
    }

    pub async fn synced(&mut self) -> Result<Arc<Snapshot>, Closed> {
        self.wait_for(Snapshot::is_synced).await
    }

    /// Waits for a snapshot newer than `generation`.
    pub async fn changed_since(&mut self, generation: u64) -> Result<Arc<Snapshot>, Closed> {
        self.wait_for(|s| s.generation > generation).await
    }
}

impl From<watch::Receiver<Arc<Snapshot>>> for Reader {
    fn from(rx: watch::Receiver<Arc<Snapshot>>) -> Self {
        Self::new(rx)
    }
}

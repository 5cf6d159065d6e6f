use rbac_policy_core::{
    validation, Kind, List, Object, ObjectKey, PolicyStore, StoreError, WatchStream,
};
use tracing::debug;

/// Rejects invalid records before they are written to the inner store.
#[derive(Clone, Debug)]
pub struct ValidatingStore<S> {
    inner: S,
}

impl<S> ValidatingStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn admit(object: &Object) -> Result<(), StoreError> {
        validation::validate(object).map_err(|error| {
            debug!(%error, "Rejected");
            StoreError::from(error)
        })
    }
}

#[async_trait::async_trait]
impl<S: PolicyStore> PolicyStore for ValidatingStore<S> {
    async fn get(&self, key: &ObjectKey) -> Result<Object, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<List, StoreError> {
        self.inner.list(kind, namespace).await
    }

    async fn create(&self, object: Object) -> Result<Object, StoreError> {
        Self::admit(&object)?;
        self.inner.create(object).await
    }

    async fn update(&self, object: Object) -> Result<Object, StoreError> {
        Self::admit(&object)?;
        self.inner.update(object).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    fn watch(&self, kind: Kind, since: Option<String>) -> WatchStream {
        self.inner.watch(kind, since)
    }
}

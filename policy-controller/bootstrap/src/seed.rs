use crate::PolicyDocument;
use rbac_policy_core::{Object, PolicyStore, StoreError};
use tracing::{debug, info, instrument};

/// The number of times a record is re-read and rewritten after losing a race with another writer.
const MAX_CONFLICT_RETRIES: usize = 5;

/// Writes every record of `doc` to `store`.
///
/// Without `overwrite`, records are only created if absent, and the result indicates whether any
/// record was created. With `overwrite`, each record replaces any existing record with the same
/// key and the result is always `true`.
#[instrument(skip_all, fields(records = doc.len(), overwrite))]
pub async fn seed<S>(store: &S, doc: &PolicyDocument, overwrite: bool) -> Result<bool, StoreError>
where
    S: PolicyStore + ?Sized,
{
    let mut written = false;
    for object in doc.objects() {
        if overwrite {
            replace(store, object).await?;
            written = true;
        } else {
            written |= create_if_absent(store, object).await?;
        }
    }

    info!(written, "Seeded bootstrap policy");
    Ok(written || overwrite)
}

async fn create_if_absent<S>(store: &S, mut object: Object) -> Result<bool, StoreError>
where
    S: PolicyStore + ?Sized,
{
    let key = object.key();
    object.meta_mut().resource_version = None;
    match store.create(object).await {
        Ok(_) => {
            debug!(%key, "Created");
            Ok(true)
        }
        Err(StoreError::AlreadyExists(_)) => {
            debug!(%key, "Keeping existing record");
            Ok(false)
        }
        Err(error) => Err(error),
    }
}

async fn replace<S>(store: &S, object: Object) -> Result<(), StoreError>
where
    S: PolicyStore + ?Sized,
{
    let key = object.key();
    let mut attempt = 0;
    loop {
        let mut desired = object.clone();
        let res = match store.get(&key).await {
            Ok(current) => {
                desired.meta_mut().resource_version = current.resource_version().map(Into::into);
                store.update(desired).await.map(|_| ())
            }
            Err(StoreError::NotFound(_)) => {
                desired.meta_mut().resource_version = None;
                store.create(desired).await.map(|_| ())
            }
            Err(error) => return Err(error),
        };

        match res {
            Ok(()) => {
                debug!(%key, "Replaced");
                return Ok(());
            }
            // The record changed (or was created or deleted) since it was read.
            Err(error)
                if (error.is_conflict() || error.is_not_found())
                    && attempt < MAX_CONFLICT_RETRIES =>
            {
                attempt += 1;
                debug!(%key, %error, attempt, "Retrying");
            }
            Err(error) => return Err(error),
        }
    }
}

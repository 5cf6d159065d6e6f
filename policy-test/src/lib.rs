#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use rbac_policy_authz as authz;
pub use rbac_policy_bootstrap as bootstrap;
pub use rbac_policy_core as core;
pub use rbac_policy_index as index;
pub use rbac_policy_store as store;

use self::{
    authz::{
        AccessReviews, Authorizer, Decision, ReviewConfig, ReviewError, ReviewRequest,
        ReviewResponse,
    },
    bootstrap::PolicyDocument,
    core::{Attributes, PolicyStore, UserInfo, AUTHENTICATED_GROUP},
    index::{Index, IndexConfig, IndexMetrics, Reader},
    store::{MemoryStore, ValidatingStore},
};
use std::{future::Future, sync::Arc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How long a test waits for the index to reflect a store write.
pub const TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// A running control plane: a store seeded with the default policy, an index watching it, and
/// the authorizer and review service reading from the index.
#[derive(Clone)]
pub struct ControlPlane {
    /// The unvalidated backend, for fault injection.
    pub backend: MemoryStore,

    /// The validating store that every write goes through.
    pub store: Arc<dyn PolicyStore>,

    pub reader: Reader,
    pub authorizer: Authorizer,
    pub reviews: AccessReviews,
}

/// Runs a test against a freshly seeded control plane that is shut down on test completion.
pub async fn with_control_plane<F, Fut>(test: F)
where
    F: FnOnce(ControlPlane) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let _tracing = init_tracing();

    let backend = MemoryStore::default();
    let store: Arc<dyn PolicyStore> = Arc::new(ValidatingStore::new(backend.clone()));

    tracing::debug!("seeding");
    let doc = PolicyDocument::default_policy().expect("default policy must parse");
    bootstrap::seed(&*store, &doc, false)
        .await
        .expect("failed to seed the default policy");

    let (index, mut reader) = Index::shared();
    let (drain_tx, drain_rx) = drain::channel();

    tracing::debug!("spawning watches");
    let watches = index::spawn_watches(
        store.clone(),
        index,
        IndexMetrics::default(),
        IndexConfig {
            min_backoff: time::Duration::from_millis(10),
            max_backoff: time::Duration::from_millis(100),
        },
        drain_rx,
    );

    time::timeout(TIMEOUT, reader.synced())
        .await
        .expect("timed out waiting for the index to sync")
        .expect("index closed");

    let authorizer = Authorizer::new(reader.clone());
    let control_plane = ControlPlane {
        backend,
        store,
        reviews: AccessReviews::new(authorizer.clone(), ReviewConfig::default()),
        authorizer,
        reader,
    };

    tracing::trace!("spawning");
    let test = test(control_plane);
    let res = tokio::spawn(test.instrument(tracing::info_span!("test"))).await;
    if res.is_err() {
        // If the test failed, stop tracing so the log is not polluted with more information about
        // cleanup after the failure was printed.
        drop(_tracing);
    }

    tracing::debug!("shutting down");
    drain_tx.drain().await;
    for watch in futures::future::join_all(watches).await {
        watch.expect("watch task panicked");
    }
    if let Err(err) = res {
        std::panic::resume_unwind(err.into_panic());
    }
}

/// A user that has been authenticated, and so belongs to the authenticated group.
pub fn authenticated<G>(name: &str, groups: impl IntoIterator<Item = G>) -> UserInfo
where
    G: Into<String>,
{
    let mut user = UserInfo::new(name, groups);
    user.groups.insert(AUTHENTICATED_GROUP.to_string());
    user
}

// === impl ControlPlane ===

impl ControlPlane {
    pub async fn authorize(&self, user: &UserInfo, attrs: &Attributes) -> Decision {
        self.authorizer
            .authorize(user, attrs, &CancellationToken::new())
            .await
            .expect("authorization must not be canceled")
    }

    pub async fn review(
        &self,
        caller: &UserInfo,
        request: &ReviewRequest,
    ) -> Result<ReviewResponse, ReviewError> {
        self.reviews
            .review(caller, request, &CancellationToken::new())
            .await
    }

    /// Waits for the index to reach a state in which `attrs` is allowed for `user` (or, when
    /// `allowed` is false, denied), then returns the resulting decision.
    pub async fn await_decision(
        &self,
        user: &UserInfo,
        attrs: &Attributes,
        allowed: bool,
    ) -> Decision {
        let mut reader = self.reader.clone();
        let wait = reader.wait_for(|s| authz::evaluate(s, user, attrs).is_allowed() == allowed);
        time::timeout(TIMEOUT, wait)
            .await
            .unwrap_or_else(|_| {
                panic!("timed out waiting for {user} to be allowed={allowed} to {attrs:?}")
            })
            .expect("index closed");
        self.authorize(user, attrs).await
    }
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "rbac=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}

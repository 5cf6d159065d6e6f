use rbac_policy_core::{Attributes, UserInfo};
use rbac_policy_index::{Reader, Snapshot};
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// The reason reported for a request that no rule allows.
pub const DENIED_BY_DEFAULT: &str = "denied by default";

/// The prefix of every reason reported when the policy index cannot be consulted.
pub const UNAVAILABLE_PREFIX: &str = "policy engine unavailable";

/// Evaluates requests against the snapshots published by the rule index.
#[derive(Clone, Debug)]
pub struct Authorizer {
    reader: Reader,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The request matched a rule granted by `binding`. `namespace` is `None` for cluster
    /// bindings.
    Allowed {
        binding: String,
        namespace: Option<String>,
    },

    /// No rule allows the request.
    Denied,

    /// The index could not be consulted; the request is denied.
    Unavailable(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("authorization canceled")]
pub struct Canceled;

// === impl Authorizer ===

impl Authorizer {
    pub fn new(reader: Reader) -> Self {
        Self { reader }
    }

    /// Decides whether `user` may perform the request described by `attrs`.
    ///
    /// Before the index has synced, this waits for it to do so. If the index is dropped, or the
    /// store cannot be listed before the index syncs, the request is denied as
    /// [`Decision::Unavailable`].
    #[instrument(skip_all, fields(user = %user, verb = %attrs.verb, resource = %attrs.resource))]
    pub async fn authorize(
        &self,
        user: &UserInfo,
        attrs: &Attributes,
        cancel: &CancellationToken,
    ) -> Result<Decision, Canceled> {
        if cancel.is_cancelled() {
            return Err(Canceled);
        }

        let snapshot = match self.synced(cancel).await? {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                warn!(%reason, "Denying request");
                return Ok(Decision::Unavailable(reason));
            }
        };

        let decision = evaluate(&snapshot, user, attrs);
        debug!(generation = snapshot.generation(), reason = %decision, "Authorized");
        Ok(decision)
    }

    /// Obtains a synced snapshot, or the reason none is available.
    async fn synced(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Result<Arc<Snapshot>, String>, Canceled> {
        if self.reader.is_closed() {
            return Ok(Err(format!("{UNAVAILABLE_PREFIX}: index closed")));
        }

        let snapshot = self.reader.snapshot();
        if snapshot.is_synced() {
            return Ok(Ok(snapshot));
        }
        if let Some(reason) = disconnected(&snapshot) {
            return Ok(Err(reason));
        }

        debug!("Waiting for the policy index to sync");
        let mut reader = self.reader.clone();
        let res = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(Canceled),

            res = reader.wait_for(|s| s.is_synced() || s.disconnected().is_some()) => res,
        };

        Ok(match res {
            Ok(snapshot) if snapshot.is_synced() => Ok(snapshot),
            Ok(snapshot) => Err(disconnected(&snapshot)
                .unwrap_or_else(|| format!("{UNAVAILABLE_PREFIX}: index not synced"))),
            Err(_) => Err(format!("{UNAVAILABLE_PREFIX}: index closed before syncing")),
        })
    }
}

fn disconnected(snapshot: &Snapshot) -> Option<String> {
    let (kind, error) = snapshot.disconnected()?;
    Some(format!("{UNAVAILABLE_PREFIX}: failed to list {kind}: {error}"))
}

/// Evaluates a request against a single snapshot. Cluster grants are consulted before grants in
/// the request's namespace; the first matching rule decides.
pub fn evaluate(snapshot: &Snapshot, user: &UserInfo, attrs: &Attributes) -> Decision {
    for grant in snapshot.candidates(user, attrs.namespace.as_deref()) {
        if grant.rules.iter().any(|rule| rule.matches(attrs)) {
            return Decision::Allowed {
                binding: grant.binding.clone(),
                namespace: grant.namespace.clone(),
            };
        }
    }
    Decision::Denied
}

// === impl Decision ===

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed {
                binding,
                namespace: None,
            } => write!(f, "allowed by cluster rule in binding {binding:?}"),
            Self::Allowed {
                binding,
                namespace: Some(ns),
            } => write!(f, "allowed by rule in binding {binding:?} in namespace {ns:?}"),
            Self::Denied => f.write_str(DENIED_BY_DEFAULT),
            Self::Unavailable(reason) => f.write_str(reason),
        }
    }
}

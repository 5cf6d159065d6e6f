use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// User names of this form identify a service account: `system:serviceaccount:<ns>:<name>`.
pub const SERVICE_ACCOUNT_USER_PREFIX: &str = "system:serviceaccount:";

/// An identity that a role binding may grant rules to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Subject {
    User { name: String },
    Group { name: String },
    ServiceAccount { namespace: String, name: String },
}

/// The authenticated requester, as presented by the authentication layer.
///
/// Group memberships are taken as supplied; nothing in this crate computes them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,

    #[serde(default)]
    pub groups: BTreeSet<String>,
}

// === impl Subject ===

impl Subject {
    pub fn user(name: impl Into<String>) -> Self {
        Self::User { name: name.into() }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::Group { name: name.into() }
    }

    pub fn service_account(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ServiceAccount {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::User { name } | Self::Group { name } | Self::ServiceAccount { name, .. } => name,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User { name } => write!(f, "User/{name}"),
            Self::Group { name } => write!(f, "Group/{name}"),
            Self::ServiceAccount { namespace, name } => {
                write!(f, "ServiceAccount/{namespace}/{name}")
            }
        }
    }
}

// === impl UserInfo ===

impl UserInfo {
    pub fn new<G>(name: impl Into<String>, groups: impl IntoIterator<Item = G>) -> Self
    where
        G: Into<String>,
    {
        Self {
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Enumerates every subject that this user is matched as: the user itself, each of its groups,
    /// and the service account its name denotes, if any.
    pub fn subjects(&self) -> Vec<Subject> {
        let mut subjects = Vec::with_capacity(self.groups.len() + 2);
        if !self.name.is_empty() {
            subjects.push(Subject::user(&self.name));
        }
        if let Some((namespace, name)) = self.service_account() {
            subjects.push(Subject::service_account(namespace, name));
        }
        subjects.extend(self.groups.iter().map(Subject::group));
        subjects
    }

    fn service_account(&self) -> Option<(&str, &str)> {
        let rest = self.name.strip_prefix(SERVICE_ACCOUNT_USER_PREFIX)?;
        let (namespace, name) = rest.split_once(':')?;
        if namespace.is_empty() || name.is_empty() || name.contains(':') {
            return None;
        }
        Some((namespace, name))
    }
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            return f.write_str("<anonymous>");
        }
        self.name.fmt(f)
    }
}

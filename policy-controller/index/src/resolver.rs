use ahash::AHashMap as HashMap;
use rbac_policy_core::{ObjectKey, PolicyRule, Record, RoleBinding, Subject};
use std::sync::Arc;

/// The outcome of resolving a binding against the known roles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ResolvedBinding),

    /// The binding references a role that does not exist (or may not be referenced from the
    /// binding's scope). Such a binding grants nothing.
    Unresolved { role: ObjectKey },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedBinding {
    pub subjects: Vec<Subject>,
    pub role: ObjectKey,
    pub rules: Arc<[PolicyRule]>,

    /// The namespace within which the rules apply, or `None` for cluster-wide grants.
    pub scope: Option<String>,
}

pub trait RoleLookup {
    fn rules(&self, role: &ObjectKey) -> Option<Arc<[PolicyRule]>>;
}

impl RoleLookup for HashMap<ObjectKey, Arc<[PolicyRule]>> {
    fn rules(&self, role: &ObjectKey) -> Option<Arc<[PolicyRule]>> {
        self.get(role).cloned()
    }
}

pub fn resolve(binding: &RoleBinding, roles: &impl RoleLookup) -> Resolution {
    let role = binding.role_key();

    // A binding may only reference a cluster role or a role in its own namespace.
    if let Some(role_ns) = role.namespace.as_deref() {
        if binding.namespace() != Some(role_ns) {
            return Resolution::Unresolved { role };
        }
    }

    match roles.rules(&role) {
        Some(rules) => Resolution::Resolved(ResolvedBinding {
            subjects: dedup(&binding.subjects),
            role,
            rules,
            scope: binding.namespace().map(Into::into),
        }),
        None => Resolution::Unresolved { role },
    }
}

fn dedup(subjects: &[Subject]) -> Vec<Subject> {
    let mut out = Vec::with_capacity(subjects.len());
    for subject in subjects {
        if !out.contains(subject) {
            out.push(subject.clone());
        }
    }
    out
}

// === impl Resolution ===

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn role(&self) -> &ObjectKey {
        match self {
            Self::Resolved(ResolvedBinding { role, .. }) | Self::Unresolved { role } => role,
        }
    }
}

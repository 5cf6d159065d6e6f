use crate::{PolicyRule, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named set of rules. Cluster-scoped when the metadata carries no namespace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Grants the rules of the referenced role to `subjects`.
///
/// A namespaced binding only grants within its own namespace and may reference a cluster role or a
/// role in that namespace. A cluster binding grants cluster-wide and may only reference a cluster
/// role.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    #[serde(default)]
    pub metadata: ObjectMeta,

    pub role_ref: RoleRef,

    #[serde(default)]
    pub subjects: Vec<Subject>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    pub name: String,

    /// Absent for cluster roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Role,
    RoleBinding,
}

/// Any record held by the policy store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Object {
    Role(Role),
    RoleBinding(RoleBinding),
}

/// Identifies a record in the store: `(kind, namespace-or-cluster, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

/// Accessors shared by every stored record type.
pub trait Record: Clone + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn into_object(self) -> Object;

    fn from_object(object: Object) -> Option<Self>;

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: Self::KIND,
            namespace: self.meta().namespace.clone(),
            name: self.name().to_string(),
        }
    }
}

fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(Into::into),
        ..Default::default()
    }
}

// === impl Role ===

impl Role {
    pub fn cluster(name: &str, rules: impl IntoIterator<Item = PolicyRule>) -> Self {
        Self {
            metadata: meta(None, name),
            rules: rules.into_iter().collect(),
        }
    }

    pub fn namespaced(
        namespace: &str,
        name: &str,
        rules: impl IntoIterator<Item = PolicyRule>,
    ) -> Self {
        Self {
            metadata: meta(Some(namespace), name),
            rules: rules.into_iter().collect(),
        }
    }
}

impl Record for Role {
    const KIND: Kind = Kind::Role;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn into_object(self) -> Object {
        Object::Role(self)
    }

    fn from_object(object: Object) -> Option<Self> {
        match object {
            Object::Role(role) => Some(role),
            Object::RoleBinding(_) => None,
        }
    }
}

// === impl RoleBinding ===

impl RoleBinding {
    pub fn cluster(
        name: &str,
        role_ref: RoleRef,
        subjects: impl IntoIterator<Item = Subject>,
    ) -> Self {
        Self {
            metadata: meta(None, name),
            role_ref,
            subjects: subjects.into_iter().collect(),
        }
    }

    pub fn namespaced(
        namespace: &str,
        name: &str,
        role_ref: RoleRef,
        subjects: impl IntoIterator<Item = Subject>,
    ) -> Self {
        Self {
            metadata: meta(Some(namespace), name),
            role_ref,
            subjects: subjects.into_iter().collect(),
        }
    }

    /// The store key of the role this binding references.
    pub fn role_key(&self) -> ObjectKey {
        ObjectKey::role(self.role_ref.namespace.as_deref(), &self.role_ref.name)
    }
}

impl Record for RoleBinding {
    const KIND: Kind = Kind::RoleBinding;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn into_object(self) -> Object {
        Object::RoleBinding(self)
    }

    fn from_object(object: Object) -> Option<Self> {
        match object {
            Object::RoleBinding(binding) => Some(binding),
            Object::Role(_) => None,
        }
    }
}

// === impl RoleRef ===

impl RoleRef {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }
}

// === impl Kind ===

impl Kind {
    pub const ALL: [Kind; 2] = [Kind::Role, Kind::RoleBinding];

    /// The lowercase plural used in logs, metrics, and keys.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Role => "roles",
            Self::RoleBinding => "rolebindings",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

// === impl Object ===

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Role(_) => Kind::Role,
            Self::RoleBinding(_) => Kind::RoleBinding,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Role(role) => role.meta(),
            Self::RoleBinding(binding) => binding.meta(),
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Role(role) => role.meta_mut(),
            Self::RoleBinding(binding) => binding.meta_mut(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Role(role) => role.key(),
            Self::RoleBinding(binding) => binding.key(),
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }
}

impl From<Role> for Object {
    fn from(role: Role) -> Self {
        Self::Role(role)
    }
}

impl From<RoleBinding> for Object {
    fn from(binding: RoleBinding) -> Self {
        Self::RoleBinding(binding)
    }
}

// === impl ObjectKey ===

impl ObjectKey {
    pub fn role(namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: Kind::Role,
            namespace: namespace.map(Into::into),
            name: name.to_string(),
        }
    }

    pub fn role_binding(namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: Kind::RoleBinding,
            namespace: namespace.map(Into::into),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_deserializes_from_policy_document_form() {
        let binding: RoleBinding = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "shared-resource-viewers", "namespace": "openshift" },
            "roleRef": { "name": "shared-resource-viewer" },
            "subjects": [{ "kind": "Group", "name": "system:authenticated" }],
        }))
        .unwrap();
        assert_eq!(
            binding,
            RoleBinding::namespaced(
                "openshift",
                "shared-resource-viewers",
                RoleRef::cluster("shared-resource-viewer"),
                [Subject::group("system:authenticated")],
            )
        );
        assert_eq!(binding.role_key(), ObjectKey::role(None, "shared-resource-viewer"));
    }

    #[test]
    fn keys_display_scope() {
        let role = Role::cluster("cluster-admin", []);
        assert_eq!(role.key().to_string(), "roles/cluster-admin");
        let binding = RoleBinding::namespaced("ns-0", "b", RoleRef::cluster("r"), []);
        assert_eq!(binding.key().to_string(), "rolebindings/ns-0/b");
    }

    #[test]
    fn object_round_trips_through_typed_records() {
        let role = Role::namespaced("ns-0", "viewer", [PolicyRule::resources(["get"], ["pods"])]);
        let object = role.clone().into_object();
        assert_eq!(object.kind(), Kind::Role);
        assert_eq!(object.key(), role.key());
        assert_eq!(Role::from_object(object.clone()), Some(role));
        assert_eq!(RoleBinding::from_object(object), None);
    }
}

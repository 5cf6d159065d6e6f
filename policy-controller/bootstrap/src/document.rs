use rbac_policy_core::{validation, Object, Role, RoleBinding, ValidationError};
use serde::{Deserialize, Serialize};

/// The default policy installed into a new cluster.
pub const DEFAULT_POLICY_YAML: &str = include_str!("bootstrap-policy.yaml");

/// A set of roles and role bindings that are seeded together.
///
/// Each record keeps its own namespace, so a document may mix cluster-scoped and namespaced
/// records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(default)]
    pub roles: Vec<Role>,

    #[serde(default)]
    pub role_bindings: Vec<RoleBinding>,
}

impl PolicyDocument {
    /// Parses the embedded default policy.
    pub fn default_policy() -> Result<Self, serde_yaml::Error> {
        Self::from_yaml(DEFAULT_POLICY_YAML)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Validates every record in the document, returning the first error.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.roles.iter().try_for_each(validation::validate_role)?;
        self.role_bindings
            .iter()
            .try_for_each(validation::validate_role_binding)
    }

    /// Iterates over the document's records, roles first.
    pub fn objects(&self) -> impl Iterator<Item = Object> + '_ {
        let roles = self.roles.iter().cloned().map(Object::from);
        let bindings = self.role_bindings.iter().cloned().map(Object::from);
        roles.chain(bindings)
    }

    pub fn len(&self) -> usize {
        self.roles.len() + self.role_bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

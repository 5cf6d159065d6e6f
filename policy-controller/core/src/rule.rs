use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Matches any value in a rule dimension.
pub const WILDCARD: &str = "*";

/// A single grant of verbs over resources or non-resource URLs.
///
/// Every dimension is a set; a rule matches a request when each dimension contains the requested
/// value or the wildcard. `resource_names`, when non-empty, further restricts a resource rule to
/// the named objects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub verbs: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub api_groups: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resources: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resource_names: BTreeSet<String>,

    #[serde(
        default,
        rename = "nonResourceURLs",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub non_resource_urls: BTreeSet<String>,
}

/// Describes the action being authorized.
///
/// A request is a non-resource request iff `non_resource_url` is set; otherwise it targets
/// `resource` in `api_group`, optionally narrowed to a single `resource_name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Attributes {
    pub verb: String,
    pub api_group: String,
    pub resource: String,
    pub resource_name: Option<String>,
    pub namespace: Option<String>,
    pub non_resource_url: Option<String>,
}

// === impl PolicyRule ===

impl PolicyRule {
    /// Builds a rule over resources in the core API group.
    pub fn resources<V, R>(
        verbs: impl IntoIterator<Item = V>,
        resources: impl IntoIterator<Item = R>,
    ) -> Self
    where
        V: Into<String>,
        R: Into<String>,
    {
        Self {
            verbs: set(verbs),
            resources: set(resources),
            ..Default::default()
        }
    }

    /// Builds a rule over non-resource URLs.
    pub fn non_resource<V, U>(
        verbs: impl IntoIterator<Item = V>,
        urls: impl IntoIterator<Item = U>,
    ) -> Self
    where
        V: Into<String>,
        U: Into<String>,
    {
        Self {
            verbs: set(verbs),
            non_resource_urls: set(urls),
            ..Default::default()
        }
    }

    pub fn with_api_groups<G: Into<String>>(mut self, groups: impl IntoIterator<Item = G>) -> Self {
        self.api_groups = set(groups);
        self
    }

    pub fn with_resource_names<N: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = N>,
    ) -> Self {
        self.resource_names = set(names);
        self
    }

    pub fn matches(&self, attrs: &Attributes) -> bool {
        if !contains(&self.verbs, &attrs.verb) {
            return false;
        }

        match attrs.non_resource_url.as_deref() {
            Some(url) => self.matches_non_resource(url),
            None => self.matches_resource(attrs),
        }
    }

    fn matches_resource(&self, attrs: &Attributes) -> bool {
        if !contains(&self.resources, &attrs.resource) {
            return false;
        }

        // An empty group set only covers the core group.
        let group_matches = if self.api_groups.is_empty() {
            attrs.api_group.is_empty()
        } else {
            contains(&self.api_groups, &attrs.api_group)
        };
        if !group_matches {
            return false;
        }

        if self.resource_names.is_empty() {
            return true;
        }
        attrs
            .resource_name
            .as_deref()
            .is_some_and(|name| self.resource_names.contains(name))
    }

    fn matches_non_resource(&self, url: &str) -> bool {
        self.non_resource_urls.iter().any(|pattern| {
            if pattern == WILDCARD || pattern == url {
                return true;
            }
            match pattern.strip_suffix('*') {
                Some(prefix) => url.starts_with(prefix),
                None => false,
            }
        })
    }
}

fn contains(values: &BTreeSet<String>, value: &str) -> bool {
    values.contains(WILDCARD) || values.contains(value)
}

fn set<T: Into<String>>(values: impl IntoIterator<Item = T>) -> BTreeSet<String> {
    values.into_iter().map(Into::into).collect()
}

// === impl Attributes ===

impl Attributes {
    /// Describes a request against a resource type in the core API group.
    pub fn resource(verb: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            resource: resource.into(),
            ..Default::default()
        }
    }

    /// Describes a request against a non-resource URL, e.g. `/healthz`.
    pub fn non_resource(verb: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            non_resource_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_api_group(mut self, group: impl Into<String>) -> Self {
        self.api_group = group.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = Some(name.into());
        self
    }

    pub fn is_resource_request(&self) -> bool {
        self.non_resource_url.is_none()
    }
}

use crate::{Authorizer, Canceled, Decision};
use rbac_policy_core::{Attributes, UserInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Asks whether a subject may perform an action.
///
/// When `subject` is omitted the review is about the caller itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<ReviewSubject>,

    pub verb: String,

    #[serde(default)]
    pub resource: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,

    #[serde(
        default,
        rename = "nonResourceURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub non_resource_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// The identity a review is about.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSubject {
    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub groups: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub allowed: bool,
    pub reason: String,

    /// The namespace the review was evaluated in, or `""` for cluster-wide reviews.
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    #[error("forbidden: {caller} may not {verb} {resource} {scope}", scope = display_scope(.namespace))]
    Forbidden {
        caller: String,
        verb: String,
        resource: String,
        namespace: Option<String>,
    },

    #[error("{0}")]
    Unavailable(String),

    #[error("access review canceled")]
    Canceled,
}

/// The permission a caller needs to review another subject's access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewConfig {
    pub verb: String,
    pub resource: String,
    pub api_group: String,
}

/// Answers access reviews on behalf of authenticated callers.
#[derive(Clone, Debug)]
pub struct AccessReviews {
    authorizer: Authorizer,
    config: ReviewConfig,
}

fn display_scope(namespace: &Option<String>) -> String {
    match namespace {
        Some(ns) => format!("in namespace {ns:?}"),
        None => "at the cluster scope".to_string(),
    }
}

// === impl ReviewRequest ===

impl ReviewRequest {
    pub fn new(verb: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            resource: resource.into(),
            ..Default::default()
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn for_subject(mut self, subject: ReviewSubject) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn attributes(&self) -> Attributes {
        Attributes {
            verb: self.verb.clone(),
            api_group: self.api_group.clone(),
            resource: self.resource.clone(),
            resource_name: self.resource_name.clone(),
            namespace: self.namespace.clone(),
            non_resource_url: self.non_resource_url.clone(),
        }
    }

    /// Indicates the request names no subject, so it concerns the caller.
    pub fn is_self_review(&self) -> bool {
        match &self.subject {
            None => true,
            Some(s) => s.user.is_empty() && s.groups.is_empty(),
        }
    }

    /// Indicates the request's subject is `caller`, naming no group the caller lacks.
    pub fn names_caller(&self, caller: &UserInfo) -> bool {
        self.subject
            .as_ref()
            .is_some_and(|s| s.user == caller.name && s.groups.is_subset(&caller.groups))
    }
}

// === impl ReviewSubject ===

impl ReviewSubject {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: name.into(),
            groups: BTreeSet::new(),
        }
    }

    pub fn groups<G: Into<String>>(groups: impl IntoIterator<Item = G>) -> Self {
        Self {
            user: String::new(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<ReviewSubject> for UserInfo {
    fn from(subject: ReviewSubject) -> Self {
        UserInfo::new(subject.user, subject.groups)
    }
}

// === impl ReviewConfig ===

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            verb: "create".to_string(),
            resource: "subjectaccessreviews".to_string(),
            api_group: String::new(),
        }
    }
}

// === impl ReviewError ===

impl From<Canceled> for ReviewError {
    fn from(_: Canceled) -> Self {
        Self::Canceled
    }
}

impl ReviewError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }
}

// === impl AccessReviews ===

impl AccessReviews {
    pub fn new(authorizer: Authorizer, config: ReviewConfig) -> Self {
        Self { authorizer, config }
    }

    /// Reviews a request, dispatching on whether it names a subject other than the caller.
    pub async fn review(
        &self,
        caller: &UserInfo,
        request: &ReviewRequest,
        cancel: &CancellationToken,
    ) -> Result<ReviewResponse, ReviewError> {
        if request.is_self_review() || request.names_caller(caller) {
            return self.review_self(caller, request, cancel).await;
        }
        self.review_subject(caller, request, cancel).await
    }

    /// Reviews the caller's own access. Any subject named by the request is ignored.
    ///
    /// No permission is required to review oneself.
    #[instrument(skip_all, fields(caller = %caller, verb = %request.verb, resource = %request.resource))]
    pub async fn review_self(
        &self,
        caller: &UserInfo,
        request: &ReviewRequest,
        cancel: &CancellationToken,
    ) -> Result<ReviewResponse, ReviewError> {
        let decision = self
            .authorizer
            .authorize(caller, &request.attributes(), cancel)
            .await?;
        Ok(respond(request, decision))
    }

    /// Reviews the access of the subject named by the request.
    ///
    /// The caller must itself be allowed to create reviews in the request's namespace. If it is
    /// not, the review fails as forbidden rather than falling back to a self-review.
    #[instrument(skip_all, fields(caller = %caller, verb = %request.verb, resource = %request.resource))]
    pub async fn review_subject(
        &self,
        caller: &UserInfo,
        request: &ReviewRequest,
        cancel: &CancellationToken,
    ) -> Result<ReviewResponse, ReviewError> {
        let meta = self.meta_attributes(request.namespace.as_deref());
        match self.authorizer.authorize(caller, &meta, cancel).await? {
            Decision::Allowed { .. } => {}
            Decision::Unavailable(reason) => return Err(ReviewError::Unavailable(reason)),
            Decision::Denied => {
                info!("Caller may not review other subjects");
                return Err(ReviewError::Forbidden {
                    caller: caller.to_string(),
                    verb: meta.verb,
                    resource: meta.resource,
                    namespace: meta.namespace,
                });
            }
        }

        let subject = request.subject.clone().unwrap_or_default();
        let target = UserInfo::from(subject);
        debug!(target = %target, "Reviewing subject");
        let decision = self
            .authorizer
            .authorize(&target, &request.attributes(), cancel)
            .await?;
        Ok(respond(request, decision))
    }

    fn meta_attributes(&self, namespace: Option<&str>) -> Attributes {
        let attrs = Attributes::resource(&self.config.verb, &self.config.resource)
            .with_api_group(&self.config.api_group);
        match namespace {
            Some(ns) => attrs.in_namespace(ns),
            None => attrs,
        }
    }
}

fn respond(request: &ReviewRequest, decision: Decision) -> ReviewResponse {
    ReviewResponse {
        allowed: decision.is_allowed(),
        reason: decision.reason(),
        namespace: request.namespace.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DENIED_BY_DEFAULT;
    use rbac_policy_core::{Kind, PolicyRule, Role, RoleBinding, RoleRef, Subject};
    use rbac_policy_index::Index;

    fn mk_reviews() -> (Index, AccessReviews) {
        let (mut index, reader) = Index::new();
        index.reset(Kind::Role, vec![], "0".into());
        index.reset(Kind::RoleBinding, vec![], "0".into());
        index.apply_role(Role::cluster(
            "reviewer",
            [PolicyRule::resources(["create"], ["subjectaccessreviews"])],
        ));
        index.apply_role(Role::cluster(
            "project-creator",
            [PolicyRule::resources(["create"], ["projects"])],
        ));
        index.apply_binding(RoleBinding::namespaced(
            "ns-0",
            "reviewers",
            RoleRef::cluster("reviewer"),
            [Subject::user("rita")],
        ));
        index.apply_binding(RoleBinding::cluster(
            "project-creators",
            RoleRef::cluster("project-creator"),
            [Subject::group("creators")],
        ));
        let reviews = AccessReviews::new(Authorizer::new(reader), ReviewConfig::default());
        (index, reviews)
    }

    #[tokio::test]
    async fn self_review_needs_no_permission() {
        let (_index, reviews) = mk_reviews();
        let valerie = UserInfo::new("valerie", ["system:authenticated"]);
        let cancel = CancellationToken::new();

        // Any subject in a self-review is ignored.
        let request = ReviewRequest::new("create", "projects")
            .in_namespace("openshift")
            .for_subject(ReviewSubject::groups(["creators"]));
        let rsp = reviews
            .review_self(&valerie, &request, &cancel)
            .await
            .unwrap();
        assert_eq!(
            rsp,
            ReviewResponse {
                allowed: false,
                reason: DENIED_BY_DEFAULT.to_string(),
                namespace: "openshift".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn subject_review_requires_meta_permission() {
        let (_index, reviews) = mk_reviews();
        let cancel = CancellationToken::new();
        let request = ReviewRequest::new("create", "projects")
            .in_namespace("ns-0")
            .for_subject(ReviewSubject::groups(["creators"]));

        let valerie = UserInfo::new("valerie", Vec::<String>::new());
        let err = reviews
            .review_subject(&valerie, &request, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_forbidden(), "{err}");
        assert!(err.to_string().starts_with("forbidden"), "{err}");

        let rita = UserInfo::new("rita", Vec::<String>::new());
        let rsp = reviews
            .review_subject(&rita, &request, &cancel)
            .await
            .unwrap();
        assert!(rsp.allowed);
        assert_eq!(
            rsp.reason,
            r#"allowed by cluster rule in binding "project-creators""#
        );
        assert_eq!(rsp.namespace, "ns-0");

        // Rita may only review subjects in ns-0.
        let cluster = ReviewRequest::new("create", "projects")
            .for_subject(ReviewSubject::groups(["creators"]));
        let err = reviews
            .review_subject(&rita, &cluster, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn review_dispatches_on_subject() {
        let (_index, reviews) = mk_reviews();
        let cancel = CancellationToken::new();
        let creator = UserInfo::new("carl", ["creators"]);

        let request = ReviewRequest::new("create", "projects")
            .for_subject(ReviewSubject::default());
        let rsp = reviews.review(&creator, &request, &cancel).await.unwrap();
        assert!(rsp.allowed);
        assert_eq!(rsp.namespace, "");

        let request = request.for_subject(ReviewSubject::user("valerie"));
        let err = reviews.review(&creator, &request, &cancel).await.unwrap_err();
        assert!(err.is_forbidden());

        // Naming oneself is a self-review.
        let request = request.for_subject(ReviewSubject {
            user: "carl".to_string(),
            groups: ["creators".to_string()].into(),
        });
        let rsp = reviews.review(&creator, &request, &cancel).await.unwrap();
        assert!(rsp.allowed);
        let request = request.for_subject(ReviewSubject::user("carl"));
        assert!(reviews.review(&creator, &request, &cancel).await.is_ok());

        // Claiming a group the caller lacks is not.
        let request = request.for_subject(ReviewSubject {
            user: "carl".to_string(),
            groups: ["admins".to_string()].into(),
        });
        let err = reviews.review(&creator, &request, &cancel).await.unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn unavailable_meta_check_is_not_forbidden() {
        let (index, reviews) = mk_reviews();
        drop(index);
        let cancel = CancellationToken::new();
        let rita = UserInfo::new("rita", Vec::<String>::new());

        let request = ReviewRequest::new("create", "projects")
            .in_namespace("ns-0")
            .for_subject(ReviewSubject::groups(["creators"]));
        let err = reviews
            .review_subject(&rita, &request, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::Unavailable(_)), "{err}");

        // Self-reviews still respond, denying with a distinct reason.
        let rsp = reviews.review_self(&rita, &request, &cancel).await.unwrap();
        assert!(!rsp.allowed);
        assert!(rsp.reason.starts_with(crate::UNAVAILABLE_PREFIX));
    }

    #[tokio::test]
    async fn canceled_review_fails() {
        let (_index, reviews) = mk_reviews();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rita = UserInfo::new("rita", Vec::<String>::new());
        let request = ReviewRequest::new("get", "pods");
        let err = reviews
            .review_self(&rita, &request, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ReviewError::Canceled);
    }

    #[test]
    fn request_uses_api_field_names() {
        let request: ReviewRequest = serde_json::from_value(serde_json::json!({
            "subject": { "groups": ["system:cluster-admins"] },
            "verb": "create",
            "resource": "projects",
            "resourceName": "p",
            "apiGroup": "project.openshift.io",
        }))
        .unwrap();
        assert_eq!(
            request.subject,
            Some(ReviewSubject::groups(["system:cluster-admins"]))
        );
        assert_eq!(request.resource_name.as_deref(), Some("p"));
        assert_eq!(request.api_group, "project.openshift.io");
        assert!(!request.is_self_review());

        let request: ReviewRequest = serde_json::from_value(serde_json::json!({
            "verb": "create",
            "resource": "policybindings",
        }))
        .unwrap();
        assert!(request.is_self_review());
    }
}

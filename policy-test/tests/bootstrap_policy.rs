use rbac_policy_test::{
    authenticated,
    authz::{ReviewRequest, ReviewSubject, DENIED_BY_DEFAULT},
    bootstrap::{self, PolicyDocument, CREATE_BOOTSTRAP_POLICY_FILE_COMMAND},
    core::{
        Attributes, ObjectKey, PolicyRule, Record, Role, RoleBinding, RoleRef, Subject,
        CLUSTER_ADMIN_GROUP,
    },
    with_control_plane,
};
use std::io;

#[tokio::test(flavor = "current_thread")]
async fn authenticated_users_read_shared_resources() {
    with_control_plane(|cp| async move {
        let valerie = authenticated("valerie", Vec::<String>::new());

        for attrs in [
            Attributes::resource("list", "templates"),
            Attributes::resource("list", "imagestreams"),
            Attributes::resource("get", "imagestreamtags").with_name("ruby:latest"),
        ] {
            let shared = attrs.clone().in_namespace("openshift");
            let decision = cp.authorize(&valerie, &shared).await;
            assert!(decision.is_allowed(), "{shared:?}: {decision}");
            assert_eq!(
                decision.reason(),
                r#"allowed by rule in binding "shared-resource-viewers" in namespace "openshift""#
            );

            let private = attrs.in_namespace("default");
            let decision = cp.authorize(&valerie, &private).await;
            assert!(!decision.is_allowed(), "{private:?}: {decision}");
            assert_eq!(decision.reason(), DENIED_BY_DEFAULT);
        }

        // Writes are not shared.
        let create = Attributes::resource("create", "templates").in_namespace("openshift");
        assert!(!cp.authorize(&valerie, &create).await.is_allowed());
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn self_review_is_denied_by_default() {
    with_control_plane(|cp| async move {
        let valerie = authenticated("valerie", Vec::<String>::new());
        let request = ReviewRequest::new("create", "policybindings").in_namespace("openshift");
        let review = cp.review(&valerie, &request).await.expect("self reviews are permitted");
        assert!(!review.allowed);
        assert_eq!(review.reason, DENIED_BY_DEFAULT);
        assert_eq!(review.namespace, "openshift");

        let request = ReviewRequest::new("list", "projects");
        let review = cp.review(&valerie, &request).await.unwrap();
        assert!(review.allowed, "{}", review.reason);
        assert_eq!(review.namespace, "");
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn reviewing_others_is_forbidden_without_permission() {
    with_control_plane(|cp| async move {
        let valerie = authenticated("valerie", Vec::<String>::new());
        let request = ReviewRequest::new("create", "projects")
            .for_subject(ReviewSubject::groups([CLUSTER_ADMIN_GROUP]));
        let err = cp.review(&valerie, &request).await.unwrap_err();
        assert!(err.is_forbidden());
        assert!(err.to_string().contains("forbidden"), "{err}");

        // Cluster admins may review anyone.
        let admin = authenticated("ada", [CLUSTER_ADMIN_GROUP]);
        let review = cp.review(&admin, &request).await.unwrap();
        assert!(review.allowed);
        assert_eq!(
            review.reason,
            r#"allowed by cluster rule in binding "cluster-admins""#
        );

        let request =
            ReviewRequest::new("create", "projects").for_subject(ReviewSubject::user("valerie"));
        let review = cp.review(&admin, &request).await.unwrap();
        assert!(!review.allowed);
        assert_eq!(review.reason, DENIED_BY_DEFAULT);
    })
    .await;
}

/// Deletes the cluster-admin role, observes that admins lose access, then restores the policy by
/// overwriting it from a freshly generated bootstrap policy file.
#[tokio::test(flavor = "current_thread")]
async fn overwrite_restores_deleted_policy() {
    with_control_plane(|cp| async move {
        let admin = authenticated("ada", [CLUSTER_ADMIN_GROUP]);
        let request =
            ReviewRequest::new("create", "projects").for_subject(ReviewSubject::user("valerie"));
        let meta = Attributes::resource("create", "subjectaccessreviews");
        assert!(cp.review(&admin, &request).await.is_ok());

        cp.store
            .delete(&ObjectKey::role(None, "cluster-admin"))
            .await
            .unwrap();
        cp.await_decision(&admin, &meta, false).await;
        let err = cp.review(&admin, &request).await.unwrap_err();
        assert!(err.is_forbidden(), "{err}");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        bootstrap::create_bootstrap_policy_file(&path, false, &mut io::sink())
            .await
            .unwrap();
        bootstrap::overwrite_bootstrap_policy(
            &*cp.store,
            &path,
            CREATE_BOOTSTRAP_POLICY_FILE_COMMAND,
            true,
            &mut io::sink(),
        )
        .await
        .unwrap();

        cp.await_decision(&admin, &meta, true).await;
        assert!(cp.review(&admin, &request).await.is_ok());
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn reseeding_keeps_customizations_unless_overwritten() {
    with_control_plane(|cp| async move {
        let doc = PolicyDocument::default_policy().unwrap();
        let valerie = authenticated("valerie", Vec::<String>::new());
        let create = Attributes::resource("create", "templates").in_namespace("openshift");
        let pods = Attributes::resource("get", "pods").in_namespace("default");

        // Widen the shared role and grant valerie an unrelated cluster role.
        let key = ObjectKey::role(None, "shared-resource-viewer");
        let mut role = Role::from_object(cp.store.get(&key).await.unwrap()).unwrap();
        role.rules.push(PolicyRule::resources(["create"], ["templates"]));
        cp.store.update(role.into()).await.unwrap();
        let pod_reader = Role::cluster("pod-reader", [PolicyRule::resources(["get"], ["pods"])]);
        cp.store.create(pod_reader.into()).await.unwrap();
        let manual = RoleBinding::cluster(
            "valerie-pod-reader",
            RoleRef::cluster("pod-reader"),
            [Subject::user("valerie")],
        );
        cp.store.create(manual.clone().into()).await.unwrap();
        cp.await_decision(&valerie, &create, true).await;
        cp.await_decision(&valerie, &pods, true).await;

        let generation = cp.reader.snapshot().generation();
        assert!(!bootstrap::seed(&*cp.store, &doc, false).await.unwrap());
        assert_eq!(cp.reader.snapshot().generation(), generation);
        let decision = cp.authorize(&valerie, &create).await;
        assert_eq!(
            decision.reason(),
            r#"allowed by rule in binding "shared-resource-viewers" in namespace "openshift""#
        );

        // Overwriting restores the default role, but records outside the document are kept.
        assert!(bootstrap::seed(&*cp.store, &doc, true).await.unwrap());
        let restored = Role::from_object(cp.store.get(&key).await.unwrap()).unwrap();
        assert!(!restored.rules.iter().any(|r| r.verbs.contains("create")));
        let decision = cp.await_decision(&valerie, &create, false).await;
        assert_eq!(decision.reason(), DENIED_BY_DEFAULT);
        assert!(cp.store.get(&manual.key()).await.is_ok());
        let decision = cp.authorize(&valerie, &pods).await;
        assert_eq!(
            decision.reason(),
            r#"allowed by cluster rule in binding "valerie-pod-reader""#
        );
    })
    .await;
}

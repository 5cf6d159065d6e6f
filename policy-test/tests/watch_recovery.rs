use rbac_policy_test::{
    authenticated,
    core::{Attributes, Kind, ObjectKey, PolicyRule, Role, RoleBinding, RoleRef, Subject},
    with_control_plane, ControlPlane,
};

async fn grant_pod_reader(cp: &ControlPlane, user: &str) {
    let role = Role::cluster("pod-reader", [PolicyRule::resources(["get"], ["pods"])]);
    cp.store.create(role.into()).await.unwrap();
    let binding = RoleBinding::namespaced(
        "ns-0",
        "pod-readers",
        RoleRef::cluster("pod-reader"),
        [Subject::user(user)],
    );
    cp.store.create(binding.into()).await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn decisions_survive_store_outage() {
    with_control_plane(|cp| async move {
        let valerie = authenticated("valerie", Vec::<String>::new());
        let get = Attributes::resource("get", "pods").in_namespace("ns-0");
        grant_pod_reader(&cp, "valerie").await;
        cp.await_decision(&valerie, &get, true).await;

        cp.backend.set_available(false);
        let err = cp.store.list(Kind::Role, None).await.unwrap_err();
        assert!(err.is_unavailable());

        // The index keeps serving its last snapshot while it reconnects.
        for _ in 0..3 {
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
            assert!(cp.reader.snapshot().is_synced());
            assert!(cp.authorize(&valerie, &get).await.is_allowed());
        }

        cp.backend.set_available(true);
        let role = Role::cluster("pod-writer", [PolicyRule::resources(["create"], ["pods"])]);
        cp.store.create(role.into()).await.unwrap();
        let binding = RoleBinding::namespaced(
            "ns-0",
            "pod-writers",
            RoleRef::cluster("pod-writer"),
            [Subject::user("valerie")],
        );
        cp.store.create(binding.into()).await.unwrap();
        let create = Attributes::resource("create", "pods").in_namespace("ns-0");
        cp.await_decision(&valerie, &create, true).await;
    })
    .await;
}

/// Breaks the watches, deletes a binding before the index reconnects, and checks that the relist
/// drops the deleted grant.
#[tokio::test(flavor = "current_thread")]
async fn relist_removes_records_deleted_while_disconnected() {
    with_control_plane(|cp| async move {
        let valerie = authenticated("valerie", Vec::<String>::new());
        let get = Attributes::resource("get", "pods").in_namespace("ns-0");
        grant_pod_reader(&cp, "valerie").await;
        cp.await_decision(&valerie, &get, true).await;

        // None of these calls yield, so the watches observe the outage before the deletion.
        cp.backend.set_available(false);
        cp.backend.set_available(true);
        let key = ObjectKey::role_binding(Some("ns-0"), "pod-readers");
        cp.store.delete(&key).await.unwrap();

        let decision = cp.await_decision(&valerie, &get, false).await;
        assert!(!decision.is_allowed());
        let snapshot = cp.reader.snapshot();
        assert!(snapshot.is_synced());
        assert!(snapshot.namespace("ns-0").is_none());
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn duplicate_deliveries_do_not_change_decisions() {
    with_control_plane(|cp| async move {
        let valerie = authenticated("valerie", Vec::<String>::new());
        let get = Attributes::resource("get", "pods").in_namespace("ns-0");
        grant_pod_reader(&cp, "valerie").await;
        cp.await_decision(&valerie, &get, true).await;

        // Each outage forces a relist that replays records the index already holds.
        let generation = cp.reader.snapshot().generation();
        for _ in 0..3 {
            cp.backend.set_available(false);
            cp.backend.set_available(true);
            tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
        }
        let snapshot = cp.reader.snapshot();
        assert_eq!(snapshot.generation(), generation);
        assert!(cp.authorize(&valerie, &get).await.is_allowed());
    })
    .await;
}

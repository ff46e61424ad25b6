//! Lifecycle tests for the ServiceInstance reconciler
//!
//! Drive the reconciler against an in-memory store and a scripted service manager
//! through create, update and delete, including asynchronous operations, retries
//! and recovery of instances an earlier attempt left behind.

mod common;

use common::*;
use service_instance_operator::constants::{
    DEFAULT_BACKOFF_START_MS, DEFAULT_NON_TRANSIENT_REQUEUE_SECS,
    DEFAULT_RATE_LIMIT_BACKOFF_START_MS, FINALIZER_NAME, K8S_NAME_LABEL,
};
use service_instance_operator::controller::reconciler::fingerprint::derived_k8s_name;
use service_instance_operator::prelude::*;
use service_instance_operator::runtime::error_policy::handle_reconciliation_error;
use service_instance_operator::sm::ServiceManagerError;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

fn async_provision(instance_id: &str) -> ProvisionResponse {
    ProvisionResponse {
        instance_id: instance_id.to_string(),
        subaccount_id: String::new(),
        location: Some(format!("/v1/service_instances/{instance_id}/operations/op-1")),
    }
}

/// Remote instance an earlier attempt created for the resource `db`
fn orphan(ready: bool, last_operation: Option<Operation>) -> RemoteInstance {
    RemoteInstance {
        id: "abc".to_string(),
        name: "db".to_string(),
        ready,
        labels: [(
            K8S_NAME_LABEL.to_string(),
            vec![derived_k8s_name(&test_config().cluster_id, NAMESPACE, "db")],
        )]
        .into_iter()
        .collect(),
        last_operation,
        ..Default::default()
    }
}

fn finalizers(h: &Harness, key: &InstanceKey) -> Vec<String> {
    h.store
        .instance(key)
        .and_then(|i| i.metadata.finalizers)
        .unwrap_or_default()
}

#[tokio::test]
async fn test_sync_create_reaches_ready() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));

    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());

    let status = h.store.status(&key);
    assert_eq!(status.instance_id, "instance-1");
    assert_eq!(status.subaccount_id, "subaccount-1");
    assert!(!status.has_operation());
    assert!(!status.hashed_spec.is_empty());

    let succeeded = condition(&status, ConditionType::Succeeded);
    assert_eq!(succeeded.status, ConditionStatus::True);
    assert_eq!(succeeded.reason, Reason::Created);
    assert_eq!(succeeded.observed_generation, 1);
    assert_eq!(condition(&status, ConditionType::Ready).status, ConditionStatus::True);
    assert!(status.conditions.get(ConditionType::Failed).is_none());
    assert_eq!(status.ready, Some(ConditionStatus::True));

    assert_eq!(finalizers(&h, &key), vec![FINALIZER_NAME.to_string()]);
    assert_eq!(h.manager.count("provision"), 1);
}

#[tokio::test]
async fn test_provision_request_carries_identity() {
    let h = Harness::new();
    let mut spec = spec();
    spec.external_name = "remote-db".to_string();
    spec.custom_tags = vec!["team-a".to_string()];
    spec.parameters = Some(serde_json::json!({"region": "eu10"}));
    let key = h.store.insert_instance(instance("db", spec));

    h.settle(&key).await;

    let request = h
        .manager
        .calls()
        .into_iter()
        .find_map(|call| match call {
            common::Call::Provision(request) => Some(request),
            _ => None,
        })
        .expect("provision was called");
    assert_eq!(request.name, "remote-db");
    assert_eq!(request.service_offering_name, "postgresql-db");
    assert_eq!(request.service_plan_name, "small");
    assert_eq!(request.parameters, serde_json::json!({"region": "eu10"}));
    assert_eq!(request.tags, vec!["team-a".to_string()]);
    assert_eq!(request.context.get("clusterid").map(String::as_str), Some("test-cluster"));
    assert_eq!(request.context.get("namespace").map(String::as_str), Some(NAMESPACE));
    assert_eq!(request.labels.get("_clusterid"), Some(&vec!["test-cluster".to_string()]));
}

#[tokio::test]
async fn test_settled_instance_makes_no_remote_calls() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    let calls = h.manager.calls().len();
    let writes = h.store.status_writes();

    for _ in 0..3 {
        let action = h.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    assert_eq!(h.manager.calls().len(), calls);
    assert_eq!(h.store.status_writes(), writes);
}

#[tokio::test]
async fn test_async_create_polls_until_done() {
    let h = Harness::new();
    h.manager.script_provision(Ok(async_provision("abc")));
    let key = h.store.insert_instance(instance("db", spec()));

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(POLL_INTERVAL));

    let status = h.store.status(&key);
    assert_eq!(status.operation_url, "/v1/service_instances/abc/operations/op-1");
    assert_eq!(status.operation_type, Some(OperationCategory::Create));
    let succeeded = condition(&status, ConditionType::Succeeded);
    assert_eq!(succeeded.status, ConditionStatus::False);
    assert_eq!(succeeded.reason, Reason::CreateInProgress);
    assert_eq!(condition(&status, ConditionType::Ready).reason, Reason::NotProvisioned);

    h.manager
        .script_status(Ok(operation(OperationCategory::Create, OperationState::InProgress)));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(POLL_INTERVAL));
    assert!(h.store.status(&key).has_operation());

    h.manager
        .script_status(Ok(operation(OperationCategory::Create, OperationState::Succeeded)));
    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());

    let status = h.store.status(&key);
    assert!(!status.has_operation());
    assert_eq!(status.instance_id, "abc");
    assert_eq!(status.subaccount_id, "subaccount-1");
    assert_eq!(condition(&status, ConditionType::Succeeded).reason, Reason::Created);
    assert_eq!(condition(&status, ConditionType::Ready).status, ConditionStatus::True);

    assert_eq!(h.manager.count("provision"), 1);
    assert_eq!(h.manager.count("status"), 2);
}

#[tokio::test]
async fn test_failed_async_create_surfaces_broker_description() {
    let h = Harness::new();
    h.manager.script_provision(Ok(async_provision("abc")));
    let key = h.store.insert_instance(instance("db", spec()));
    h.reconcile(&key).await.unwrap();

    let mut failed = operation(OperationCategory::Create, OperationState::Failed);
    failed.errors = Some(serde_json::json!({"error": "BrokerError", "description": "broker-failure"}));
    h.manager.script_status(Ok(failed));

    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());

    let status = h.store.status(&key);
    let succeeded = condition(&status, ConditionType::Succeeded);
    assert_eq!(succeeded.status, ConditionStatus::False);
    assert_eq!(succeeded.reason, Reason::CreateFailed);
    assert_eq!(succeeded.message, "broker-failure");
    assert_eq!(condition(&status, ConditionType::Failed).status, ConditionStatus::True);
    assert_eq!(condition(&status, ConditionType::Ready).status, ConditionStatus::False);
    assert_eq!(h.manager.count("provision"), 1);
}

#[tokio::test]
async fn test_rate_limited_create_is_retried_with_longer_backoff() {
    let h = Harness::new();
    h.manager.script_provision(Err(api_error(429, "too many requests")));
    let key = h.store.insert_instance(instance("db", spec()));

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(
        action,
        Action::requeue(Duration::from_millis(DEFAULT_RATE_LIMIT_BACKOFF_START_MS))
    );

    let status = h.store.status(&key);
    let succeeded = condition(&status, ConditionType::Succeeded);
    assert_eq!(succeeded.reason, Reason::CreateInProgress);
    assert_eq!(succeeded.message, "too many requests");
    assert!(status.conditions.get(ConditionType::Failed).is_none());

    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());
    assert_eq!(
        condition(&h.store.status(&key), ConditionType::Succeeded).reason,
        Reason::Created
    );
    assert_eq!(h.manager.count("provision"), 2);
}

#[tokio::test]
async fn test_transient_failures_back_off_exponentially() {
    let h = Harness::new();
    h.manager.script_provision(Err(api_error(500, "internal error")));
    h.manager
        .script_provision(Err(SmError::Transport("connection reset".to_string())));
    let key = h.store.insert_instance(instance("db", spec()));

    let first = h.reconcile(&key).await.unwrap();
    let second = h.reconcile(&key).await.unwrap();
    assert_eq!(first, Action::requeue(Duration::from_millis(DEFAULT_BACKOFF_START_MS)));
    assert_eq!(
        second,
        Action::requeue(Duration::from_millis(DEFAULT_BACKOFF_START_MS * 2))
    );
    assert_eq!(
        condition(&h.store.status(&key), ConditionType::Succeeded).reason,
        Reason::CreateInProgress
    );

    // success resets the sequence
    h.settle(&key).await;
    h.store.edit_spec(&key, |spec| spec.service_plan_name = "large".to_string());
    h.manager.script_update(Err(api_error(503, "unavailable")));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_millis(DEFAULT_BACKOFF_START_MS)));
}

#[tokio::test]
async fn test_broker_rejection_behind_bad_gateway_is_non_transient() {
    let h = Harness::new();
    h.manager.script_provision(Err(SmError::Api(ServiceManagerError::from_broker(
        502,
        400,
        "plan does not allow this",
    ))));
    let key = h.store.insert_instance(instance("db", spec()));

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(
        action,
        Action::requeue(Duration::from_secs(DEFAULT_NON_TRANSIENT_REQUEUE_SECS))
    );

    let succeeded = condition(&h.store.status(&key), ConditionType::Succeeded);
    assert_eq!(succeeded.status, ConditionStatus::False);
    assert_eq!(succeeded.reason, Reason::CreateInProgress);
    assert_eq!(succeeded.message, "plan does not allow this");
}

#[tokio::test]
async fn test_update_applies_spec_edit() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.store.edit_spec(&key, |spec| spec.service_plan_name = "large".to_string());
    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());

    let status = h.store.status(&key);
    let succeeded = condition(&status, ConditionType::Succeeded);
    assert_eq!(succeeded.status, ConditionStatus::True);
    assert_eq!(succeeded.reason, Reason::Updated);
    assert_eq!(succeeded.observed_generation, 2);
    assert_eq!(h.manager.count("update"), 1);
    assert_eq!(h.manager.count("provision"), 1);

    let calls = h.manager.calls();
    let Some(common::Call::Update(instance_id, request)) =
        calls.iter().find(|c| c.kind() == "update")
    else {
        panic!("update was called");
    };
    assert_eq!(instance_id, "instance-1");
    assert_eq!(request.service_plan_name, "large");
}

#[tokio::test]
async fn test_edit_during_async_update_waits_for_the_operation() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.manager.script_update(Ok(Some(
        "/v1/service_instances/instance-1/operations/op-1".to_string(),
    )));
    h.store.edit_spec(&key, |spec| spec.service_plan_name = "large".to_string());
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(POLL_INTERVAL));
    assert_eq!(
        condition(&h.store.status(&key), ConditionType::Succeeded).reason,
        Reason::UpdateInProgress
    );

    // a second edit while the update is in flight must not start another one
    h.store.edit_spec(&key, |spec| spec.service_plan_name = "xlarge".to_string());
    h.manager
        .script_status(Ok(operation(OperationCategory::Update, OperationState::InProgress)));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(POLL_INTERVAL));
    assert_eq!(h.manager.count("update"), 1);

    h.manager
        .script_status(Ok(operation(OperationCategory::Update, OperationState::Succeeded)));
    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());

    // the latest edit is applied after the first update finished
    assert_eq!(h.manager.count("update"), 2);
    let last_plan = h
        .manager
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            common::Call::Update(_, request) => Some(request.service_plan_name),
            _ => None,
        })
        .last();
    assert_eq!(last_plan.as_deref(), Some("xlarge"));

    let succeeded = condition(&h.store.status(&key), ConditionType::Succeeded);
    assert_eq!(succeeded.reason, Reason::Updated);
    assert_eq!(succeeded.observed_generation, 3);
}

#[tokio::test]
async fn test_failed_update_is_not_retried_until_next_edit() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.manager.script_update(Ok(Some(
        "/v1/service_instances/instance-1/operations/op-1".to_string(),
    )));
    h.store.edit_spec(&key, |spec| spec.service_plan_name = "large".to_string());
    h.reconcile(&key).await.unwrap();

    let mut failed = operation(OperationCategory::Update, OperationState::Failed);
    failed.errors = Some(serde_json::json!({"description": "plan change not allowed"}));
    h.manager.script_status(Ok(failed));
    h.settle(&key).await;

    let status = h.store.status(&key);
    assert_eq!(condition(&status, ConditionType::Succeeded).reason, Reason::UpdateFailed);
    assert_eq!(
        condition(&status, ConditionType::Failed).message,
        "plan change not allowed"
    );
    // the instance itself is still provisioned
    assert_eq!(condition(&status, ConditionType::Ready).status, ConditionStatus::True);
    assert_eq!(h.manager.count("update"), 1);

    h.store.edit_spec(&key, |spec| spec.service_plan_name = "medium".to_string());
    h.settle(&key).await;
    assert_eq!(h.manager.count("update"), 2);
    assert_eq!(
        condition(&h.store.status(&key), ConditionType::Succeeded).reason,
        Reason::Updated
    );
}

#[tokio::test]
async fn test_sharing_flag_alone_does_not_update() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.store.edit_spec(&key, |spec| spec.shared = Some(true));
    h.settle(&key).await;

    assert_eq!(h.manager.count("update"), 0);
    assert_eq!(h.manager.count("share"), 1);
    // the generation moved; conditions follow it without a remote call
    let succeeded = condition(&h.store.status(&key), ConditionType::Succeeded);
    assert_eq!(succeeded.observed_generation, 2);
}

#[tokio::test]
async fn test_lost_status_write_does_not_provision_twice() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.store.fail_next_status_writes(1);

    let err = h.reconcile(&key).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        handle_reconciliation_error(
            Arc::new(h.store.instance(&key).unwrap()),
            &err,
            Arc::clone(&h.reconciler)
        ),
        Action::requeue(Duration::from_millis(100))
    );
    assert_eq!(h.manager.count("provision"), 1);

    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());

    let status = h.store.status(&key);
    assert_eq!(status.instance_id, "instance-1");
    assert_eq!(condition(&status, ConditionType::Succeeded).status, ConditionStatus::True);
    assert_eq!(h.manager.count("provision"), 1);
    assert_eq!(h.manager.remote_count(), 1);
}

#[tokio::test]
async fn test_recovery_resumes_in_flight_operation() {
    let h = Harness::new();
    h.manager.script_provision(Ok(async_provision("abc")));
    let key = h.store.insert_instance(instance("db", spec()));
    h.store.fail_next_status_writes(1);
    assert!(h.reconcile(&key).await.unwrap_err().is_conflict());

    // the orphan is found and its operation tracked instead of provisioning again
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(POLL_INTERVAL));
    let status = h.store.status(&key);
    assert_eq!(status.instance_id, "abc");
    assert_eq!(status.operation_url, "/v1/service_instances/abc/operations/op-1");
    assert_eq!(h.manager.count("provision"), 1);

    h.manager
        .script_status(Ok(operation(OperationCategory::Create, OperationState::Succeeded)));
    h.settle(&key).await;
    assert_eq!(
        condition(&h.store.status(&key), ConditionType::Ready).status,
        ConditionStatus::True
    );
    assert_eq!(h.manager.count("provision"), 1);
}

#[tokio::test]
async fn test_recovery_ignores_instances_of_other_resources() {
    let h = Harness::new();
    h.manager.seed_remote(RemoteInstance {
        id: "foreign".to_string(),
        name: "db".to_string(),
        ready: true,
        labels: [("_k8sname".to_string(), vec!["someone-else".to_string()])]
            .into_iter()
            .collect(),
        ..Default::default()
    });
    let key = h.store.insert_instance(instance("db", spec()));

    h.settle(&key).await;
    assert_eq!(h.store.status(&key).instance_id, "instance-1");
    assert_eq!(h.manager.count("provision"), 1);
}

#[tokio::test]
async fn test_lost_operation_clears_tracking() {
    let h = Harness::new();
    h.manager.script_provision(Ok(async_provision("abc")));
    let key = h.store.insert_instance(instance("db", spec()));
    h.reconcile(&key).await.unwrap();

    h.manager.script_status(Err(api_error(404, "operation not found")));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_millis(DEFAULT_BACKOFF_START_MS)));

    let status = h.store.status(&key);
    assert!(!status.has_operation());
    assert!(status.instance_id.is_empty());
    assert_eq!(condition(&status, ConditionType::Failed).reason, Reason::CreateFailed);
}

#[tokio::test]
async fn test_delete_deprovisions_and_releases_finalizer() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.store.request_deletion(&key);
    assert!(h.store.instance(&key).is_some());

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(h.store.instance(&key).is_none());
    assert_eq!(h.manager.count("deprovision"), 1);
    assert_eq!(h.manager.remote_count(), 0);

    // a late event for the removed resource is a no-op
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::await_change());
    assert_eq!(h.manager.count("deprovision"), 1);
}

#[tokio::test]
async fn test_failed_deprovision_keeps_finalizer() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.manager.script_deprovision(Err(api_error(500, "broker unavailable")));
    h.store.request_deletion(&key);

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_millis(DEFAULT_BACKOFF_START_MS)));
    assert_eq!(finalizers(&h, &key), vec![FINALIZER_NAME.to_string()]);
    let succeeded = condition(&h.store.status(&key), ConditionType::Succeeded);
    assert_eq!(succeeded.reason, Reason::DeleteInProgress);
    assert_eq!(succeeded.message, "broker unavailable");

    h.reconcile(&key).await.unwrap();
    assert!(h.store.instance(&key).is_none());
    assert_eq!(h.manager.count("deprovision"), 2);
}

#[tokio::test]
async fn test_async_deprovision_is_tracked() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.manager.script_deprovision(Ok(Some(
        "/v1/service_instances/instance-1/operations/op-1".to_string(),
    )));
    h.store.request_deletion(&key);

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(POLL_INTERVAL));
    let status = h.store.status(&key);
    assert_eq!(status.operation_type, Some(OperationCategory::Delete));
    assert_eq!(condition(&status, ConditionType::Succeeded).reason, Reason::DeleteInProgress);

    h.manager
        .script_status(Ok(operation(OperationCategory::Delete, OperationState::Succeeded)));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(h.store.instance(&key).is_none());
    assert_eq!(h.manager.count("deprovision"), 1);
}

#[tokio::test]
async fn test_delete_during_async_create_waits_for_the_operation() {
    let h = Harness::new();
    h.manager.script_provision(Ok(async_provision("abc")));
    let key = h.store.insert_instance(instance("db", spec()));
    h.reconcile(&key).await.unwrap();

    h.store.request_deletion(&key);
    h.manager
        .script_status(Ok(operation(OperationCategory::Create, OperationState::InProgress)));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(POLL_INTERVAL));
    assert_eq!(h.manager.count("deprovision"), 0);

    h.manager
        .script_status(Ok(operation(OperationCategory::Create, OperationState::Succeeded)));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));
    assert_eq!(h.manager.count("deprovision"), 0);

    h.reconcile(&key).await.unwrap();
    assert!(h.store.instance(&key).is_none());
    assert_eq!(
        h.manager.calls().last().cloned(),
        Some(common::Call::Deprovision("abc".to_string()))
    );
}

#[tokio::test]
async fn test_delete_without_remote_instance_only_releases_finalizer() {
    let h = Harness::new();
    h.manager.script_provision(Err(api_error(400, "invalid plan")));
    let key = h.store.insert_instance(instance("db", spec()));
    h.reconcile(&key).await.unwrap();
    assert!(h.store.status(&key).instance_id.is_empty());

    h.store.request_deletion(&key);
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(h.store.instance(&key).is_none());
    assert_eq!(h.manager.count("deprovision"), 0);
}

#[tokio::test]
async fn test_delete_of_remotely_removed_instance_completes() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.manager.script_deprovision(Err(api_error(404, "instance not found")));
    h.store.request_deletion(&key);
    h.reconcile(&key).await.unwrap();
    assert!(h.store.instance(&key).is_none());
}

#[tokio::test]
async fn test_recovered_failed_instance_waits_for_an_edit() {
    let h = Harness::new();
    let mut failed = operation(OperationCategory::Create, OperationState::Failed);
    failed.errors = Some(serde_json::json!({"description": "quota exceeded"}));
    h.manager.seed_remote(orphan(false, Some(failed)));
    let key = h.store.insert_instance(instance("db", spec()));

    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());
    let status = h.store.status(&key);
    assert_eq!(status.instance_id, "abc");
    assert_eq!(condition(&status, ConditionType::Succeeded).reason, Reason::CreateFailed);
    assert_eq!(condition(&status, ConditionType::Failed).message, "quota exceeded");

    // nothing is retried while the resource stays the same
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::await_change());
    assert_eq!(h.lifecycle_calls(), 0);

    h.store.edit_spec(&key, |spec| spec.service_plan_name = "large".to_string());
    h.settle(&key).await;
    assert_eq!(h.manager.count("provision"), 0);
    let updated: Vec<String> = h
        .manager
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            common::Call::Update(id, _) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(updated, vec!["abc".to_string()]);
    assert_eq!(
        condition(&h.store.status(&key), ConditionType::Succeeded).reason,
        Reason::Updated
    );
}

#[tokio::test]
async fn test_recovered_instance_without_operation_that_is_not_ready_fails() {
    let h = Harness::new();
    h.manager.seed_remote(orphan(false, None));
    let key = h.store.insert_instance(instance("db", spec()));

    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());
    let status = h.store.status(&key);
    assert_eq!(status.instance_id, "abc");
    let succeeded = condition(&status, ConditionType::Succeeded);
    assert_eq!(succeeded.status, ConditionStatus::False);
    assert_eq!(succeeded.reason, Reason::CreateFailed);
    assert_eq!(condition(&status, ConditionType::Failed).reason, Reason::CreateFailed);
    assert_eq!(condition(&status, ConditionType::Ready).status, ConditionStatus::False);
    assert_eq!(h.manager.count("provision"), 0);
}

#[tokio::test]
async fn test_recovered_ready_instance_without_operation_is_created() {
    let h = Harness::new();
    h.manager.seed_remote(orphan(true, None));
    let key = h.store.insert_instance(instance("db", spec()));

    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());
    let status = h.store.status(&key);
    assert_eq!(status.instance_id, "abc");
    assert_eq!(condition(&status, ConditionType::Succeeded).reason, Reason::Created);
    assert_eq!(condition(&status, ConditionType::Ready).status, ConditionStatus::True);
    assert_eq!(h.lifecycle_calls(), 0);
}

#[tokio::test]
async fn test_delete_during_async_update_waits_for_the_operation() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.manager.script_update(Ok(Some(
        "/v1/service_instances/instance-1/operations/op-1".to_string(),
    )));
    h.store.edit_spec(&key, |spec| spec.service_plan_name = "large".to_string());
    h.reconcile(&key).await.unwrap();

    h.store.request_deletion(&key);
    h.manager
        .script_status(Ok(operation(OperationCategory::Update, OperationState::InProgress)));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(POLL_INTERVAL));
    assert_eq!(h.manager.count("deprovision"), 0);

    h.manager
        .script_status(Ok(operation(OperationCategory::Update, OperationState::Succeeded)));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));
    assert_eq!(h.manager.count("deprovision"), 0);

    h.reconcile(&key).await.unwrap();
    assert!(h.store.instance(&key).is_none());
    assert_eq!(
        h.manager.calls().last().cloned(),
        Some(common::Call::Deprovision("instance-1".to_string()))
    );
}

#[tokio::test]
async fn test_lost_update_operation_is_issued_again() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.manager.script_update(Ok(Some(
        "/v1/service_instances/instance-1/operations/op-1".to_string(),
    )));
    h.store.edit_spec(&key, |spec| spec.service_plan_name = "large".to_string());
    h.reconcile(&key).await.unwrap();

    h.manager.script_status(Err(api_error(404, "operation not found")));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_millis(DEFAULT_BACKOFF_START_MS)));

    let status = h.store.status(&key);
    assert!(!status.has_operation());
    assert_eq!(status.instance_id, "instance-1");
    let succeeded = condition(&status, ConditionType::Succeeded);
    assert_eq!(succeeded.reason, Reason::UpdateInProgress);
    assert_eq!(
        succeeded.message,
        "operation /v1/service_instances/instance-1/operations/op-1 no longer exists"
    );
    assert_eq!(h.manager.count("update"), 1);

    let action = h.settle(&key).await;
    assert_eq!(action, Action::await_change());
    assert_eq!(h.manager.count("update"), 2);
    assert_eq!(h.manager.count("provision"), 1);
    assert_eq!(
        condition(&h.store.status(&key), ConditionType::Succeeded).reason,
        Reason::Updated
    );
}

#[tokio::test]
async fn test_lost_delete_operation_is_retried() {
    let h = Harness::new();
    let key = h.store.insert_instance(instance("db", spec()));
    h.settle(&key).await;

    h.manager.script_deprovision(Ok(Some(
        "/v1/service_instances/instance-1/operations/op-1".to_string(),
    )));
    h.store.request_deletion(&key);
    assert_eq!(h.reconcile(&key).await.unwrap(), Action::requeue(POLL_INTERVAL));

    h.manager.script_status(Err(api_error(404, "operation not found")));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_millis(DEFAULT_BACKOFF_START_MS)));
    let status = h.store.status(&key);
    assert!(!status.has_operation());
    assert_eq!(status.instance_id, "instance-1");
    assert_eq!(condition(&status, ConditionType::Failed).reason, Reason::DeleteFailed);
    assert_eq!(finalizers(&h, &key), vec![FINALIZER_NAME.to_string()]);

    h.reconcile(&key).await.unwrap();
    assert!(h.store.instance(&key).is_none());
    assert_eq!(h.manager.count("deprovision"), 2);
}

//! End-to-end pipeline tests over the in-memory cluster.

use std::sync::Arc;

use scriptexec_core::approval::{ConfigMapStore, Status, Store};
use scriptexec_core::audit::{AuditSink, JsonlSink};
use scriptexec_core::cluster::fake::AutoOutcome;
use scriptexec_core::cluster::types::{ConfigMap, ObjectMeta, ResourceName};
use scriptexec_core::cluster::{FakeCluster, Quantity};
use scriptexec_core::config::ExecutorConfig;
use scriptexec_core::execution::{ExecStatus, ExecuteRequest, Manager, StepContext};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

const NS: &str = "opscontrolroom-system";

fn request(execution_id: &str, parameters: serde_json::Value) -> ExecuteRequest {
    ExecuteRequest {
        step_type: "script.run".into(),
        context: StepContext {
            execution_id: execution_id.into(),
            runbook_id: "rb-main".into(),
            user: "alice".into(),
            step_name: "step-a".into(),
        },
        parameters,
        timeout: None,
    }
}

fn seed_catalog(cluster: &FakeCluster, yaml: &str) {
    cluster.insert_config_map(ConfigMap {
        metadata: ObjectMeta {
            name: "script-image-catalog".into(),
            namespace: NS.into(),
            ..ObjectMeta::default()
        },
        data: [("catalog.yaml".to_string(), yaml.to_string())].into(),
    });
}

fn manager(cluster: &Arc<FakeCluster>) -> Manager {
    Manager::new(ExecutorConfig::default(), cluster.clone())
}

#[tokio::test]
async fn inline_happy_path() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.set_auto_outcome(AutoOutcome::success("ok\n"));
    let manager = manager(&cluster);

    let script = "#!/bin/sh\nexit 0";
    let response = manager
        .execute(
            &request("e2e-1", json!({"inline_script": script, "image": "alpine:3"})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, ExecStatus::Succeeded);
    assert!(response.error.is_none());
    let output = response.output.unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.output, "ok\n");
    assert!(output.job_name.starts_with("script-exec-"));
    assert_eq!(
        output.script_hash,
        hex::encode(Sha256::digest(script.as_bytes()))
    );

    // The submitted manifest honors the pipeline's invariants.
    let job = cluster.job(NS, "script-exec-e2e-1").unwrap();
    assert_eq!(
        job.spec.template.spec.containers[0].image,
        "alpine:3".to_string()
    );
    assert_eq!(job.spec.active_deadline_seconds, Some(300));
    assert!(job.spec.backoff_limit.unwrap() <= 3);
    let limits = &job.spec.template.spec.containers[0].resources.limits;
    assert!(limits[&ResourceName::Cpu] <= Quantity::parse("4000m").unwrap());
    assert!(limits[&ResourceName::Memory] <= Quantity::parse("8Gi").unwrap());
}

#[tokio::test]
async fn blocked_command_short_circuits_before_the_cluster() {
    let cluster = Arc::new(FakeCluster::new());
    let manager = manager(&cluster);

    let response = manager
        .execute(
            &request("e2e-2", json!({"inline_script": "rm -rf /data", "image": "alpine:3"})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, ExecStatus::Failed);
    let error = response.error.unwrap();
    assert!(error.contains("blocked command"), "unexpected error: {error}");
    assert!(error.contains("rm"));
    assert!(cluster.job(NS, "script-exec-e2e-2").is_none());
}

#[tokio::test]
async fn failing_script_reports_exit_code_with_output() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.set_auto_outcome(AutoOutcome::failure(2, "no such file\n"));
    let manager = manager(&cluster);

    let response = manager
        .execute(
            &request("e2e-3", json!({"inline_script": "ls /missing", "image": "alpine:3"})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, ExecStatus::Failed);
    assert_eq!(response.error.as_deref(), Some("exit code 2"));
    let output = response.output.unwrap();
    assert_eq!(output.exit_code, 2);
    assert_eq!(output.output, "no such file\n");
}

#[tokio::test]
async fn image_ref_resolves_through_the_catalog() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.set_auto_outcome(AutoOutcome::success(""));
    seed_catalog(
        &cluster,
        "terraform:\n  image: harbor.internal/tools/terraform:1.7\n  pull_secret: harbor-pull\n",
    );
    let manager = manager(&cluster);

    let response = manager
        .execute(
            &request("e2e-4", json!({"inline_script": "terraform plan", "image_ref": "terraform"})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(response.status, ExecStatus::Succeeded);

    let job = cluster.job(NS, "script-exec-e2e-4").unwrap();
    let pod = &job.spec.template.spec;
    assert_eq!(pod.containers[0].image, "harbor.internal/tools/terraform:1.7");
    assert_eq!(pod.image_pull_secrets[0].name, "harbor-pull");
}

#[tokio::test]
async fn unknown_image_ref_fails() {
    let cluster = Arc::new(FakeCluster::new());
    seed_catalog(&cluster, "terraform:\n  image: t:1\n");
    let manager = manager(&cluster);

    let response = manager
        .execute(
            &request("e2e-5", json!({"inline_script": "true", "image_ref": "ansible"})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(response.status, ExecStatus::Failed);
    assert!(response.error.unwrap().contains("ansible"));
}

#[tokio::test]
async fn approval_gate_pends_then_runs_once_approved() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.set_auto_outcome(AutoOutcome::success("done\n"));
    let manager = manager(&cluster);
    let parameters = json!({
        "inline_script": "echo sensitive",
        "image": "alpine:3",
        "approval_required": true,
        "approvers": ["alice"],
    });

    // First pass: pending, record created, no workload.
    let response = manager
        .execute(&request("e2e-6", parameters.clone()), CancellationToken::new())
        .await;
    assert_eq!(response.status, ExecStatus::Pending);
    assert_eq!(response.error.as_deref(), Some("Awaiting approval"));
    assert!(response.output.is_none());
    assert!(cluster.job(NS, "script-exec-e2e-6").is_none());

    let store = ConfigMapStore::new(cluster.clone(), NS, "script-approvals");
    let record = store.get("e2e-6", "step-a").await.unwrap();
    assert_eq!(record.status, Status::Pending);
    assert_eq!(record.approvers, vec!["alice".to_string()]);
    assert_eq!(record.script, "echo sensitive");

    // Unauthorized decision leaves it pending.
    let checker = manager.approval_checker().unwrap();
    assert!(checker.approve("e2e-6", "step-a", "mallory").await.is_err());

    // Authorized approval, then the same request proceeds.
    checker.approve("e2e-6", "step-a", "alice").await.unwrap();
    let response = manager
        .execute(&request("e2e-6", parameters), CancellationToken::new())
        .await;
    assert_eq!(response.status, ExecStatus::Succeeded);
    assert!(cluster.job(NS, "script-exec-e2e-6").is_some());
}

#[tokio::test]
async fn denied_execution_short_circuits() {
    let cluster = Arc::new(FakeCluster::new());
    let manager = manager(&cluster);
    let parameters = json!({
        "inline_script": "echo sensitive",
        "image": "alpine:3",
        "approval_required": true,
        "approvers": ["alice"],
    });

    manager
        .execute(&request("e2e-7", parameters.clone()), CancellationToken::new())
        .await;
    manager
        .approval_checker()
        .unwrap()
        .deny("e2e-7", "step-a", "alice", "not in this window")
        .await
        .unwrap();

    let response = manager
        .execute(&request("e2e-7", parameters), CancellationToken::new())
        .await;
    assert_eq!(response.status, ExecStatus::Failed);
    assert_eq!(response.error.as_deref(), Some("execution was denied"));
    assert!(cluster.job(NS, "script-exec-e2e-7").is_none());
}

#[tokio::test(start_paused = true)]
async fn stuck_workload_times_out() {
    let cluster = Arc::new(FakeCluster::new());
    // No auto outcome: the workload never reaches a terminal state.
    let manager = manager(&cluster);

    let response = manager
        .execute(
            &request(
                "e2e-8",
                json!({"inline_script": "sleep 1000", "image": "alpine:3", "timeout": "2s"}),
            ),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, ExecStatus::Failed);
    assert!(response.error.unwrap().contains("timed out"));
    // The workload is left for TTL cleanup, not deleted.
    assert!(cluster.job(NS, "script-exec-e2e-8").is_some());
}

#[tokio::test]
async fn duplicate_submission_reports_failed() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.set_auto_outcome(AutoOutcome::success(""));
    let manager = manager(&cluster);
    let parameters = json!({"inline_script": "true", "image": "alpine:3"});

    let first = manager
        .execute(&request("e2e-9", parameters.clone()), CancellationToken::new())
        .await;
    assert_eq!(first.status, ExecStatus::Succeeded);

    let second = manager
        .execute(&request("e2e-9", parameters), CancellationToken::new())
        .await;
    assert_eq!(second.status, ExecStatus::Failed);
    assert!(second.error.unwrap().contains("already exists"));
}

#[tokio::test]
async fn path_mode_runs_with_empty_hash() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.set_auto_outcome(AutoOutcome::success(""));
    cluster.insert_config_map(ConfigMap {
        metadata: ObjectMeta {
            name: "approved-scripts".into(),
            namespace: NS.into(),
            ..ObjectMeta::default()
        },
        data: [("health.sh".to_string(), "uptime".to_string())].into(),
    });
    let manager = manager(&cluster);

    let response = manager
        .execute(
            &request("e2e-10", json!({"script_path": "/scripts/health.sh", "image": "alpine:3"})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(response.status, ExecStatus::Succeeded);
    assert_eq!(response.output.unwrap().script_hash, "");

    let job = cluster.job(NS, "script-exec-e2e-10").unwrap();
    assert_eq!(
        job.spec.template.spec.containers[0].command,
        vec!["/bin/bash", "/scripts/health.sh"]
    );
}

#[tokio::test]
async fn terminal_outcomes_are_audited() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.set_auto_outcome(AutoOutcome::success("ok\n"));
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.log");
    let sink = Arc::new(JsonlSink::open(&audit_path).await.unwrap());
    let manager = Manager::new(ExecutorConfig::default(), cluster.clone())
        .with_audit_sink(sink.clone());

    manager
        .execute(
            &request("e2e-11", json!({"inline_script": "echo ok", "image": "alpine:3"})),
            CancellationToken::new(),
        )
        .await;
    manager
        .execute(
            &request("e2e-12", json!({"inline_script": "rm -rf /", "image": "alpine:3"})),
            CancellationToken::new(),
        )
        .await;

    let contents = std::fs::read_to_string(&audit_path).unwrap();
    let records: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["outcome"], "succeeded");
    assert_eq!(records[0]["exit_code"], 0);
    assert_eq!(records[1]["outcome"], "failed");
    assert_eq!(sink.write_failures(), 0);
}

// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end deployment lifecycle over in-process backends.
//!
//! Walks the path a real deploy takes: dispatch inserts the deployment and
//! marks the service, the worker reports progress through the status-update
//! path, and reads resolve against live container state along the way.

mod common;

use berth_core::CoreError;
use berth_core::model::{ContainerState, CredentialProvider, DeploymentStatus, ServiceStatus};
use berth_core::persistence::{DeploymentRepository, ServiceRepository};
use common::TestContext;

#[tokio::test]
async fn test_deploy_lifecycle_from_queue_to_running() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    let service = ctx.app_service(&alice, "api").await;

    // Dispatch: deployment inserted QUEUED, service marked DEPLOYING,
    // exactly one job handed to the worker queue.
    let deployment = ctx
        .dispatcher
        .create_and_queue_deployment(service.id, alice.user_id, Some("abc1234"))
        .await
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Queued);
    assert_eq!(deployment.commit_hash.as_deref(), Some("abc1234"));

    let stored = ctx.repo.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServiceStatus::Deploying);

    let jobs = ctx.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].deployment_id, deployment.id);
    assert_eq!(jobs[0].service_name, "api");
    assert_eq!(jobs[0].requester_username, "alice");
    assert_eq!(jobs[0].environment_name.as_deref(), Some("test"));

    // Worker picks the job up.
    ctx.dispatcher
        .update_deployment_status(
            deployment.id,
            DeploymentStatus::Building,
            Some("cloning repository\n"),
        )
        .await
        .unwrap();

    // Mid-build reads still show DEPLOYING.
    let view = ctx
        .control
        .get_service(service.id, alice.user_id)
        .await
        .unwrap();
    assert_eq!(view.status, ServiceStatus::Deploying);

    // Worker finishes; the container it started shows up in the engine.
    ctx.seed_running_container(&service).await;
    ctx.dispatcher
        .update_deployment_status(deployment.id, DeploymentStatus::Success, Some("build ok\n"))
        .await
        .unwrap();

    let stored = ctx.repo.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServiceStatus::Running);

    let view = ctx
        .control
        .get_service(service.id, alice.user_id)
        .await
        .unwrap();
    assert_eq!(view.status, ServiceStatus::Running);
    assert!(view.live);
    assert_eq!(view.containers.len(), 1);
    assert_eq!(
        view.latest_deployment.as_ref().map(|d| d.status),
        Some(DeploymentStatus::Success)
    );

    // Worker log chunks accumulated on the deployment row.
    let finished = ctx
        .dispatcher
        .get_deployment(deployment.id, alice.user_id)
        .await
        .unwrap();
    assert!(finished.logs.contains("cloning repository"));
    assert!(finished.logs.contains("build ok"));
}

#[tokio::test]
async fn test_failed_build_marks_service_failed() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    let service = ctx.app_service(&alice, "api").await;

    let deployment = ctx
        .dispatcher
        .create_and_queue_deployment(service.id, alice.user_id, None)
        .await
        .unwrap();

    ctx.dispatcher
        .update_deployment_status(
            deployment.id,
            DeploymentStatus::Failed,
            Some("npm run build exited with 1\n"),
        )
        .await
        .unwrap();

    let stored = ctx.repo.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServiceStatus::Failed);

    let failed = ctx
        .dispatcher
        .get_deployment(deployment.id, alice.user_id)
        .await
        .unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed.logs.contains("exited with 1"));
}

#[tokio::test]
async fn test_dispatch_attaches_decrypted_credential() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    let service = ctx.app_service(&alice, "api").await;

    let sealed = ctx.cipher.encrypt("ghp_secret_token").unwrap();
    ctx.repo
        .link_credential(alice.user_id, CredentialProvider::Github, &sealed);

    ctx.dispatcher
        .create_and_queue_deployment(service.id, alice.user_id, None)
        .await
        .unwrap();

    let jobs = ctx.queue.jobs();
    assert_eq!(jobs[0].credential_token.as_deref(), Some("ghp_secret_token"));
    assert_eq!(
        jobs[0].repo_url.as_deref(),
        Some("https://ghp_secret_token@github.com/acme/api.git")
    );
}

#[tokio::test]
async fn test_mismatched_provider_clones_unauthenticated() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    // github.com repository, gitlab credential.
    let service = ctx.app_service(&alice, "api").await;
    let sealed = ctx.cipher.encrypt("glpat-secret").unwrap();
    ctx.repo
        .link_credential(alice.user_id, CredentialProvider::Gitlab, &sealed);

    ctx.dispatcher
        .create_and_queue_deployment(service.id, alice.user_id, None)
        .await
        .unwrap();

    let jobs = ctx.queue.jobs();
    assert_eq!(jobs[0].credential_token, None);
    assert_eq!(
        jobs[0].repo_url.as_deref(),
        Some("https://github.com/acme/api.git")
    );
}

#[tokio::test]
async fn test_failed_handoff_marks_deployment_failed() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    let service = ctx.app_service(&alice, "api").await;

    ctx.queue.fail_next();
    let err = ctx
        .dispatcher
        .create_and_queue_deployment(service.id, alice.user_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "QUEUE_ERROR");

    // The row exists and is already FAILED, so no worker report is needed
    // to get the history out of limbo.
    let latest = ctx
        .repo
        .latest_deployment(service.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.status, DeploymentStatus::Failed);
    assert!(latest.logs.contains("Dispatch failed"));
}

#[tokio::test]
async fn test_tenant_cannot_touch_foreign_resources() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    let (mallory, _) = ctx.signed_in("mallory");
    let service = ctx.app_service(&alice, "api").await;
    let deployment = ctx
        .dispatcher
        .create_and_queue_deployment(service.id, alice.user_id, None)
        .await
        .unwrap();

    let err = ctx
        .dispatcher
        .get_deployment(deployment.id, mallory.user_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::NotFound {
            resource: "deployment",
            ..
        }
    ));

    let err = ctx
        .dispatcher
        .create_and_queue_deployment(service.id, mallory.user_id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::NotFound {
            resource: "service",
            ..
        }
    ));

    let err = ctx
        .control
        .get_service(service.id, mallory.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));

    // One queued job total; mallory's attempts never dispatched anything.
    assert_eq!(ctx.queue.jobs().len(), 1);
}

#[tokio::test]
async fn test_restart_swaps_containers_and_persists_running() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    let service = ctx.app_service(&alice, "api").await;
    let old_id = ctx.seed_running_container(&service).await;

    let report = ctx.control.restart(service.id, alice.user_id).await.unwrap();
    assert_ne!(report.replacement_id, old_id);
    assert_eq!(report.replaced, vec![old_id.clone()]);
    assert!(report.cleanup.is_clean());

    // Old container gone, replacement running.
    assert!(ctx.runtime.get(&old_id).await.is_none());
    let replacement = ctx.runtime.get(&report.replacement_id).await.unwrap();
    assert_eq!(replacement.info.state, ContainerState::Running);

    let stored = ctx.repo.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServiceStatus::Running);
}

#[tokio::test]
async fn test_stop_halts_containers_and_persists_stopped() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    let service = ctx.app_service(&alice, "api").await;
    let container = ctx.seed_running_container(&service).await;

    let report = ctx.control.stop(service.id, alice.user_id).await.unwrap();
    assert_eq!(report.stopped, vec![container.clone()]);
    assert!(report.failures.is_empty());

    let stopped = ctx.runtime.get(&container).await.unwrap();
    assert_eq!(stopped.info.state, ContainerState::Exited);

    let view = ctx
        .control
        .get_service(service.id, alice.user_id)
        .await
        .unwrap();
    assert_eq!(view.status, ServiceStatus::Stopped);
}

#[tokio::test]
async fn test_delete_stops_containers_and_hides_service() {
    let ctx = TestContext::new();
    let (alice, _) = ctx.signed_in("alice");
    let service = ctx.app_service(&alice, "api").await;
    let container = ctx.seed_running_container(&service).await;

    ctx.control
        .delete_service(service.id, alice.user_id)
        .await
        .unwrap();

    let err = ctx
        .control
        .get_service(service.id, alice.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));

    let stopped = ctx.runtime.get(&container).await.unwrap();
    assert_eq!(stopped.info.state, ContainerState::Exited);

    // The freed name is reusable immediately.
    let replacement = ctx.app_service(&alice, "api").await;
    assert_ne!(replacement.id, service.id);
}

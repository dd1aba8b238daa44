//! Standalone install, commit, rollback and resume

use std::time::Duration;

use otagent::deploy::standalone::{self, StandaloneResult};
use otagent::deploy::Flavor;
use otagent::errors::AgentError;
use otagent::storage::provides::add_inconsistent_suffix;
use otagent::update_module::ModuleCall::*;
use otagent::update_module::{RebootAction, RollbackSupport};

use crate::common::*;

async fn install(harness: &Harness) -> Result<StandaloneResult, AgentError> {
    standalone::install(harness.context(Flavor::Standalone), NEW_ARTIFACT_URI).await
}

#[tokio::test]
async fn test_install_then_commit() {
    let harness = Harness::new(FakeModule::new(RebootAction::Yes, RollbackSupport::Yes)).await;

    let result = install(&harness).await.unwrap();
    assert_eq!(
        result,
        StandaloneResult::Installed {
            reboot_required: true
        }
    );
    assert_eq!(result.exit_code(true), 4);
    assert_eq!(result.exit_code(false), 0);
    assert_eq!(
        harness.module.calls(),
        vec![Download, SupportsRollback, ArtifactInstall, NeedsArtifactReboot]
    );
    assert!(harness.update_in_progress().await);
    assert_eq!(harness.artifact_name().await, OLD_ARTIFACT);

    let marker = harness.store().standalone_marker().await.unwrap().unwrap();
    assert_eq!(marker.artifact_name, NEW_ARTIFACT);

    let result = standalone::commit(harness.context(Flavor::Standalone))
        .await
        .unwrap();
    assert_eq!(result, StandaloneResult::Committed);
    assert_eq!(
        harness.module.state_calls(),
        vec![Download, ArtifactInstall, ArtifactCommit, Cleanup]
    );
    assert_eq!(harness.artifact_name().await, NEW_ARTIFACT);
    assert!(!harness.update_in_progress().await);
    assert!(harness.store().standalone_marker().await.unwrap().is_none());
}

#[tokio::test]
async fn test_second_install_is_refused() {
    let harness = Harness::new(FakeModule::new(RebootAction::No, RollbackSupport::Yes)).await;
    install(&harness).await.unwrap();

    let result = install(&harness).await;

    assert!(matches!(result, Err(AgentError::UpdateInProgress(_))));
    assert_eq!(harness.module.count(Download), 1);
}

#[tokio::test]
async fn test_install_then_rollback() {
    let harness = Harness::new(FakeModule::new(RebootAction::No, RollbackSupport::Yes)).await;
    install(&harness).await.unwrap();

    let result = standalone::rollback(harness.context(Flavor::Standalone))
        .await
        .unwrap();

    assert_eq!(result, StandaloneResult::RolledBack);
    assert_eq!(result.exit_code(false), 0);
    assert_eq!(
        harness.module.state_calls(),
        vec![Download, ArtifactInstall, ArtifactRollback, Cleanup]
    );
    assert_eq!(harness.artifact_name().await, OLD_ARTIFACT);
    assert!(!harness.update_in_progress().await);
}

#[tokio::test]
async fn test_install_without_rollback_support_commits_right_away() {
    let harness = Harness::new(FakeModule::new(RebootAction::No, RollbackSupport::No)).await;

    let result = install(&harness).await.unwrap();

    assert_eq!(
        result,
        StandaloneResult::InstalledAndCommitted {
            reboot_required: false
        }
    );
    assert_eq!(
        harness.module.state_calls(),
        vec![Download, ArtifactInstall, ArtifactCommit, Cleanup]
    );
    assert_eq!(harness.artifact_name().await, NEW_ARTIFACT);
    assert_eq!(
        harness.provides().await.get("rootfs-image.checksum"),
        Some(&"sha-of-release-2".to_string())
    );
    assert!(!harness.update_in_progress().await);
}

#[tokio::test]
async fn test_malformed_query_answers_are_treated_as_no() {
    let module =
        FakeModule::new(RebootAction::Yes, RollbackSupport::Yes).with_malformed_queries();
    let harness = Harness::new(module).await;

    let result = install(&harness).await.unwrap();

    assert_eq!(
        result,
        StandaloneResult::InstalledAndCommitted {
            reboot_required: false
        }
    );
    assert_eq!(harness.artifact_name().await, NEW_ARTIFACT);
}

#[tokio::test]
async fn test_install_failure_marks_inconsistent() {
    let module = FakeModule::new(RebootAction::No, RollbackSupport::No).failing(ArtifactInstall);
    let harness = Harness::new(module).await;

    let result = install(&harness).await.unwrap();

    assert_eq!(result, StandaloneResult::Failed { rolled_back: false });
    assert_eq!(result.exit_code(false), 1);
    assert_eq!(
        harness.module.state_calls(),
        vec![Download, ArtifactInstall, ArtifactFailure, Cleanup]
    );
    assert_eq!(
        harness.artifact_name().await,
        add_inconsistent_suffix(NEW_ARTIFACT)
    );
    assert!(!harness.update_in_progress().await);
}

#[tokio::test]
async fn test_download_failure_changes_nothing() {
    let module = FakeModule::new(RebootAction::No, RollbackSupport::Yes).failing(Download);
    let harness = Harness::new(module).await;

    let result = install(&harness).await.unwrap();

    assert_eq!(result, StandaloneResult::FailedNothingDone);
    assert_eq!(harness.module.calls(), vec![Download, Cleanup]);
    assert_eq!(harness.artifact_name().await, OLD_ARTIFACT);
    assert!(!harness.update_in_progress().await);
}

#[tokio::test]
async fn test_unusable_artifacts_are_refused_before_download() {
    let harness = Harness::new(FakeModule::new(RebootAction::No, RollbackSupport::Yes)).await;
    let second_payload = FakeArtifact::rootfs(NEW_ARTIFACT).with_header(|header| {
        let payload = header.payloads[0].clone();
        header.payloads.push(payload);
    });
    let unknown_type = FakeArtifact::rootfs(NEW_ARTIFACT).with_header(|header| {
        header.payloads[0].payload_type = "deb".to_string();
    });
    let other_device = FakeArtifact::rootfs(NEW_ARTIFACT).with_header(|header| {
        header
            .depends
            .insert("device_type".to_string(), vec!["beaglebone".to_string()]);
    });
    let needs_provides = FakeArtifact::rootfs(NEW_ARTIFACT).with_header(|header| {
        header
            .depends
            .insert("rootfs-image.checksum".to_string(), vec!["sha-of-release-0".to_string()]);
    });

    for artifact in [second_payload, unknown_type, other_device, needs_provides] {
        harness.artifacts.add(NEW_ARTIFACT_URI, artifact);

        let result = install(&harness).await.unwrap();

        assert_eq!(result, StandaloneResult::FailedNothingDone);
        assert!(harness.module.calls().is_empty());
        assert!(!harness.update_in_progress().await);
        assert_eq!(harness.artifact_name().await, OLD_ARTIFACT);
    }
}

#[tokio::test]
async fn test_artifact_without_payload_only_updates_identity() {
    let harness = Harness::new(FakeModule::new(RebootAction::No, RollbackSupport::Yes)).await;
    harness.artifacts.add(
        NEW_ARTIFACT_URI,
        FakeArtifact::rootfs(NEW_ARTIFACT).with_header(|header| header.payloads.clear()),
    );

    let result = install(&harness).await.unwrap();

    assert!(result.is_success());
    assert!(harness.module.calls().is_empty());
    assert_eq!(harness.artifact_name().await, NEW_ARTIFACT);
    assert!(!harness.update_in_progress().await);
}

#[tokio::test]
async fn test_commands_without_update_in_progress() {
    let harness = Harness::new(FakeModule::new(RebootAction::No, RollbackSupport::Yes)).await;

    let commit = standalone::commit(harness.context(Flavor::Standalone))
        .await
        .unwrap();
    let rollback = standalone::rollback(harness.context(Flavor::Standalone))
        .await
        .unwrap();
    let resume = standalone::resume(harness.context(Flavor::Standalone))
        .await
        .unwrap();

    for result in [commit, rollback, resume] {
        assert_eq!(result, StandaloneResult::NoUpdateInProgress);
        assert_eq!(result.exit_code(false), 2);
    }
    assert!(harness.module.calls().is_empty());
}

#[tokio::test]
async fn test_failed_checkpoint_aborts_before_download() {
    let harness = Harness::new(FakeModule::new(RebootAction::No, RollbackSupport::Yes)).await;
    harness.db.fail_next_commits(1);

    let result = install(&harness).await.unwrap();

    assert_eq!(result, StandaloneResult::FailedNothingDone);
    assert_eq!(harness.module.calls(), vec![Cleanup]);
    assert_eq!(harness.artifact_name().await, OLD_ARTIFACT);
    assert!(!harness.update_in_progress().await);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_commit_is_resumed() {
    let harness = Harness::new(FakeModule::new(RebootAction::No, RollbackSupport::Yes)).await;
    install(&harness).await.unwrap();

    let crashing = harness.restarted(
        FakeModule::new(RebootAction::No, RollbackSupport::Yes).hanging_on(ArtifactCommit),
    );
    let interrupted = tokio::time::timeout(
        Duration::from_secs(60),
        standalone::commit(crashing.context(Flavor::Standalone)),
    )
    .await;
    assert!(interrupted.is_err());

    let restarted = harness.restarted(FakeModule::new(RebootAction::No, RollbackSupport::Yes));
    let result = standalone::resume(restarted.context(Flavor::Standalone))
        .await
        .unwrap();

    assert_eq!(result, StandaloneResult::Committed);
    assert_eq!(restarted.module.calls(), vec![ArtifactCommit, Cleanup]);
    assert_eq!(harness.artifact_name().await, NEW_ARTIFACT);
    assert!(!harness.update_in_progress().await);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_install_can_only_be_rolled_back() {
    let crashing = Harness::new(
        FakeModule::new(RebootAction::No, RollbackSupport::Yes).hanging_on(ArtifactInstall),
    )
    .await;
    let interrupted = tokio::time::timeout(Duration::from_secs(60), install(&crashing)).await;
    assert!(interrupted.is_err());

    // the rollback answer was stored with the install checkpoint
    let loaded = crashing.store().load().await.unwrap().unwrap();
    assert_eq!(loaded.data.state, "update-install");
    assert_eq!(
        loaded.data.update_info.supports_rollback,
        Some(RollbackSupport::Yes)
    );

    let restarted = crashing.restarted(FakeModule::new(RebootAction::No, RollbackSupport::Yes));
    let commit = standalone::commit(restarted.context(Flavor::Standalone)).await;
    assert!(matches!(commit, Err(AgentError::ValidationError(_))));

    let result = standalone::rollback(restarted.context(Flavor::Standalone))
        .await
        .unwrap();

    assert_eq!(result, StandaloneResult::RolledBack);
    assert_eq!(
        restarted.module.calls(),
        vec![ArtifactRollback, Cleanup]
    );
    assert_eq!(restarted.artifact_name().await, OLD_ARTIFACT);
    assert!(!restarted.update_in_progress().await);
}

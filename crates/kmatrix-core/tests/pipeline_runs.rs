//! Pipeline classification and isolation, driven through scripted providers.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use kmatrix_core::fakes::{ScriptedBuildProvider, ScriptedVmProvider};
use kmatrix_core::*;
use tempfile::TempDir;

/// Artifact sources with a Makefile and a test script.
fn artifact_dir(kind: ArtifactKind) -> (TempDir, Artifact) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Makefile"), "obj-m += hello.o\n").unwrap();
    std::fs::write(dir.path().join("hello.c"), "int init_module(void) { return 0; }\n").unwrap();
    std::fs::write(dir.path().join("test.sh"), "#!/bin/sh\ntest -e \"$1\"\n").unwrap();
    let artifact = Artifact::new("hello", kind, dir.path());
    (dir, artifact)
}

fn target(release: &str) -> Arc<KernelDescriptor> {
    Arc::new(KernelDescriptor::new(
        "Ubuntu",
        "18.04",
        release,
        format!("/k/vmlinuz-{release}"),
        "/r/ubuntu-18.04.img",
    ))
}

fn request(artifact: &Artifact, release: &str, attempt: u32) -> RunRequest {
    RunRequest {
        artifact: Arc::new(artifact.clone()),
        target: target(release),
        attempt,
        tag: "it".to_string(),
    }
}

fn pipeline(
    builder: Arc<ScriptedBuildProvider>,
    vms: Arc<ScriptedVmProvider>,
    config: PipelineConfig,
) -> Pipeline {
    Pipeline::new(builder, vms, config)
}

fn short_timeouts() -> PipelineConfig {
    PipelineConfig {
        build_timeout: Duration::from_millis(500),
        provision_timeout: Duration::from_millis(300),
        run_timeout: Duration::from_millis(300),
        dist_dir: None,
    }
}

#[tokio::test]
async fn successful_module_run() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Module);
    let builder = Arc::new(ScriptedBuildProvider::new());
    let vms = Arc::new(ScriptedVmProvider::new());
    let stats = vms.stats();

    let outcome = pipeline(builder, vms, PipelineConfig::default())
        .run(&request(&artifact, "4.15.0-20-generic", 1))
        .await;

    assert_eq!(outcome.verdict, Verdict::Success);
    assert_eq!(outcome.tag, "it");
    assert_eq!(outcome.artifact_kind, "module");
    assert_eq!(outcome.target.release, "4.15.0-20-generic");
    assert_eq!(outcome.artifact_digest.as_ref().map(String::len), Some(64));
    assert!(outcome.output.contains("==> build"));
    assert!(outcome.output.contains("test done"));
    assert!(outcome.finished_at >= outcome.started_at);
    assert_eq!(stats.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(stats.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn build_failure_is_infra_error_and_launches_nothing() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Module);
    let vms = Arc::new(ScriptedVmProvider::new());
    let stats = vms.stats();

    let outcome = pipeline(
        Arc::new(ScriptedBuildProvider::new().failing()),
        vms,
        PipelineConfig::default(),
    )
    .run(&request(&artifact, "4.15.0-20-generic", 1))
    .await;

    assert_eq!(
        outcome.verdict,
        Verdict::InfraError {
            reason: InfraReason::BuildFailed
        }
    );
    assert_eq!(outcome.artifact_digest, None);
    assert!(outcome.output.contains("implicit declaration"));
    assert_eq!(stats.launched.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn build_timeout_is_infra_error() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Exploit);

    let outcome = pipeline(
        Arc::new(ScriptedBuildProvider::new().with_delay(Duration::from_secs(30))),
        Arc::new(ScriptedVmProvider::new()),
        short_timeouts(),
    )
    .run(&request(&artifact, "5.4.0-26-generic", 1))
    .await;

    assert_eq!(
        outcome.verdict,
        Verdict::InfraError {
            reason: InfraReason::BuildFailed
        }
    );
}

#[tokio::test]
async fn launch_failure_and_boot_timeout_are_distinct() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Module);

    let failed = pipeline(
        Arc::new(ScriptedBuildProvider::new()),
        Arc::new(ScriptedVmProvider::new().launch_failing()),
        short_timeouts(),
    )
    .run(&request(&artifact, "4.15.0-20-generic", 1))
    .await;
    assert_eq!(
        failed.verdict,
        Verdict::InfraError {
            reason: InfraReason::LaunchFailed
        }
    );
    assert!(failed.artifact_digest.is_some());

    let hung = pipeline(
        Arc::new(ScriptedBuildProvider::new()),
        Arc::new(ScriptedVmProvider::new().with_boot_delay(Duration::from_secs(30))),
        short_timeouts(),
    )
    .run(&request(&artifact, "4.15.0-20-generic", 1))
    .await;
    assert_eq!(hung.verdict, Verdict::Timeout);
}

#[tokio::test]
async fn nonzero_test_exit_is_test_failure() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Exploit);

    let outcome = pipeline(
        Arc::new(ScriptedBuildProvider::new()),
        Arc::new(ScriptedVmProvider::new().with_test_exit(1)),
        PipelineConfig::default(),
    )
    .run(&request(&artifact, "4.15.0-20-generic", 1))
    .await;

    assert_eq!(outcome.verdict, Verdict::TestFailed);
    assert!(outcome.output.contains("exit status 1"));
}

#[tokio::test]
async fn insmod_failure_is_test_failure_only_for_modules() {
    let (_m, module) = artifact_dir(ArtifactKind::Module);
    let (_e, exploit) = artifact_dir(ArtifactKind::Exploit);

    let vms = Arc::new(ScriptedVmProvider::new().insmod_failing());
    let p = pipeline(
        Arc::new(ScriptedBuildProvider::new()),
        vms,
        PipelineConfig::default(),
    );

    let module_run = p.run(&request(&module, "4.15.0-20-generic", 1)).await;
    assert_eq!(module_run.verdict, Verdict::TestFailed);
    assert!(module_run.output.contains("could not insert module"));

    let exploit_run = p.run(&request(&exploit, "4.15.0-20-generic", 1)).await;
    assert_eq!(exploit_run.verdict, Verdict::Success);
}

#[tokio::test]
async fn run_timeout_still_tears_down() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Exploit);
    let vms = Arc::new(ScriptedVmProvider::new().with_run_delay(Duration::from_secs(30)));
    let stats = vms.stats();

    let outcome = pipeline(Arc::new(ScriptedBuildProvider::new()), vms, short_timeouts())
        .run(&request(&artifact, "4.15.0-20-generic", 1))
        .await;

    assert_eq!(outcome.verdict, Verdict::Timeout);
    assert_eq!(stats.launched.load(Ordering::SeqCst), 1);
    assert_eq!(stats.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_test_script_is_deploy_failure() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Exploit);
    let artifact = artifact.with_test_script("/nonexistent/test.sh");

    let outcome = pipeline(
        Arc::new(ScriptedBuildProvider::new()),
        Arc::new(ScriptedVmProvider::new()),
        PipelineConfig::default(),
    )
    .run(&request(&artifact, "4.15.0-20-generic", 1))
    .await;

    assert_eq!(
        outcome.verdict,
        Verdict::InfraError {
            reason: InfraReason::DeployFailed
        }
    );
}

#[tokio::test]
async fn prebuilt_binary_skips_build() {
    let (dir, artifact) = artifact_dir(ArtifactKind::Exploit);
    let binary = dir.path().join("poc.bin");
    std::fs::write(&binary, b"\x7fELF prebuilt").unwrap();
    let artifact = artifact.with_binary(&binary);
    let builder = Arc::new(ScriptedBuildProvider::new().failing());

    let outcome = pipeline(
        builder.clone(),
        Arc::new(ScriptedVmProvider::new()),
        PipelineConfig::default(),
    )
    .run(&request(&artifact, "4.15.0-20-generic", 1))
    .await;

    assert_eq!(outcome.verdict, Verdict::Success);
    assert!(builder.workdirs().is_empty());
}

#[tokio::test]
async fn built_artifacts_are_copied_to_dist() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Module);
    let dist = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        dist_dir: Some(dist.path().join("out")),
        ..PipelineConfig::default()
    };

    pipeline(
        Arc::new(ScriptedBuildProvider::new()),
        Arc::new(ScriptedVmProvider::new()),
        config,
    )
    .run(&request(&artifact, "4.15.0-20-generic", 1))
    .await;

    let copied = dist
        .path()
        .join("out")
        .join("hello-Ubuntu-18.04-4.15.0-20-generic");
    assert!(Path::new(&copied).is_file());
}

#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let (_dir, artifact) = artifact_dir(ArtifactKind::Module);
    let builder = Arc::new(
        ScriptedBuildProvider::new()
            .with_delay(Duration::from_millis(50))
            .corrupting("5.4.0-26-generic"),
    );
    let vms = Arc::new(ScriptedVmProvider::new().with_run_delay(Duration::from_millis(50)));
    let stats = vms.stats();
    let p = Arc::new(pipeline(builder.clone(), vms, PipelineConfig::default()));

    let clean_req = request(&artifact, "4.15.0-20-generic", 1);
    let corrupt_req = request(&artifact, "5.4.0-26-generic", 1);
    let (clean, corrupt) = tokio::join!(p.run(&clean_req), p.run(&corrupt_req));

    assert_eq!(clean.verdict, Verdict::Success);
    assert_eq!(corrupt.verdict, Verdict::TestFailed);
    assert_ne!(clean.artifact_digest, corrupt.artifact_digest);

    let workdirs = builder.workdirs();
    assert_eq!(workdirs.len(), 2);
    assert_ne!(workdirs[0], workdirs[1]);

    let ids = stats.ids();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert_eq!(stats.max_active.load(Ordering::SeqCst), 2);
}

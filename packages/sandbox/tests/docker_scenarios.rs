// ABOUTME: End-to-end scenarios against a real Docker daemon
// ABOUTME: Each test skips itself when no daemon is reachable

use codebox_sandbox::progress::ProgressReporter;
use codebox_sandbox::{
    CodeRequest, ContainerEngine, DockerEngine, Language, RunOutcome, SandboxManager,
    SandboxSettings,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Manager over the local daemon, or None when Docker is not reachable
async fn docker_manager() -> Option<SandboxManager> {
    let settings = SandboxSettings::from_env();
    let engine = match DockerEngine::connect(settings.pull_timeout()) {
        Ok(engine) => engine,
        Err(e) => {
            println!("Skipping: Docker client unavailable: {}", e);
            return None;
        }
    };
    if !engine.is_available().await {
        println!("Skipping: Docker daemon not reachable");
        return None;
    }
    Some(SandboxManager::new(Arc::new(engine), settings))
}

async fn run_inline(manager: &SandboxManager, language: Language, code: &str) -> RunOutcome {
    manager
        .run_code(
            &CodeRequest {
                language,
                code: code.to_string(),
                entrypoint: None,
            },
            &ProgressReporter::disabled(),
            &CancellationToken::new(),
        )
        .await
        .expect("run_code failed")
}

async fn cleanup(manager: &SandboxManager, outcome: &RunOutcome) {
    if let Err(e) = manager.stop(&outcome.handle().id).await {
        println!("Warning: failed to clean up {}: {}", outcome.handle().id, e);
    }
}

#[tokio::test]
async fn test_python_inline_arithmetic() {
    let Some(manager) = docker_manager().await else {
        return;
    };

    let outcome = run_inline(&manager, Language::Python, "print(1+1)").await;
    assert_eq!(outcome.text(), "2\n");
    cleanup(&manager, &outcome).await;
}

/// A third-party import is installed before the code runs
#[tokio::test]
async fn test_python_detected_dependency_is_installed() {
    let Some(manager) = docker_manager().await else {
        return;
    };

    let code = "import requests\nprint(requests.__name__)\n";
    let outcome = run_inline(&manager, Language::Python, code).await;
    assert!(
        outcome.text().ends_with("requests\n"),
        "unexpected output: {}",
        outcome.text()
    );
    cleanup(&manager, &outcome).await;
}

#[tokio::test]
async fn test_interactive_exec_and_stop() {
    let Some(manager) = docker_manager().await else {
        return;
    };

    let handle = manager
        .initialize(Some("alpine:3.20"), None)
        .await
        .expect("initialize failed");

    let transcript = manager
        .exec(
            &handle.id,
            &["echo hello".to_string(), "exit 4".to_string(), "echo unreachable".to_string()],
        )
        .await
        .expect("exec failed");
    assert_eq!(transcript.steps.len(), 2);
    assert_eq!(transcript.steps[0].stdout, "hello\n");
    assert_eq!(transcript.failed_exit_code(), Some(4));

    let listed = manager.list().await.expect("list failed");
    assert!(listed.iter().any(|info| info.id == handle.short_id()));

    manager.stop(&handle.id).await.expect("stop failed");
    let listed = manager.list().await.expect("list failed");
    assert!(!listed.iter().any(|info| info.id == handle.short_id()));
}

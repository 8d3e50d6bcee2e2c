//! Integration tests for native sandboxes.
//!
//! These run tasks as the current user. Tests creating throwaway users need
//! root and are ignored by default: run with `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use taskbox_native::{NativeConfig, NativeEngine, Payload, Sandbox};
use taskbox_types::{DiskStorage, EngineError, MemoryLog, Monitor, TaskContext};
use tokio::io::AsyncReadExt;

struct Harness {
    _root: tempfile::TempDir,
    storage_root: std::path::PathBuf,
    engine: NativeEngine,
}

fn harness(config: NativeConfig) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let storage_root = root.path().join("storage");
    let storage = DiskStorage::new(&storage_root).unwrap();
    let engine = NativeEngine::new(config, Arc::new(storage), Monitor::new("native-test"));
    Harness {
        _root: root,
        storage_root,
        engine,
    }
}

fn cmd(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

async fn start(harness: &Harness, command: &[&str]) -> (Sandbox, Arc<MemoryLog>, TaskContext) {
    let log = Arc::new(MemoryLog::new());
    let context = TaskContext::new("task", log.clone());
    let sandbox = harness
        .engine
        .new_sandbox_builder(Payload::new(cmd(command)), context.clone())
        .start_sandbox()
        .await
        .unwrap();
    (sandbox, log, context)
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_echo_ok_then_kill_is_idempotent() {
    let harness = harness(NativeConfig::new());
    let (sandbox, log, _) = start(&harness, &["echo", "ok"]).await;

    let result = within(sandbox.wait_for_result()).await.unwrap();
    assert!(result.success());
    assert!(!result.killed());
    assert_eq!(log.text(), "ok\n");

    // Kill after completion observes the same outcome.
    within(sandbox.kill()).await.unwrap();
    within(sandbox.kill()).await.unwrap();
    let again = within(sandbox.wait_for_result()).await.unwrap();
    assert!(again.success());
    assert!(!again.killed());

    // Abort comes too late to matter.
    assert!(matches!(
        within(sandbox.abort()).await,
        Err(EngineError::SandboxTerminated)
    ));
}

#[tokio::test]
async fn test_failing_command_reports_failure() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["sh", "-c", "exit 3"]).await;

    let result = within(sandbox.wait_for_result()).await.unwrap();
    assert!(!result.success());
}

#[tokio::test]
async fn test_environment_is_passed() {
    let harness = harness(NativeConfig::new());
    let log = Arc::new(MemoryLog::new());
    let mut builder = harness.engine.new_sandbox_builder(
        Payload::new(cmd(&["sh", "-c", "echo \"$GREETING $USER\""])),
        TaskContext::new("task", log.clone()),
    );
    builder.set_env("GREETING", "hello").unwrap();
    let sandbox = builder.start_sandbox().await.unwrap();

    assert!(within(sandbox.wait_for_result()).await.unwrap().success());
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())
        .unwrap()
        .unwrap();
    assert_eq!(log.text(), format!("hello {}\n", user.name));
}

#[tokio::test]
async fn test_missing_program_is_malformed() {
    let harness = harness(NativeConfig::new());
    let err = harness
        .engine
        .new_sandbox_builder(
            Payload::new(cmd(&["/no/such/program"])),
            TaskContext::new("task", Arc::new(MemoryLog::new())),
        )
        .start_sandbox()
        .await
        .unwrap_err();
    assert!(err.is_malformed_payload(), "{:?}", err);
}

#[tokio::test]
async fn test_unrecognized_context_extension_is_malformed() {
    let harness = harness(NativeConfig::new());
    let payload = Payload::new(cmd(&["true"])).with_context("file:///tmp/context.rar");
    let err = harness
        .engine
        .new_sandbox_builder(payload, TaskContext::new("task", Arc::new(MemoryLog::new())))
        .start_sandbox()
        .await
        .unwrap_err();
    assert!(err.is_malformed_payload(), "{:?}", err);
}

#[tokio::test]
async fn test_kill_running_sandbox() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["sh", "-c", "sleep 60 & sleep 60"]).await;

    within(sandbox.kill()).await.unwrap();
    assert!(sandbox.is_resolved());

    let result = within(sandbox.wait_for_result()).await.unwrap();
    assert!(!result.success());
    assert!(result.killed());
    result.dispose().await.unwrap();
}

#[tokio::test]
async fn test_abort_running_sandbox() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["sleep", "60"]).await;

    within(sandbox.abort()).await.unwrap();
    within(sandbox.abort()).await.unwrap();
    assert!(matches!(
        within(sandbox.wait_for_result()).await,
        Err(EngineError::SandboxAborted)
    ));
    assert!(matches!(
        within(sandbox.kill()).await,
        Err(EngineError::SandboxAborted)
    ));
}

#[tokio::test]
async fn test_kill_returns_while_escaped_child_holds_output() {
    let harness = harness(NativeConfig::new());
    // The setsid child is out of reach of the group kill but keeps stdout open.
    let (sandbox, _, _) = start(&harness, &["sh", "-c", "setsid sleep 20 & sleep 60"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), sandbox.kill())
        .await
        .expect("kill did not return")
        .unwrap();
    let result = within(sandbox.wait_for_result()).await.unwrap();
    assert!(result.killed());
}

#[tokio::test]
async fn test_abort_returns_while_escaped_child_holds_output() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["sh", "-c", "setsid sleep 20 & sleep 60"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), sandbox.abort())
        .await
        .expect("abort did not return")
        .unwrap();
}

#[tokio::test]
async fn test_cancellation_aborts_sandbox() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, context) = start(&harness, &["sleep", "60"]).await;

    context.cancel();
    assert!(matches!(
        within(sandbox.wait_for_result()).await,
        Err(EngineError::SandboxAborted)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_triggers_resolve_once() {
    for delay_ms in [0u64, 5, 20] {
        let harness = harness(NativeConfig::new());
        let (sandbox, _, _) = start(&harness, &["sleep", "0.01"]).await;

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let killer = {
            let sandbox = sandbox.clone();
            tokio::spawn(async move { sandbox.kill().await })
        };
        let aborter = {
            let sandbox = sandbox.clone();
            tokio::spawn(async move { sandbox.abort().await })
        };
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sandbox = sandbox.clone();
                tokio::spawn(async move {
                    sandbox
                        .wait_for_result()
                        .await
                        .map(|r| (r.success(), r.killed()))
                        .map_err(|e| e.to_string())
                })
            })
            .collect();

        let kill = within(killer).await.unwrap();
        let abort = within(aborter).await.unwrap();
        let mut outcomes = Vec::new();
        for waiter in waiters {
            outcomes.push(within(waiter).await.unwrap());
        }
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]), "{:?}", outcomes);

        match &outcomes[0] {
            Err(_) => {
                // Abort won.
                assert!(abort.is_ok());
                assert!(matches!(kill, Err(EngineError::SandboxAborted)));
            }
            Ok(_) => {
                // Natural exit or kill won.
                assert!(kill.is_ok());
                assert!(matches!(abort, Err(EngineError::SandboxTerminated)));
            }
        }
    }
}

#[tokio::test]
async fn test_result_waits_for_shells() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["sleep", "0.5"]).await;

    let started = Instant::now();
    let shell = sandbox.new_shell(&cmd(&["sleep", "1"]), false).unwrap();

    let result = within(sandbox.wait_for_result()).await.unwrap();
    assert!(result.success());
    assert!(shell.is_finished());
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(sandbox.active_sessions(), 0);
}

#[tokio::test]
async fn test_shell_output() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["sleep", "60"]).await;

    let shell = sandbox
        .new_shell(&cmd(&["sh", "-c", "echo \"from $USER\""]), false)
        .unwrap();
    let mut stdout = shell.take_stdout().unwrap();
    let mut output = String::new();
    within(stdout.read_to_string(&mut output)).await.unwrap();
    assert!(output.starts_with("from "));
    assert!(within(shell.wait()).await.unwrap());

    // The finished shell removes itself.
    within(async {
        while !sandbox.shells().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(sandbox.active_sessions(), 0);

    within(sandbox.abort()).await.unwrap();
}

#[tokio::test]
async fn test_abort_interrupts_concurrent_shells() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["sleep", "60"]).await;

    let (a, b) = tokio::join!(
        async { sandbox.new_shell(&cmd(&["sleep", "60"]), false) },
        async { sandbox.new_shell(&cmd(&["sleep", "60"]), true) },
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(sandbox.shells().len(), 2);
    assert_eq!(sandbox.active_sessions(), 2);

    within(sandbox.abort()).await.unwrap();

    // Both shells ended before abort returned.
    assert_eq!(sandbox.active_sessions(), 0);
    assert!(a.is_finished());
    assert!(b.is_finished());
    assert!(matches!(a.wait().await, Err(EngineError::SandboxAborted)));
    assert!(matches!(b.wait().await, Err(EngineError::SandboxAborted)));
}

#[tokio::test]
async fn test_new_shell_after_resolution_is_terminated() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["true"]).await;

    within(sandbox.wait_for_result()).await.unwrap();
    let err = sandbox.new_shell(&cmd(&["true"]), false).unwrap_err();
    assert!(matches!(err, EngineError::SandboxTerminated));
    assert_eq!(sandbox.active_sessions(), 0);
}

#[tokio::test]
async fn test_failed_shell_is_not_counted() {
    let harness = harness(NativeConfig::new());
    let (sandbox, _, _) = start(&harness, &["sleep", "60"]).await;

    let err = sandbox
        .new_shell(&cmd(&["/no/such/shell"]), false)
        .unwrap_err();
    assert!(err.is_malformed_payload());
    assert_eq!(sandbox.active_sessions(), 0);
    assert!(sandbox.shells().is_empty());

    within(sandbox.kill()).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Throwaway users (root only)
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore] // Needs root: run with --ignored
async fn test_owned_user_runs_in_temporary_folder() {
    let harness = harness(NativeConfig::new().with_create_user(true));
    let (sandbox, log, _) = start(&harness, &["sh", "-c", "echo $USER; pwd; touch made"]).await;
    let folder = sandbox.working_folder().to_path_buf();

    let result = within(sandbox.wait_for_result()).await.unwrap();
    assert!(result.success());
    let text = log.text();
    assert!(text.starts_with("task_"));
    assert!(text.contains(&folder.display().to_string()));
    result.extract_file("made").await.unwrap();

    result.dispose().await.unwrap();
    assert!(!folder.exists());
}

#[tokio::test]
#[ignore] // Needs root: run with --ignored
async fn test_owned_user_removed_after_bad_context() {
    let harness = harness(NativeConfig::new().with_create_user(true));
    let payload = Payload::new(cmd(&["true"])).with_context("file:///tmp/context.rar");
    let err = harness
        .engine
        .new_sandbox_builder(payload, TaskContext::new("task", Arc::new(MemoryLog::new())))
        .start_sandbox()
        .await
        .unwrap_err();
    assert!(err.is_malformed_payload());

    // The working folder was released again.
    assert_eq!(std::fs::read_dir(&harness.storage_root).unwrap().count(), 0);
}

#[tokio::test]
#[ignore] // Needs root: run with --ignored
async fn test_abort_owned_user_removes_everything() {
    let harness = harness(NativeConfig::new().with_create_user(true));
    let log = Arc::new(MemoryLog::new());
    let sandbox = harness
        .engine
        .new_sandbox_builder(
            Payload::new(cmd(&["sh", "-c", "echo $USER; sleep 60"])),
            TaskContext::new("task", log.clone()),
        )
        .start_sandbox()
        .await
        .unwrap();
    let folder = sandbox.working_folder().to_path_buf();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let name = log.text().trim().to_string();

    within(sandbox.abort()).await.unwrap();
    assert!(!folder.exists());
    assert!(nix::unistd::User::from_name(&name).unwrap().is_none());
}

#[tokio::test]
#[ignore] // Needs root: run with --ignored
async fn test_owned_user_keeps_supplementary_groups() {
    let group = format!("tbgrp{}", std::process::id());
    let added = std::process::Command::new("groupadd").arg(&group).status().unwrap();
    assert!(added.success());

    let harness = harness(
        NativeConfig::new()
            .with_create_user(true)
            .with_groups(vec![group.clone()]),
    );
    let (sandbox, log, _) = start(&harness, &["sh", "-c", "id -Gn; sleep 2"]).await;

    let shell = sandbox.new_shell(&cmd(&["id", "-Gn"]), false).unwrap();
    let mut stdout = shell.take_stdout().unwrap();
    let mut shell_groups = String::new();
    within(stdout.read_to_string(&mut shell_groups)).await.unwrap();
    assert!(within(shell.wait()).await.unwrap());

    let result = within(sandbox.wait_for_result()).await.unwrap();
    assert!(result.success());
    let task_groups = log.text();
    result.dispose().await.unwrap();
    std::process::Command::new("groupdel").arg(&group).status().unwrap();

    assert!(task_groups.split_whitespace().any(|g| g == group), "{}", task_groups);
    assert!(shell_groups.split_whitespace().any(|g| g == group), "{}", shell_groups);
}

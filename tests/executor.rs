//! Serialized command execution against a real shell.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::future;

use armada::exec::CommandExecutor;

fn sh() -> CommandExecutor {
    CommandExecutor::new(PathBuf::from("/bin/sh"))
}

#[tokio::test]
async fn captures_stdout() {
    let out = sh().execute(&["-c", "echo hello"]).await.unwrap();
    assert!(out.success());
    assert_eq!(out.code, 0);
    assert_eq!(out.stdout.trim(), "hello");
}

#[tokio::test]
async fn nonzero_exit_is_data_not_an_error() {
    let out = sh().execute(&["-c", "exit 3"]).await.unwrap();
    assert!(!out.success());
    assert_eq!(out.code, 3);
}

#[tokio::test]
async fn missing_program_is_an_error() {
    let executor = CommandExecutor::new(PathBuf::from("/no/such/binary"));
    assert!(executor.execute(&["anything"]).await.is_err());
}

#[tokio::test]
async fn commands_run_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("order.log");
    let log_str = log.to_string_lossy();

    let executor = sh();

    // Earlier submissions sleep longer; only strict FIFO execution on a
    // single worker keeps the log in submission order.
    let commands: Vec<String> = (1..=4)
        .map(|i| format!("sleep 0.{}; echo {i} >> {log_str}", 4 - i))
        .collect();

    let argsets: Vec<[&str; 2]> = commands.iter().map(|c| ["-c", c.as_str()]).collect();
    let pending: Vec<_> = argsets.iter().map(|args| executor.execute(args)).collect();

    for out in future::join_all(pending).await {
        assert!(out.unwrap().success());
    }

    let written = std::fs::read_to_string(&log).unwrap();
    let order: Vec<&str> = written.lines().collect();
    assert_eq!(order, vec!["1", "2", "3", "4"]);
}

#[tokio::test]
async fn detached_spawn_does_not_wait() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("done");
    let marker_str = marker.to_string_lossy();

    let executor = sh();
    executor
        .spawn_detached(&["-c", &format!("echo ok > {marker_str}")])
        .unwrap();

    for _ in 0..50 {
        if marker.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    panic!("detached command never ran");
}

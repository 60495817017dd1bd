//! Import dedup against a recording stub control plane.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use armada::error::Error;
use armada::exec::CommandExecutor;
use armada::import::ImportQueue;

/// A stand-in control-plane binary that logs its arguments.
fn stub_program(dir: &Path, log: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let program = dir.join("stub-manage");
    let script = format!("#!/bin/sh\nsleep 0.1\necho \"$@\" >> {}\n", log.display());
    std::fs::write(&program, script).unwrap();
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
    program
}

fn queue(dir: &Path, log: &Path) -> Arc<ImportQueue> {
    let executor = CommandExecutor::new(stub_program(dir, log));
    Arc::new(ImportQueue::new(executor, dir.to_path_buf()))
}

fn registrations(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn one_source_url_imports_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let queue = queue(dir.path(), &log);

    let first = Arc::clone(&queue);
    let second = Arc::clone(&queue);
    let a = tokio::spawn(async move { first.import("file://images/base.ova", "tmpl").await });
    let b = tokio::spawn(async move { second.import("file://images/base.ova", "tmpl").await });

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(registrations(&log).len(), 1);
}

#[tokio::test]
async fn distinct_source_urls_import_separately() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let queue = queue(dir.path(), &log);

    queue.import("file://images/a.ova", "tmpl-a").await.unwrap();
    queue.import("file://images/b.ova", "tmpl-b").await.unwrap();

    let lines = registrations(&log);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("a.ova"));
    assert!(lines[1].contains("b.ova"));
}

#[tokio::test]
async fn relative_file_urls_resolve_against_the_base_dir() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let queue = queue(dir.path(), &log);

    queue.import("file://images/base.ova", "tmpl").await.unwrap();

    let expected = dir.path().join("images/base.ova");
    assert!(registrations(&log)[0].contains(&expected.to_string_lossy().to_string()));
}

#[tokio::test]
async fn failed_remote_fetch_registers_nothing() {
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/images/base.ova"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let queue = queue(dir.path(), &log);

    let url = format!("{}/images/base.ova", server.uri());
    let err = queue.import(&url, "tmpl").await.unwrap_err();

    assert!(matches!(err, Error::Download { .. }));
    assert!(registrations(&log).is_empty());

    // The failed fetch is not marked done; a retry fetches again.
    let err = queue.import(&url, "tmpl").await.unwrap_err();
    assert!(matches!(err, Error::Download { .. }));
}

#[tokio::test]
async fn unsupported_schemes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let queue = queue(dir.path(), &log);

    let err = queue.import("ftp://images/base.ova", "tmpl").await.unwrap_err();
    assert!(matches!(err, Error::User(_)));
    assert!(registrations(&log).is_empty());
}

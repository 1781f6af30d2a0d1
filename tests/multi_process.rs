//! Multi-process tests driving the `token-cache` binary

use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use token_cache_sync::config::LockRetryPolicy;
use token_cache_sync::{CrossProcessLock, NullObserver, StorageConfig};

const BIN: &str = env!("CARGO_BIN_EXE_token-cache");

fn cli(cache_path: &Path) -> Command {
    let mut cmd = Command::new(BIN);
    cmd.arg("--cache-path")
        .arg(cache_path)
        .arg("--backend")
        .arg("plaintext-file");
    cmd
}

fn wait_all(children: Vec<Child>) -> Vec<Output> {
    children
        .into_iter()
        .map(|child| child.wait_with_output().unwrap())
        .collect()
}

fn spawn_holder(cache_path: &Path) -> Child {
    let mut child = cli(cache_path)
        .args(["hold", "--ms", "60000"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).unwrap();
    assert_eq!(line.trim(), "locked");
    child
}

#[test]
fn test_concurrent_appends_lose_nothing() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("token.cache");

    let children: Vec<Child> = (0..10)
        .map(|i| {
            cli(&cache_path)
                .args(["append", &format!("token-{}", i)])
                .stderr(Stdio::piped())
                .spawn()
                .unwrap()
        })
        .collect();

    for output in wait_all(children) {
        assert!(
            output.status.success(),
            "{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let content = std::fs::read_to_string(&cache_path).unwrap();
    let lines: HashSet<&str> = content.lines().collect();
    assert_eq!(content.lines().count(), 10);
    for i in 0..10 {
        assert!(lines.contains(format!("token-{}", i).as_str()));
    }
}

#[test]
fn test_stress_lines_never_interleave() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("token.cache");
    let protected = dir.path().join("protected.txt");

    let children: Vec<Child> = (0..8)
        .map(|_| {
            cli(&cache_path)
                .arg("stress")
                .arg("--protected-file")
                .arg(&protected)
                .args(["--iterations", "3", "--hold-ms", "5"])
                .stderr(Stdio::piped())
                .spawn()
                .unwrap()
        })
        .collect();

    for output in wait_all(children) {
        assert!(
            output.status.success(),
            "{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let content = std::fs::read_to_string(&protected).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 8 * 3 * 2);

    for pair in lines.chunks(2) {
        let enter = pair[0].strip_prefix("< ").unwrap();
        let exit = pair[1].strip_prefix("> ").unwrap();
        assert_eq!(enter, exit, "interleaved lines: {:?}", pair);
    }
}

#[test]
fn test_killed_holder_releases_lock() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("token.cache");
    let mut holder = spawn_holder(&cache_path);

    holder.kill().unwrap();
    holder.wait().unwrap();

    let config = StorageConfig::new(&cache_path, "svc", "acct");
    let lock = CrossProcessLock::new(
        config.lock_path(),
        LockRetryPolicy::default(),
        Arc::new(NullObserver),
    );
    let start = Instant::now();
    let handle = lock.acquire(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    handle.release().unwrap();
}

#[test]
fn test_append_times_out_while_lock_held() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("token.cache");
    let mut holder = spawn_holder(&cache_path);

    let output = cli(&cache_path)
        .args(["--lock-timeout-ms", "200", "append", "late"])
        .output()
        .unwrap();

    holder.kill().unwrap();
    holder.wait().unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Timed out"));
    assert!(!cache_path.exists());
}

#[test]
fn test_show_and_clear() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("token.cache");

    assert!(cli(&cache_path).args(["append", "abc"]).status().unwrap().success());

    let shown = cli(&cache_path).arg("show").output().unwrap();
    assert!(shown.status.success());
    assert_eq!(shown.stdout, b"abc\n");

    assert!(cli(&cache_path).arg("clear").status().unwrap().success());
    assert!(!cache_path.exists());

    let shown = cli(&cache_path).arg("show").output().unwrap();
    assert!(shown.stdout.is_empty());
}

#[test]
fn test_verify_leaves_no_check_files() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("token.cache");

    let output = cli(&cache_path).arg("verify").output().unwrap();

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("ok"));
    assert!(!dir.path().join("token.cache.test").exists());
    assert!(!cache_path.exists());
}

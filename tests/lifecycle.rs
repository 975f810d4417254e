//! Signal handling and lifecycle tests against the real daemon binary.

use std::fs;
use std::time::Duration;

use nix::sys::signal::Signal;

mod common;

use common::{Daemon, API_KEY};

#[tokio::test]
async fn startup_writes_identity_and_redirects() {
    let daemon = Daemon::start().await;
    assert_eq!(common::read_pid(&daemon.pid_file()), Some(daemon.pid()));

    let resp = common::client()
        .get(format!("http://{}/iso/image.iso", daemon.http))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FOUND);
    assert_eq!(
        resp.headers()["location"],
        "https://mirror.example.org/pub/iso/image.iso"
    );
}

#[tokio::test]
async fn sigterm_exits_immediately_and_removes_identity() {
    let mut daemon = Daemon::start().await;

    daemon.signal(Signal::SIGTERM);
    let status = daemon.wait_for_exit(Duration::from_secs(5)).await;
    assert_eq!(status.code(), Some(0));
    assert!(!daemon.pid_file().exists());
}

#[tokio::test]
async fn sigint_behaves_like_sigterm() {
    let mut daemon = Daemon::start().await;

    daemon.signal(Signal::SIGINT);
    assert_eq!(daemon.wait_for_exit(Duration::from_secs(5)).await.code(), Some(0));
    assert!(!daemon.pid_file().exists());
}

#[tokio::test]
async fn sigquit_drains_and_persists_state() {
    let mut daemon = Daemon::start().await;

    daemon.signal(Signal::SIGQUIT);
    assert_eq!(daemon.wait_for_exit(Duration::from_secs(10)).await.code(), Some(0));
    assert!(!daemon.pid_file().exists());
    assert!(common::healthz_pid(daemon.http).await.is_none());

    let saved = fs::read_to_string(daemon.dir.path().join("mirrors.json")).unwrap();
    assert!(saved.contains("primary"));
}

#[tokio::test]
async fn second_instance_is_refused() {
    let daemon = Daemon::start().await;

    // Same identity record, different ports.
    let other_dir = tempfile::tempdir().unwrap();
    let config = common::config_text(daemon.dir.path(), common::free_addr(), common::free_addr());
    let config_path = other_dir.path().join("redirectd.toml");
    fs::write(&config_path, config).unwrap();

    let status = common::spawn(&config_path).wait().unwrap();
    assert_eq!(status.code(), Some(1));
    assert_eq!(common::read_pid(&daemon.pid_file()), Some(daemon.pid()));
    assert_eq!(common::healthz_pid(daemon.http).await, Some(daemon.pid()));
}

#[tokio::test]
async fn stale_identity_record_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let http = common::free_addr();
    common::write_config(dir.path(), http, common::free_addr());

    let mut exited = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = exited.id();
    exited.wait().unwrap();
    fs::write(dir.path().join("redirectd.pid"), dead_pid.to_string()).unwrap();

    let mut child = common::spawn(&dir.path().join("redirectd.toml"));
    let pid = common::wait_for_healthz(http, Duration::from_secs(10)).await;
    assert_eq!(pid, Some(child.id()));
    assert_eq!(common::read_pid(&dir.path().join("redirectd.pid")), Some(child.id()));

    child.kill().unwrap();
    child.wait().unwrap();
}

#[tokio::test]
async fn sighup_with_new_address_rebinds() {
    let daemon = Daemon::start().await;
    let old = daemon.http;
    let new = common::free_addr();

    common::write_config(daemon.dir.path(), new, daemon.control);
    daemon.signal(Signal::SIGHUP);

    assert_eq!(
        common::wait_for_healthz(new, Duration::from_secs(10)).await,
        Some(daemon.pid())
    );
    assert!(common::healthz_pid(old).await.is_none());
}

#[tokio::test]
async fn broken_reload_keeps_serving() {
    let daemon = Daemon::start().await;

    fs::write(daemon.config_path(), "[listener\n").unwrap();
    daemon.signal(Signal::SIGHUP);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(common::healthz_pid(daemon.http).await, Some(daemon.pid()));
    let status = common::control_status(daemon.control).await;
    assert_eq!(status["generation"]["state"], "running");
}

#[tokio::test]
async fn sigusr1_keeps_serving() {
    let daemon = Daemon::start().await;

    daemon.signal(Signal::SIGUSR1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(common::healthz_pid(daemon.http).await, Some(daemon.pid()));
}

#[tokio::test]
async fn control_channel_stop_is_graceful() {
    let mut daemon = Daemon::start().await;

    let status = common::control_status(daemon.control).await;
    assert_eq!(status["generation"]["pid"], daemon.pid());
    assert_eq!(status["listener"], daemon.http.to_string());

    assert_eq!(
        common::control_signal(daemon.control, "quit").await,
        reqwest::StatusCode::ACCEPTED
    );
    assert_eq!(daemon.wait_for_exit(Duration::from_secs(10)).await.code(), Some(0));
    assert!(!daemon.pid_file().exists());
}

#[tokio::test]
async fn control_channel_requires_key() {
    let daemon = Daemon::start().await;

    let resp = common::client()
        .get(format!("http://{}/admin/mirrors", daemon.control))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let mirrors: serde_json::Value = common::client()
        .get(format!("http://{}/admin/mirrors", daemon.control))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(mirrors[0]["name"], "primary");
}

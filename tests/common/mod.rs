//! Shared utilities for the process-level integration tests.

#![allow(dead_code)]

use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

pub const API_KEY: &str = "integration-key";

/// Reserve a loopback address for a daemon to bind.
pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A daemon process with its scratch directory.
pub struct Daemon {
    pub child: Child,
    pub dir: TempDir,
    pub http: SocketAddr,
    pub control: SocketAddr,
}

impl Daemon {
    /// Start a daemon on fresh loopback ports and wait until it serves.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let http = free_addr();
        let control = free_addr();
        write_config(dir.path(), http, control);

        let child = spawn(&dir.path().join("redirectd.toml"));
        let daemon = Self { child, dir, http, control };
        assert!(wait_for_healthz(http, Duration::from_secs(10)).await.is_some(), "daemon did not start");
        daemon
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("redirectd.toml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.path().join("redirectd.pid")
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn signal(&self, signal: Signal) {
        send_signal(self.pid(), signal);
    }

    pub async fn wait_for_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "daemon {} did not exit", self.pid());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub fn config_text(dir: &Path, http: SocketAddr, control: SocketAddr) -> String {
    format!(
        r#"
[listener]
bind_address = "{http}"

[control]
enabled = true
api_key = "{API_KEY}"
bind_address = "{control}"

[monitor]
enabled = false

[[monitor.mirrors]]
name = "primary"
base_url = "https://mirror.example.org/pub/"

[process]
pid_file = "{pid_file}"

[store]
state_path = "{state}"
"#,
        pid_file = dir.join("redirectd.pid").display(),
        state = dir.join("mirrors.json").display(),
    )
}

pub fn write_config(dir: &Path, http: SocketAddr, control: SocketAddr) {
    fs::write(dir.join("redirectd.toml"), config_text(dir, http, control)).unwrap();
}

/// Launch the daemon binary with a clean handoff environment.
pub fn spawn(config: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_redirectd"))
        .arg("daemon")
        .arg("--config")
        .arg(config)
        .env_remove("REDIRECTD_LISTEN_FD")
        .env_remove("REDIRECTD_LISTEN_ADDR")
        .env_remove("REDIRECTD_PARENT_PID")
        .env("RUST_LOG", "redirectd=debug")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

pub fn send_signal(pid: u32, signal: Signal) {
    kill(Pid::from_raw(pid as i32), signal).unwrap();
}

/// HTTP client opening a new connection per request.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .unwrap()
}

/// Pid reported by `/healthz`, if the daemon answers.
pub async fn healthz_pid(addr: SocketAddr) -> Option<u32> {
    let resp = client().get(format!("http://{}/healthz", addr)).send().await.ok()?;
    let body: serde_json::Value = resp.json().await.ok()?;
    body["pid"].as_u64().map(|pid| pid as u32)
}

/// Poll `/healthz` until it answers or `timeout` passes.
pub async fn wait_for_healthz(addr: SocketAddr, timeout: Duration) -> Option<u32> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(pid) = healthz_pid(addr).await {
            return Some(pid);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

/// Poll until `check` holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Send a control-channel signal request.
pub async fn control_signal(control: SocketAddr, name: &str) -> reqwest::StatusCode {
    client()
        .post(format!("http://{}/admin/signal/{}", control, name))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap()
        .status()
}

pub async fn control_status(control: SocketAddr) -> serde_json::Value {
    client()
        .get(format!("http://{}/admin/status", control))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

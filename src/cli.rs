//! Command-line interface.
//!
//! `redirectd daemon` runs the daemon; every other subcommand is a client of
//! the control channel.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use crate::config::SharedConfig;
use crate::lifecycle::{self, LaunchSpec};
use crate::observability::init_logging;

/// Time the runtime gets to wind down blocking tasks (the child reaper among
/// them) after the daemon returns.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "redirectd", version)]
#[command(about = "Mirror redirector daemon", long_about = None)]
pub struct Cli {
    /// Control channel URL.
    #[arg(short, long, global = true, default_value = "http://127.0.0.1:8081")]
    pub url: String,

    /// Control channel API key.
    #[arg(short, long, global = true, default_value = "CHANGE_ME_IN_PRODUCTION")]
    pub key: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Commands {
    /// Run the daemon
    Daemon {
        /// Configuration file.
        #[arg(short, long, default_value = "/etc/redirectd/redirectd.toml")]
        config: PathBuf,
    },
    /// Show generation and listener status
    Status,
    /// List mirrors and their health
    Mirrors,
    /// Reload configuration (SIGHUP)
    Reload,
    /// Reopen the log file (SIGUSR1)
    ReopenLogs,
    /// Hand the listener to a freshly started binary (SIGUSR2)
    Upgrade,
    /// Stop gracefully (SIGQUIT)
    Stop,
}

/// Parse `args` and run. Returns the process exit code.
pub fn run<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Help and version go to stdout and are not failures.
            return if e.use_stderr() { 1 } else { 0 };
        }
    };

    match cli.command {
        Commands::Daemon { ref config } => run_daemon(config),
        ref command => run_client(&cli, command),
    }
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

fn run_daemon(path: &Path) -> i32 {
    let config = match SharedConfig::load(path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("redirectd: {}: {}", path.display(), e);
            return 1;
        }
    };

    let logs = match init_logging(&config.current().observability) {
        Ok(logs) => logs,
        Err(e) => {
            eprintln!("redirectd: cannot open log file: {}", e);
            return 1;
        }
    };

    let launch = match LaunchSpec::current() {
        Ok(launch) => launch,
        Err(e) => {
            tracing::error!(error = %e, "Cannot determine own executable");
            return 1;
        }
    };

    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return 1;
        }
    };

    let code = match runtime.block_on(lifecycle::run_daemon(config, logs, launch)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            1
        }
    };
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    code
}

fn run_client(cli: &Cli, command: &Commands) -> i32 {
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    match runtime.block_on(call_control(cli, command)) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn call_control(cli: &Cli, command: &Commands) -> Result<bool, Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", cli.key))?);

    let base = cli.url.trim_end_matches('/');
    let request = match command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Mirrors => client.get(format!("{}/admin/mirrors", base)),
        Commands::Reload => client.post(format!("{}/admin/signal/reload", base)),
        Commands::ReopenLogs => client.post(format!("{}/admin/signal/reopen-logs", base)),
        Commands::Upgrade => client.post(format!("{}/admin/signal/upgrade", base)),
        Commands::Stop => client.post(format!("{}/admin/signal/quit", base)),
        Commands::Daemon { .. } => return Ok(false),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<bool, Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: control channel returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(false);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_daemon_config_path() {
        let cli = Cli::try_parse_from(["redirectd", "daemon", "--config", "/tmp/r.toml"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Daemon {
                config: PathBuf::from("/tmp/r.toml")
            }
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["redirectd", "reopen-logs", "--url", "http://10.0.0.1:9", "-k", "s"]).unwrap();
        assert_eq!(cli.command, Commands::ReopenLogs);
        assert_eq!(cli.url, "http://10.0.0.1:9");
        assert_eq!(cli.key, "s");
    }

    #[test]
    fn argument_errors_exit_with_one() {
        assert_eq!(run(["redirectd", "frobnicate"]), 1);
        assert_eq!(run(["redirectd"]), 1);
    }

    #[test]
    fn help_and_version_exit_cleanly() {
        assert_eq!(run(["redirectd", "--help"]), 0);
        assert_eq!(run(["redirectd", "--version"]), 0);
    }

    #[test]
    fn unreadable_config_fails_startup() {
        assert_eq!(run(["redirectd", "daemon", "--config", "/nonexistent/redirectd.toml"]), 1);
    }

    #[test]
    fn unreachable_control_channel_fails() {
        // Port 9 on loopback has no listener.
        assert_eq!(run(["redirectd", "status", "--url", "http://127.0.0.1:9"]), 1);
    }
}

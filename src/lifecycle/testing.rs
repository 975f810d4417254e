//! Recording stand-ins for the subsystems, used by the handler tests.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::config::SharedConfig;
use crate::lifecycle::context::{Generation, ProcessContext};
use crate::lifecycle::handoff::{HandoffError, HandoffToken, LaunchSpec};
use crate::lifecycle::identity::ProcessIdentity;
use crate::lifecycle::{BackgroundMonitor, ControlChannel, RequestServer, SubsystemError};
use crate::net::BoundListener;
use crate::observability::LogSink;

type Calls = Arc<Mutex<Vec<String>>>;

fn record(calls: &Calls, call: impl Into<String>) {
    calls.lock().unwrap().push(call.into());
}

pub(crate) struct FakeServer {
    calls: Calls,
    has_listener: AtomicBool,
    listener: Mutex<Option<BoundListener>>,
}

impl FakeServer {
    pub(crate) fn set_has_listener(&self, value: bool) {
        self.has_listener.store(value, Ordering::SeqCst);
    }
}

impl RequestServer for FakeServer {
    fn has_listener(&self) -> bool {
        self.has_listener.load(Ordering::SeqCst)
    }

    fn stop(&self, deadline: Duration) {
        record(&self.calls, format!("server.stop({:?})", deadline));
    }

    fn reload(&self) {
        record(&self.calls, "server.reload");
    }

    fn set_restarting(&self, restarting: bool) {
        record(&self.calls, format!("server.set_restarting({})", restarting));
    }

    fn set_accepting(&self, accepting: bool) {
        record(&self.calls, format!("server.set_accepting({})", accepting));
    }

    fn handoff_token(&self) -> Result<Option<HandoffToken>, HandoffError> {
        record(&self.calls, "server.handoff_token");
        if !self.has_listener() {
            return Ok(None);
        }
        let mut slot = self.listener.lock().unwrap();
        if slot.is_none() {
            *slot = Some(BoundListener::bind("127.0.0.1:0")?);
        }
        match slot.as_ref() {
            Some(listener) => HandoffToken::from_listener(listener).map(Some),
            None => Ok(None),
        }
    }
}

pub(crate) struct FakeMonitor {
    calls: Calls,
}

impl BackgroundMonitor for FakeMonitor {
    fn stop(&self) {
        record(&self.calls, "monitor.stop");
    }
}

pub(crate) struct FakeControl {
    calls: Calls,
    fail_close: AtomicBool,
}

impl FakeControl {
    pub(crate) fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

impl ControlChannel for FakeControl {
    fn close(&self) -> Result<(), SubsystemError> {
        record(&self.calls, "control.close");
        if self.fail_close.load(Ordering::SeqCst) {
            return Err("control listener already gone".into());
        }
        Ok(())
    }

    fn reopen(&self) -> Result<(), SubsystemError> {
        record(&self.calls, "control.reopen");
        Ok(())
    }
}

/// A process context wired to recording fakes and a scratch directory.
pub(crate) struct Harness {
    pub(crate) ctx: Arc<ProcessContext>,
    pub(crate) server: Arc<FakeServer>,
    pub(crate) control: Arc<FakeControl>,
    calls: Calls,
    dir: TempDir,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_launch(LaunchSpec {
            executable: PathBuf::from("/nonexistent/redirectd"),
            args: Vec::new(),
        })
    }

    pub(crate) fn with_launch(launch: LaunchSpec) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let calls: Calls = Arc::default();

        let harness_paths = (dir.path().join("redirectd.toml"), dir.path().join("redirectd.pid"));
        fs::write(&harness_paths.0, config_text(&harness_paths.1, "127.0.0.1:18080", 30)).unwrap();
        let config = Arc::new(SharedConfig::load(&harness_paths.0).unwrap());

        let server = Arc::new(FakeServer {
            calls: calls.clone(),
            has_listener: AtomicBool::new(true),
            listener: Mutex::new(None),
        });
        let monitor = Arc::new(FakeMonitor { calls: calls.clone() });
        let control = Arc::new(FakeControl {
            calls: calls.clone(),
            fail_close: AtomicBool::new(false),
        });

        let ctx = Arc::new(ProcessContext::new(
            Arc::new(Generation::current(None)),
            config,
            Arc::new(ProcessIdentity::for_current_process(harness_paths.1)),
            server.clone(),
            monitor,
            control.clone(),
            LogSink::stderr(),
            launch,
        ));

        Self {
            ctx,
            server,
            control,
            calls,
            dir,
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn pid_file(&self) -> PathBuf {
        self.dir.path().join("redirectd.pid")
    }

    /// Rewrite the config file with a bind address and request timeout.
    pub(crate) fn write_config(&self, bind_address: &str, request_secs: u64) {
        self.write_raw(&config_text(&self.pid_file(), bind_address, request_secs));
    }

    pub(crate) fn write_raw(&self, contents: &str) {
        fs::write(self.dir.path().join("redirectd.toml"), contents).unwrap();
    }
}

fn config_text(pid_file: &std::path::Path, bind_address: &str, request_secs: u64) -> String {
    format!(
        r#"
[listener]
bind_address = "{bind_address}"

[control]
enabled = false

[monitor]
enabled = false

[process]
pid_file = "{pid_file}"

[timeouts]
request_secs = {request_secs}
"#,
        pid_file = pid_file.display(),
    )
}

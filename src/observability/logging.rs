//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Route log output to stderr or to a reopenable log file
//! - Reopen the log file on request (SIGUSR1, after rotation)
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format optional, pretty format by default
//! - Log level configurable via config and environment (`RUST_LOG` wins)

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::ObservabilityConfig;

/// Log destination shared by the subscriber and the reopen handler.
///
/// Without a path, output goes to stderr and reopening is a no-op.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    path: Option<PathBuf>,
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    /// Create a sink writing to stderr.
    pub fn stderr() -> Self {
        Self::default()
    }

    /// Create a sink appending to `path`.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// Close and reopen the log file at its configured path.
    pub fn reopen(&self) -> io::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let fresh = open_append(path)?;
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(fresh);
        Ok(())
    }

    /// Path of the log file, if logging to a file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writer handed out per log event.
pub struct LogWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(file) => file.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(file) => file.flush(),
            None => io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Returns the sink so the lifecycle layer can reopen it later. A subscriber
/// that is already installed (tests, embedding) is left in place.
pub fn init_logging(config: &ObservabilityConfig) -> io::Result<LogSink> {
    let sink = match config.log_file.as_deref() {
        Some(path) => LogSink::file(Path::new(path))?,
        None => LogSink::stderr(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("redirectd={},tower_http=info", config.log_level))
    });

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_logs {
        Box::new(tracing_subscriber::fmt::layer().json().with_writer(sink.clone()))
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_ansi(sink.path().is_none())
                .with_writer(sink.clone()),
        )
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
    {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }

    Ok(sink)
}

//! PID-file backed process identity.
//!
//! The record holds one decimal pid. A record naming a live process means
//! another instance owns the daemon; a record naming a dead process is stale
//! and gets overwritten.
//!
//! Claims are serialized through an exclusive `flock` on a sidecar
//! `<record>.lock` file, so the read, liveness check and write happen as one
//! step with respect to other claimants.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

use crate::lifecycle::handoff::{self, HandoffError, InheritedListener};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Another instance is already running (pid {pid}, record {})", .path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("Identity record {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The identity record of one process.
#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    path: PathBuf,
    pid: u32,
}

impl ProcessIdentity {
    pub fn new(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self { path: path.into(), pid }
    }

    pub fn for_current_process(path: impl Into<PathBuf>) -> Self {
        Self::new(path, std::process::id())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Pid currently recorded, if the record exists and parses.
    pub fn read_record(&self) -> Result<Option<u32>, IdentityError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.trim().parse().ok().filter(|pid| *pid > 0)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(IdentityError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Claim the record for this process.
    pub fn acquire(&self) -> Result<(), IdentityError> {
        self.acquire_from(None)
    }

    /// Claim the record, taking it over from `predecessor` if that is who
    /// holds it.
    pub fn acquire_from(&self, predecessor: Option<u32>) -> Result<(), IdentityError> {
        let _lock = self.lock()?;

        match self.claim_new() {
            Ok(()) => {
                tracing::info!(pid = self.pid, path = %self.path.display(), "Identity acquired");
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => {
                return Err(IdentityError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }

        if let Some(holder) = self.read_record()? {
            let ours = holder == self.pid || Some(holder) == predecessor;
            if !ours && is_alive(holder) {
                return Err(IdentityError::AlreadyRunning {
                    pid: holder,
                    path: self.path.clone(),
                });
            }
            if !ours {
                tracing::warn!(stale_pid = holder, path = %self.path.display(), "Replacing stale identity record");
            }
        }

        self.write_identity()?;
        tracing::info!(pid = self.pid, path = %self.path.display(), "Identity acquired");
        Ok(())
    }

    /// Create the record, failing if one exists.
    fn claim_new(&self) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&self.path)?;
        writeln!(file, "{}", self.pid)
    }

    /// Hold the claim lock until the returned guard drops.
    fn lock(&self) -> Result<Flock<File>, IdentityError> {
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| IdentityError::Io {
                path: lock_path.clone(),
                source,
            })?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| IdentityError::Io {
            path: lock_path,
            source: io::Error::from(errno),
        })
    }

    /// Write this pid to the record, replacing it atomically.
    pub fn write_identity(&self) -> Result<(), IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: self.path.clone(),
            source,
        };

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", self.pid));
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, format!("{}\n", self.pid)).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err(e)
        })
    }

    /// Remove the record if it still names this process.
    ///
    /// Returns whether a record was removed. A record taken over by the next
    /// generation is left alone.
    pub fn release(&self) -> Result<bool, IdentityError> {
        let _lock = self.lock()?;
        if self.read_record()? != Some(self.pid) {
            return Ok(false);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(pid = self.pid, path = %self.path.display(), "Identity released");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(IdentityError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Adopt a listener handed over by a previous generation, if one was.
    pub fn recover(&self) -> Result<Option<InheritedListener>, HandoffError> {
        handoff::recover_inherited_listener()
    }
}

/// Whether `pid` names a running process.
///
/// A process owned by another user still counts as running.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

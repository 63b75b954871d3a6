//! Locks: one advisory file lock per state directory (between processes) and
//! named shared-resource locks (between workers of a run).

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub started_at: String,
    pub command: String,
}

/// Held for the duration of a run; released when dropped.
pub struct StateLock {
    file: File,
}

impl StateLock {
    pub fn acquire(state_dir: &Path, command: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(|e| {
            Error::msg(format!(
                "failed to create state dir {}: {e}",
                state_dir.display()
            ))
        })?;
        let path = state_dir.join(LOCK_FILENAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;

        if let Err(e) = try_lock_exclusive(&file) {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                let holder = read_metadata(&mut file)
                    .map(|m| format!("{} (pid {}, since {})", m.command, m.pid, m.started_at))
                    .unwrap_or_else(|| "another process".into());
                return Err(Error::permanent(format!(
                    "state dir {} is locked by {holder}",
                    state_dir.display()
                )));
            }
            return Err(Error::msg(format!(
                "failed to lock {}: {e}",
                path.display()
            )));
        }

        let meta = LockMetadata {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            command: command.to_string(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        serde_json::to_writer_pretty(&mut file, &meta)?;
        file.flush()?;

        Ok(Self { file })
    }

    pub fn metadata(&mut self) -> Option<LockMetadata> {
        read_metadata(&mut self.file)
    }
}

fn read_metadata(file: &mut File) -> Option<LockMetadata> {
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut raw = String::new();
    file.read_to_string(&mut raw).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

/// Shared-resource locks. Components that write the same target (an rc
/// file, a global package dir) never run `apply` at the same time.
///
/// A component's whole resource set is taken at once, which rules out
/// lock-order deadlocks between workers with overlapping sets.
#[derive(Default)]
pub struct ResourceLocks {
    busy: Mutex<BTreeSet<String>>,
    released: Condvar,
}

pub struct ResourceGuard<'a> {
    locks: &'a ResourceLocks,
    names: Vec<String>,
}

impl ResourceLocks {
    fn busy(&self) -> MutexGuard<'_, BTreeSet<String>> {
        match self.busy.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn acquire(&self, names: &[String]) -> ResourceGuard<'_> {
        let mut wanted: Vec<String> = names.to_vec();
        wanted.sort();
        wanted.dedup();

        let mut busy = self.busy();
        while wanted.iter().any(|n| busy.contains(n)) {
            busy = match self.released.wait(busy) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        busy.extend(wanted.iter().cloned());
        ResourceGuard {
            locks: self,
            names: wanted,
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.busy().contains(name)
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        if self.names.is_empty() {
            return;
        }
        let mut busy = self.locks.busy();
        for n in &self.names {
            busy.remove(n);
        }
        drop(busy);
        self.locks.released.notify_all();
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::LockError;

/// Poll interval while waiting on a contended lock with a deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LockKind::Read => "read",
            LockKind::Write => "write",
        }
    }
}

/// Advisory per-package file lock shared by cooperating installer processes.
///
/// A write lock grants exclusive rights to mutate the package's prefix and
/// database record; a read lock permits inspecting install state while
/// preventing an uninstall. Acquires are reference counted within one
/// handle, and the grant can be upgraded (read to write, may time out) or
/// downgraded (write to read, always immediate) in place.
#[derive(Debug)]
pub struct PrefixLock {
    pkg_id: String,
    path: PathBuf,
    file: File,
    readers: u32,
    writers: u32,
}

impl PrefixLock {
    pub fn new(pkg_id: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let pkg_id = pkg_id.into();
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                pkg_id: pkg_id.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                pkg_id: pkg_id.clone(),
                source,
            })?;
        Ok(Self {
            pkg_id,
            path,
            file,
            readers: 0,
            writers: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_write_locked(&self) -> bool {
        self.writers > 0
    }

    pub fn is_read_locked(&self) -> bool {
        self.readers > 0 && self.writers == 0
    }

    /// Acquire a shared lock. `None` blocks until granted.
    pub fn acquire_read(&mut self, timeout: Option<Duration>) -> Result<(), LockError> {
        if self.readers > 0 || self.writers > 0 {
            // A write grant already covers reads.
            self.readers += 1;
            return Ok(());
        }
        self.wait_for(LockKind::Read, timeout)?;
        self.readers = 1;
        debug!(pkg_id = %self.pkg_id, "acquired read lock");
        Ok(())
    }

    /// Acquire an exclusive lock. `None` blocks until granted.
    pub fn acquire_write(&mut self, timeout: Option<Duration>) -> Result<(), LockError> {
        if self.writers > 0 {
            self.writers += 1;
            return Ok(());
        }
        if self.readers > 0 {
            return self.upgrade_read_to_write(timeout);
        }
        self.wait_for(LockKind::Write, timeout)?;
        self.writers = 1;
        debug!(pkg_id = %self.pkg_id, "acquired write lock");
        Ok(())
    }

    /// Convert a shared grant to exclusive. May time out; on timeout the
    /// original shared grant is still held.
    pub fn upgrade_read_to_write(&mut self, timeout: Option<Duration>) -> Result<(), LockError> {
        if self.writers > 0 {
            self.writers += 1;
            return Ok(());
        }
        self.wait_for(LockKind::Write, timeout)?;
        self.writers = 1;
        debug!(pkg_id = %self.pkg_id, "upgraded to write lock");
        Ok(())
    }

    /// Convert the exclusive grant to shared. Always succeeds immediately;
    /// erroring only when no write grant is held.
    pub fn downgrade_write_to_read(&mut self) -> Result<(), LockError> {
        if self.writers == 0 {
            return Err(LockError::Downgrade {
                pkg_id: self.pkg_id.clone(),
            });
        }
        // Dropping from exclusive to shared cannot contend. Fully qualified:
        // std's own File lock methods shadow the fs4 trait otherwise.
        fs4::FileExt::lock_shared(&self.file).map_err(|source| LockError::Io {
            pkg_id: self.pkg_id.clone(),
            source,
        })?;
        self.readers += self.writers;
        self.writers = 0;
        debug!(pkg_id = %self.pkg_id, "downgraded to read lock");
        Ok(())
    }

    pub fn release_read(&mut self) -> Result<(), LockError> {
        if self.readers > 0 {
            self.readers -= 1;
        }
        self.unlock_if_unused()
    }

    pub fn release_write(&mut self) -> Result<(), LockError> {
        if self.writers > 0 {
            self.writers -= 1;
            if self.writers == 0 && self.readers > 0 {
                // Outstanding read refs keep a shared grant alive.
                fs4::FileExt::lock_shared(&self.file).map_err(|source| LockError::Io {
                    pkg_id: self.pkg_id.clone(),
                    source,
                })?;
                return Ok(());
            }
        }
        self.unlock_if_unused()
    }

    pub fn release_all(&mut self) -> Result<(), LockError> {
        self.readers = 0;
        self.writers = 0;
        self.unlock_if_unused()
    }

    fn unlock_if_unused(&mut self) -> Result<(), LockError> {
        if self.readers == 0 && self.writers == 0 {
            fs4::FileExt::unlock(&self.file).map_err(|source| LockError::Io {
                pkg_id: self.pkg_id.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn wait_for(&self, kind: LockKind, timeout: Option<Duration>) -> Result<(), LockError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let attempt = match kind {
                LockKind::Read => fs4::FileExt::try_lock_shared(&self.file),
                LockKind::Write => fs4::FileExt::try_lock_exclusive(&self.file),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(source) => {
                    return Err(LockError::Io {
                        pkg_id: self.pkg_id.clone(),
                        source,
                    });
                }
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout {
                            pkg_id: self.pkg_id.clone(),
                            kind: kind.as_str(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

impl Drop for PrefixLock {
    fn drop(&mut self) {
        let _ = fs4::FileExt::unlock(&self.file);
    }
}

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("Invalid path")]
    InvalidPath,
    #[error("lock io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
struct HeldLock {
    resource_path: String,
    lock_file_path: PathBuf,
    file: File,
}

/// Advisory, cross-process locks on shared peripherals (serial ports and
/// the like). Locks are `flock`-style, so a crashed holder releases its
/// lock with its file descriptors.
#[derive(Debug)]
pub struct PeripheralLocks {
    dir: PathBuf,
    slots: Mutex<Vec<Option<HeldLock>>>,
}

impl PeripheralLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            slots: Mutex::new(Vec::new()),
        }
    }

    /// `/dev/ttyUSB0` becomes `<dir>/devttyUSB0.lock`.
    pub fn lock_file_path(&self, resource_path: &str) -> PathBuf {
        let name: String = resource_path.chars().filter(|c| *c != '/').collect();
        self.dir.join(format!("{name}.lock"))
    }

    pub async fn acquire(&self, resource_path: &str, wait: Duration) -> Result<(), LockError> {
        let lock_file_path = self.lock_file_path(resource_path);
        if let Some(parent) = lock_file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_file_path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if is_contended(&err) => {
                    if started.elapsed() >= wait {
                        return Err(LockError::Timeout {
                            path: lock_file_path,
                            waited: wait,
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::debug!(resource = %resource_path, lock = %lock_file_path.display(), "peripheral locked");
        let held = HeldLock {
            resource_path: resource_path.to_string(),
            lock_file_path,
            file,
        };
        let mut slots = self.lock_slots();
        match slots.iter().position(Option::is_none) {
            Some(idx) => slots[idx] = Some(held),
            None => slots.push(Some(held)),
        }
        Ok(())
    }

    pub fn release(&self, resource_path: &str) -> Result<(), LockError> {
        let lock_file_path = self.lock_file_path(resource_path);
        let held = {
            let mut slots = self.lock_slots();
            let idx = slots
                .iter()
                .position(|slot| {
                    slot.as_ref()
                        .is_some_and(|held| held.lock_file_path == lock_file_path)
                })
                .ok_or(LockError::InvalidPath)?;
            slots[idx].take()
        };
        let Some(held) = held else {
            return Err(LockError::InvalidPath);
        };
        held.file.unlock()?;
        tracing::debug!(resource = %held.resource_path, "peripheral unlocked");
        Ok(())
    }

    pub fn held_count(&self) -> usize {
        self.lock_slots().iter().filter(|s| s.is_some()).count()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Option<HeldLock>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_path_strips_slashes() {
        let locks = PeripheralLocks::new("/tmp/locks");
        assert_eq!(
            locks.lock_file_path("/dev/ttyUSB0"),
            PathBuf::from("/tmp/locks/devttyUSB0.lock")
        );
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let locks = PeripheralLocks::new(dir.path());

        locks.acquire("/dev/ttyUSB0", Duration::from_secs(1)).await.unwrap();
        locks.release("/dev/ttyUSB0").unwrap();

        let started = std::time::Instant::now();
        locks.acquire("/dev/ttyUSB0", Duration::ZERO).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(locks.held_count(), 1);
    }

    #[tokio::test]
    async fn second_holder_times_out_while_first_holds() {
        let dir = tempfile::tempdir().unwrap();
        let first = PeripheralLocks::new(dir.path());
        let second = PeripheralLocks::new(dir.path());

        first.acquire("/dev/ttyACM0", Duration::from_secs(1)).await.unwrap();
        let err = second
            .acquire("/dev/ttyACM0", Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        first.release("/dev/ttyACM0").unwrap();
        second.acquire("/dev/ttyACM0", Duration::from_millis(500)).await.unwrap();
    }

    #[test]
    fn releasing_an_unheld_path_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let locks = PeripheralLocks::new(dir.path());
        let err = locks.release("/dev/never").unwrap_err();
        assert!(matches!(err, LockError::InvalidPath));
        assert_eq!(err.to_string(), "Invalid path");
    }

    #[tokio::test]
    async fn freed_slots_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let locks = PeripheralLocks::new(dir.path());
        locks.acquire("/dev/a", Duration::ZERO).await.unwrap();
        locks.acquire("/dev/b", Duration::ZERO).await.unwrap();
        locks.release("/dev/a").unwrap();
        locks.acquire("/dev/c", Duration::ZERO).await.unwrap();

        let slots = locks.lock_slots();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].as_ref().unwrap().resource_path, "/dev/c");
    }
}

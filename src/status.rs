//! Cross-process status flags.
//!
//! A 16-byte record in a shared file, guarded by `flock(LOCK_EX)` for every
//! read and every read-modify-write. Layout:
//!
//! | bytes  | field                                   |
//! |--------|-----------------------------------------|
//! | 0..4   | magic `RQSF`                            |
//! | 4      | layout version (1)                      |
//! | 5      | flag bits, one per `StatusFlag`         |
//! | 6..8   | reserved, zero                          |
//! | 8..16  | last activity, unix millis, little end. |
//!
//! The lock is per open file description, so separate handles in one process
//! exclude each other the same way separate processes do.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const MAGIC: [u8; 4] = *b"RQSF";
const VERSION: u8 = 1;
const RECORD_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status record {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("status record {path} is not a status record (bad magic or version)")]
    Corrupt { path: PathBuf },
}

/// Named flags shared between worker processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusFlag {
    RequestPending,
    RequestApproved,
    RequestDenied,
    NotificationSent,
    PdfGenerated,
    SubmissionComplete,
}

impl StatusFlag {
    pub const ALL: [StatusFlag; 6] = [
        StatusFlag::RequestPending,
        StatusFlag::RequestApproved,
        StatusFlag::RequestDenied,
        StatusFlag::NotificationSent,
        StatusFlag::PdfGenerated,
        StatusFlag::SubmissionComplete,
    ];

    fn bit(self) -> u8 {
        match self {
            StatusFlag::RequestPending => 1 << 0,
            StatusFlag::RequestApproved => 1 << 1,
            StatusFlag::RequestDenied => 1 << 2,
            StatusFlag::NotificationSent => 1 << 3,
            StatusFlag::PdfGenerated => 1 << 4,
            StatusFlag::SubmissionComplete => 1 << 5,
        }
    }
}

/// Decoded copy of the shared record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    bits: u8,
    last_activity_ms: i64,
}

impl StatusSnapshot {
    pub fn get(&self, flag: StatusFlag) -> bool {
        self.bits & flag.bit() != 0
    }

    pub fn any_set(&self) -> bool {
        self.bits != 0
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_activity_ms)
            .single()
            .unwrap_or_default()
    }

    /// Flag name to value, for broadcasting.
    pub fn to_json(&self) -> serde_json::Value {
        let flags: serde_json::Map<String, serde_json::Value> = StatusFlag::ALL
            .iter()
            .map(|flag| {
                let name = serde_json::to_value(flag)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                (name, serde_json::Value::Bool(self.get(*flag)))
            })
            .collect();
        serde_json::json!({
            "flags": flags,
            "lastActivity": self.last_activity().to_rfc3339(),
        })
    }

    fn set(&mut self, flag: StatusFlag, value: bool) {
        if value {
            self.bits |= flag.bit();
        } else {
            self.bits &= !flag.bit();
        }
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5] = self.bits;
        buf[8..16].copy_from_slice(&self.last_activity_ms.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; RECORD_LEN]) -> Option<Self> {
        if buf[0..4] != MAGIC || buf[4] != VERSION {
            return None;
        }
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&buf[8..16]);
        Some(Self {
            bits: buf[5],
            last_activity_ms: i64::from_le_bytes(millis),
        })
    }
}

/// Handle on the shared status record.
#[derive(Debug)]
pub struct StatusStore {
    file: File,
    path: PathBuf,
}

impl StatusStore {
    /// Opens the record at `path`, initializing it when the file is new or empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StatusError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| StatusError::Io {
                path: path.clone(),
                source,
            })?;
        let store = Self { file, path };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StatusError> {
        let _guard = self.lock()?;
        let len = self.file.metadata().map_err(|e| self.io(e))?.len();
        if len < RECORD_LEN as u64 {
            self.write_record(&StatusSnapshot {
                bits: 0,
                last_activity_ms: Utc::now().timestamp_millis(),
            })?;
            info!(path = %self.path.display(), "status record initialized");
            return Ok(());
        }
        self.read_record().map(|_| ())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<StatusSnapshot, StatusError> {
        let _guard = self.lock()?;
        self.read_record()
    }

    /// Read, set one flag, write back, all under the lock. Returns the new snapshot.
    pub fn update(&self, flag: StatusFlag, value: bool) -> Result<StatusSnapshot, StatusError> {
        let _guard = self.lock()?;
        let mut snapshot = self.read_record()?;
        snapshot.set(flag, value);
        snapshot.last_activity_ms = Utc::now().timestamp_millis();
        self.write_record(&snapshot)?;
        debug!(flag = ?flag, value, "status flag updated");
        Ok(snapshot)
    }

    /// Clears every flag.
    pub fn reset(&self) -> Result<StatusSnapshot, StatusError> {
        let _guard = self.lock()?;
        let snapshot = StatusSnapshot {
            bits: 0,
            last_activity_ms: Utc::now().timestamp_millis(),
        };
        self.write_record(&snapshot)?;
        Ok(snapshot)
    }

    /// Resets if any flag is set and nothing touched the record for `idle`.
    ///
    /// The check and the reset happen under one lock.
    pub fn reset_if_idle(&self, idle: Duration, now: DateTime<Utc>) -> Result<bool, StatusError> {
        let _guard = self.lock()?;
        let snapshot = self.read_record()?;
        // clock skew between processes reads as "just active"
        let idle_for = now
            .signed_duration_since(snapshot.last_activity())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !snapshot.any_set() || idle_for < idle {
            return Ok(false);
        }
        self.write_record(&StatusSnapshot {
            bits: 0,
            last_activity_ms: now.timestamp_millis(),
        })?;
        info!(
            idle_secs = idle_for.as_secs(),
            "status flags reset after inactivity"
        );
        Ok(true)
    }

    fn lock(&self) -> Result<FlockGuard<'_>, StatusError> {
        flock_exclusive(&self.file).map_err(|e| self.io(e))?;
        Ok(FlockGuard { file: &self.file })
    }

    fn read_record(&self) -> Result<StatusSnapshot, StatusError> {
        let mut buf = [0u8; RECORD_LEN];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0)).map_err(|e| self.io(e))?;
        file.read_exact(&mut buf).map_err(|e| self.io(e))?;
        StatusSnapshot::decode(&buf).ok_or_else(|| StatusError::Corrupt {
            path: self.path.clone(),
        })
    }

    fn write_record(&self, snapshot: &StatusSnapshot) -> Result<(), StatusError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0)).map_err(|e| self.io(e))?;
        file.write_all(&snapshot.encode()).map_err(|e| self.io(e))?;
        file.flush().map_err(|e| self.io(e))
    }

    fn io(&self, source: io::Error) -> StatusError {
        StatusError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Spawns the inactivity janitor. Checks every `interval`, resets after `idle`.
pub fn spawn_janitor(store: Arc<StatusStore>, interval: Duration, idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = Arc::clone(&store);
            let sweep =
                tokio::task::spawn_blocking(move || store.reset_if_idle(idle, Utc::now())).await;
            match sweep {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("status janitor failed: {e}"),
                Err(e) => error!("status janitor task panicked: {e}"),
            }
        }
    })
}

struct FlockGuard<'a> {
    file: &'a File,
}

impl Drop for FlockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = flock_unlock(self.file) {
            error!("failed to release status record lock: {e}");
        }
    }
}

/// Blocking exclusive `flock`.
#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn flock_unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "status record locking requires flock",
    ))
}

#[cfg(not(unix))]
fn flock_unlock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tempfile::TempDir;

    use super::*;

    fn open_in(dir: &TempDir) -> StatusStore {
        StatusStore::open(dir.path().join("status")).unwrap()
    }

    #[test]
    fn new_record_is_all_false() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);
        let snapshot = store.read().unwrap();
        for flag in StatusFlag::ALL {
            assert!(!snapshot.get(flag), "{flag:?}");
        }
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), RECORD_LEN as u64);
    }

    #[test]
    fn update_returns_new_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);

        let snapshot = store.update(StatusFlag::RequestPending, true).unwrap();
        assert!(snapshot.get(StatusFlag::RequestPending));
        assert!(!snapshot.get(StatusFlag::RequestApproved));

        let snapshot = store.update(StatusFlag::RequestApproved, true).unwrap();
        assert!(snapshot.get(StatusFlag::RequestPending));
        assert!(snapshot.get(StatusFlag::RequestApproved));

        let snapshot = store.update(StatusFlag::RequestPending, false).unwrap();
        assert!(!snapshot.get(StatusFlag::RequestPending));
        assert_eq!(store.read().unwrap(), snapshot);
    }

    #[test]
    fn second_handle_sees_writes() {
        let dir = TempDir::new().unwrap();
        let writer = open_in(&dir);
        writer.update(StatusFlag::NotificationSent, true).unwrap();

        let reader = open_in(&dir);
        assert!(reader.read().unwrap().get(StatusFlag::NotificationSent));
    }

    #[test]
    fn reset_zeroes_flags() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);
        store.update(StatusFlag::PdfGenerated, true).unwrap();
        store.update(StatusFlag::SubmissionComplete, true).unwrap();

        let snapshot = store.reset().unwrap();
        assert!(!snapshot.any_set());
        assert!(!store.read().unwrap().any_set());
    }

    #[test]
    fn corrupt_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");
        std::fs::write(&path, [0xffu8; RECORD_LEN]).unwrap();
        assert!(matches!(
            StatusStore::open(&path),
            Err(StatusError::Corrupt { .. })
        ));
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");
        StatusStore::open(&path).unwrap();

        let handles: Vec<_> = StatusFlag::ALL
            .into_iter()
            .map(|flag| {
                let path = path.clone();
                thread::spawn(move || {
                    // own handle per thread, like a separate worker process
                    let store = StatusStore::open(&path).unwrap();
                    for _ in 0..50 {
                        store.update(flag, false).unwrap();
                        store.update(flag, true).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = StatusStore::open(&path).unwrap().read().unwrap();
        for flag in StatusFlag::ALL {
            assert!(snapshot.get(flag), "{flag:?} lost");
        }
    }

    #[test]
    fn idle_reset_waits_for_window() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);
        let snapshot = store.update(StatusFlag::RequestPending, true).unwrap();
        let idle = Duration::from_secs(600);

        let soon = snapshot.last_activity() + chrono::Duration::minutes(5);
        assert!(!store.reset_if_idle(idle, soon).unwrap());
        assert!(store.read().unwrap().get(StatusFlag::RequestPending));

        let later = snapshot.last_activity() + chrono::Duration::minutes(11);
        assert!(store.reset_if_idle(idle, later).unwrap());
        assert!(!store.read().unwrap().any_set());
    }

    #[test]
    fn idle_reset_skips_clean_record() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(!store.reset_if_idle(Duration::from_secs(600), later).unwrap());
    }

    #[test]
    fn snapshot_json_names_flags() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);
        let json = store.update(StatusFlag::RequestApproved, true).unwrap().to_json();
        assert_eq!(json["flags"]["requestApproved"], true);
        assert_eq!(json["flags"]["requestPending"], false);
        assert!(json["lastActivity"].is_string());
    }

    #[tokio::test]
    async fn janitor_resets_idle_record() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_in(&dir));
        store.update(StatusFlag::RequestPending, true).unwrap();

        // zero idle window: the first sweep after one interval resets
        let janitor = spawn_janitor(store.clone(), Duration::from_millis(20), Duration::ZERO);
        for _ in 0..200 {
            if !store.read().unwrap().any_set() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        janitor.abort();
        assert!(!store.read().unwrap().any_set());
    }
}

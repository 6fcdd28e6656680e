use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::LaunchError;

#[derive(Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    game: String,
    started_at: u64,
}

/// Exclusive lock held for the whole lifetime of a session so two sessions of
/// the same game never share prefixes or devices.
pub struct SessionLock {
    file: File,
    pub path: PathBuf,
}

impl SessionLock {
    pub fn acquire(dir: &Path, game: &str) -> Result<Self, LaunchError> {
        std::fs::create_dir_all(dir).map_err(|e| LaunchError::io(dir, e))?;
        let path = dir.join(format!("{game}.lock"));
        loop {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| LaunchError::io(&path, e))?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    // The previous owner may have unlinked the file between our
                    // open and our lock; that inode protects nothing.
                    if !Self::still_linked(&file, &path) {
                        continue;
                    }
                    // A leftover record from a dead session is simply overwritten
                    let info = LockInfo {
                        pid: std::process::id(),
                        game: game.to_string(),
                        started_at: SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or_default(),
                    };
                    let body = serde_json::to_string(&info)?;
                    file.set_len(0)
                        .and_then(|_| file.write_all(body.as_bytes()))
                        .and_then(|_| file.sync_all())
                        .map_err(|e| LaunchError::io(&path, e))?;
                    return Ok(SessionLock { file, path });
                }
                // The kernel drops the flock when its holder dies, so a held
                // lock always belongs to a live session.
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    drop(file);
                    let pid = Self::owner(&path).map(|info| info.pid);
                    return Err(LaunchError::AlreadyRunning {
                        game: game.to_string(),
                        pid,
                    });
                }
                Err(e) => return Err(LaunchError::io(&path, e)),
            }
        }
    }

    fn still_linked(file: &File, path: &Path) -> bool {
        match (file.metadata(), std::fs::metadata(path)) {
            (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
            _ => false,
        }
    }

    fn owner(path: &Path) -> Option<LockInfo> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Unlinks the file before unlocking so no waiter can lock a path that is
    /// about to disappear.
    fn release(&self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = self.file.unlock();
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_session_for_same_game_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let first = SessionLock::acquire(tmp.path(), "Coop_Game").unwrap();
        match SessionLock::acquire(tmp.path(), "Coop_Game") {
            Err(LaunchError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id()))
            }
            other => panic!("expected AlreadyRunning, got {:?}", other.err()),
        }
        // Different games do not contend
        let _other = SessionLock::acquire(tmp.path(), "Other_Game").unwrap();
        drop(first);
        assert!(SessionLock::acquire(tmp.path(), "Coop_Game").is_ok());
    }

    #[test]
    fn release_removes_lock_file() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = SessionLock::acquire(tmp.path(), "Game").unwrap();
        let path = lock.path.clone();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn held_lock_without_record_is_still_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Game.lock");
        let holder = File::create(&path).unwrap();
        holder.try_lock_exclusive().unwrap();

        match SessionLock::acquire(tmp.path(), "Game") {
            Err(LaunchError::AlreadyRunning { game, pid }) => {
                assert_eq!(game, "Game");
                assert_eq!(pid, None);
            }
            other => panic!("expected AlreadyRunning, got {:?}", other.err()),
        }
        // The holder's file was left in place
        assert!(path.exists());

        holder.unlock().unwrap();
        drop(holder);
        assert!(SessionLock::acquire(tmp.path(), "Game").is_ok());
    }

    #[test]
    fn record_left_by_dead_session_is_taken_over() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Game.lock");
        std::fs::write(&path, r#"{"pid":4194304,"game":"Game","started_at":0}"#).unwrap();

        let lock = SessionLock::acquire(tmp.path(), "Game").unwrap();
        let info = SessionLock::owner(&lock.path).unwrap();
        assert_eq!(info.pid, std::process::id());
    }
}

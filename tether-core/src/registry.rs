//! Session registry
//!
//! One JSON record per running sync session, named after the SHA-256 of the
//! normalized local path, so two sessions never sync the same tree at once.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// A running (or crashed) sync session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// OS process id of the session
    pub pid: u32,
    /// Remote environment identifier
    pub environment: String,
    /// Working directory inside the remote environment
    pub remote_dir: String,
    /// Normalized local path
    pub local_path: PathBuf,
    /// When the session started
    pub started_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Record for the current process
    pub fn new(
        environment: impl Into<String>,
        remote_dir: impl Into<String>,
        local_path: &Path,
    ) -> Self {
        Self {
            pid: std::process::id(),
            environment: environment.into(),
            remote_dir: remote_dir.into(),
            local_path: normalize(local_path),
            started_at: Utc::now(),
        }
    }

    /// Whether the owning process still runs
    pub fn is_alive(&self) -> bool {
        process_alive(self.pid)
    }
}

/// A record together with where it was found
#[derive(Debug, Clone)]
pub struct RegisteredSession {
    /// Record file
    pub path: PathBuf,
    /// Parsed contents
    pub record: SessionRecord,
    /// Whether the owning process still runs
    pub alive: bool,
}

/// Directory of session records
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    dir: PathBuf,
}

/// Get the default registry directory
pub fn default_registry_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .ok_or_else(|| Error::Config("Could not determine local data directory".to_string()))?;

    Ok(data_dir.join("tether").join("sessions"))
}

impl SessionRegistry {
    /// Registry in the default location
    pub fn new() -> Result<Self> {
        Ok(Self::with_dir(default_registry_dir()?))
    }

    /// Registry in a specific directory
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file for a local path
    pub fn record_path(&self, local_path: &Path) -> PathBuf {
        self.dir.join(format!("{}.json", record_key(local_path)))
    }

    /// Load the record for a local path, if any
    pub fn load(&self, local_path: &Path) -> Result<Option<SessionRecord>> {
        read_record(&self.record_path(local_path))
    }

    /// Claim `record.local_path` for this session
    ///
    /// Refuses while another live process holds the path unless `force` is
    /// set. Records left behind by dead processes are replaced.
    pub fn register(&self, record: SessionRecord, force: bool) -> Result<SessionGuard> {
        let path = self.record_path(&record.local_path);

        if let Some(existing) = read_record(&path)? {
            if existing.pid != record.pid && existing.is_alive() {
                if !force {
                    return Err(Error::Registry(format!(
                        "{} is already being synced by pid {} (environment '{}', since {}). Stop that session or pass --force.",
                        existing.local_path.display(),
                        existing.pid,
                        existing.environment,
                        existing.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                    )));
                }
                warn!(pid = existing.pid, "Taking over sync session from a live process");
            } else if existing.pid != record.pid {
                info!(pid = existing.pid, "Replacing stale session record");
            }
        }

        fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_vec_pretty(&record)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&contents)?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        debug!(path = %path.display(), pid = record.pid, "Registered sync session");
        Ok(SessionGuard {
            path,
            pid: record.pid,
        })
    }

    /// Every record in the registry
    pub fn list(&self) -> Result<Vec<RegisteredSession>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(Some(record)) => {
                    let alive = record.is_alive();
                    sessions.push(RegisteredSession { path, record, alive });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), "Skipping unreadable session record: {}", e)
                }
            }
        }

        sessions.sort_by(|a, b| a.record.started_at.cmp(&b.record.started_at));
        Ok(sessions)
    }

    /// Remove records whose process is gone; returns the records removed
    pub fn prune(&self) -> Result<Vec<SessionRecord>> {
        let mut removed = Vec::new();
        for session in self.list()? {
            if session.alive {
                continue;
            }
            match fs::remove_file(&session.path) {
                Ok(()) => removed.push(session.record),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(removed)
    }
}

/// Removes the session record when dropped, if it still belongs to this session
#[derive(Debug)]
pub struct SessionGuard {
    path: PathBuf,
    pid: u32,
}

impl SessionGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Leave the record alone if another session took it over
        if let Ok(Some(record)) = read_record(&self.path) {
            if record.pid == self.pid {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), "Failed to remove session record: {}", e);
                }
            }
        }
    }
}

fn read_record(path: &Path) -> Result<Option<SessionRecord>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Canonical form of a local path, or the path itself if it cannot be resolved
fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Hex SHA-256 of the normalized path
pub fn record_key(local_path: &Path) -> String {
    let normalized = normalize(local_path);
    hex::encode(Sha256::digest(normalized.to_string_lossy().as_bytes()))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

//! Session record store.
//!
//! Records are single JSON files replaced atomically: write to a
//! `<file>.<pid>.<ns>.tmp` sibling, then rename over the target. Readers
//! never observe a partial record. Listing is tolerant; unparseable files
//! are skipped with a warning so one corrupt record cannot hide the rest.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use acpx_core::{keypolicy, AcpxConfig, SessionRecord};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct SessionRecordStore {
    config: AcpxConfig,
}

impl SessionRecordStore {
    pub fn new(config: AcpxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AcpxConfig {
        &self.config
    }

    pub fn record_path(&self, record_id: &str) -> PathBuf {
        self.config.record_path(record_id)
    }

    /// Atomically persist a record. The serialized document must pass the
    /// persisted-key policy; a violation here is a bug, not an IO problem.
    pub fn write(&self, record: &SessionRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        keypolicy::validate_persisted_keys(&value).map_err(|violation| {
            StoreError::InvalidEvent(acpx_core::EventValidationError::KeyPolicy(violation))
        })?;

        let path = self.record_path(&record.acpx_record_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let tmp = path.with_extension(format!("json.{}.{}.tmp", std::process::id(), nanos));
        fs::write(&tmp, serde_json::to_vec_pretty(&value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read one record by exact id.
    pub fn read(&self, record_id: &str) -> Result<SessionRecord> {
        let path = self.record_path(record_id);
        let bytes = fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    query: record_id.to_string(),
                }
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Resolve by exact id first, then by unique id suffix.
    pub fn resolve(&self, id_or_suffix: &str) -> Result<SessionRecord> {
        match self.read(id_or_suffix) {
            Ok(record) => return Ok(record),
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        let all = self.list()?;
        if let Some(exact) = all.iter().find(|r| r.acpx_record_id == id_or_suffix) {
            return Ok(exact.clone());
        }
        let matches: Vec<&SessionRecord> = all
            .iter()
            .filter(|r| r.acpx_record_id.ends_with(id_or_suffix))
            .collect();
        match matches.len() {
            0 => Err(StoreError::NotFound {
                query: id_or_suffix.to_string(),
            }),
            1 => Ok(matches[0].clone()),
            n => Err(StoreError::Ambiguous {
                query: id_or_suffix.to_string(),
                matches: n,
            }),
        }
    }

    /// All records, newest `last_used_at` first. Unparseable files are
    /// skipped.
    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        let dir = self.config.sessions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(StoreError::from).and_then(|bytes| {
                serde_json::from_slice::<SessionRecord>(&bytes).map_err(StoreError::from)
            }) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable session record");
                }
            }
        }
        records.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(records)
    }

    pub fn list_for_agent(&self, agent_command: &str) -> Result<Vec<SessionRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.agent_command == agent_command)
            .collect())
    }

    /// Walk from `cwd` toward the workspace boundary looking for the session
    /// that owns each level.
    ///
    /// The boundary defaults to the nearest ancestor containing `.git`
    /// (`cwd` itself when no repository encloses it). `name: None` matches
    /// only the unnamed default-for-cwd session. Closed records are never
    /// selected.
    pub fn find_by_directory_walk(
        &self,
        agent_command: &str,
        cwd: &Path,
        name: Option<&str>,
        boundary: Option<&Path>,
    ) -> Result<Option<SessionRecord>> {
        let boundary = boundary
            .map(Path::to_path_buf)
            .or_else(|| nearest_git_root(cwd))
            .unwrap_or_else(|| cwd.to_path_buf());
        let candidates = self.list_for_agent(agent_command)?;

        let mut level = Some(cwd);
        while let Some(dir) = level {
            let hit = candidates.iter().find(|record| {
                !record.closed
                    && record.cwd == dir
                    && record.name.as_deref() == name
            });
            if let Some(record) = hit {
                return Ok(Some(record.clone()));
            }
            if dir == boundary {
                break;
            }
            level = dir.parent();
        }
        Ok(None)
    }
}

/// Nearest ancestor of `start` (inclusive) containing a `.git` entry.
fn nearest_git_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(candidate) = dir {
        if candidate.join(".git").exists() {
            return Some(candidate.to_path_buf());
        }
        dir = candidate.parent();
    }
    None
}

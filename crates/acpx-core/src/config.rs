//! Process-scope configuration.
//!
//! Every path and limit the subsystems need is resolved once, here, and
//! passed down explicitly. No module reads environment variables or computes
//! state paths on its own.

use std::path::{Path, PathBuf};

/// Default cap on a single event-log segment before rotation.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 1024 * 1024;

/// Default number of rotated segments kept next to the active one.
pub const DEFAULT_MAX_SEGMENTS: u32 = 10;

/// Default deadline for externally-facing agent operations.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;

/// Default queue-owner idle TTL. `0` disables idle shutdown.
pub const DEFAULT_IDLE_TTL_MS: u64 = 300_000;

/// Bound on the per-session audit ring buffer.
pub const AUDIT_RING_CAPACITY: usize = 10_000;

/// Resolved runtime configuration for one acpx process.
#[derive(Debug, Clone)]
pub struct AcpxConfig {
    /// State root, `$HOME/.acpx` unless overridden.
    pub state_dir: PathBuf,
    pub max_segment_bytes: u64,
    pub max_segments: u32,
    pub request_timeout_ms: u64,
    pub idle_ttl_ms: u64,
}

impl AcpxConfig {
    /// Configuration rooted at the given state directory.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            max_segments: DEFAULT_MAX_SEGMENTS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            idle_ttl_ms: DEFAULT_IDLE_TTL_MS,
        }
    }

    /// Directory holding session record files and per-session event logs.
    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    /// Directory holding queue-owner lease files and sockets.
    pub fn queues_dir(&self) -> PathBuf {
        self.state_dir.join("queues")
    }

    /// Path of a session record file. The record id is percent-encoded so an
    /// arbitrary opaque id maps onto a single path component.
    pub fn record_path(&self, record_id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.json", urlencoded(record_id)))
    }

    /// Per-session directory holding the events lock and segments.
    pub fn session_dir(&self, record_id: &str) -> PathBuf {
        self.sessions_dir().join(urlencoded(record_id))
    }

    pub fn events_dir(&self, record_id: &str) -> PathBuf {
        self.session_dir(record_id).join("events")
    }

    pub fn events_lock_path(&self, record_id: &str) -> PathBuf {
        self.session_dir(record_id).join("events.lock")
    }
}

fn urlencoded(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

/// Resolve the default state dir from the platform home directory.
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".acpx"))
}

/// Relative path of the active event segment inside a session directory.
pub fn active_segment_name() -> &'static str {
    "active.ndjson"
}

/// Relative path of rotated segment `n` inside a session directory.
pub fn segment_name(n: u32) -> String {
    format!("{n}.ndjson")
}

/// True when `candidate` is a plausible workspace boundary for the directory
/// walk: the nearest ancestor containing `.git`.
pub fn is_git_root(candidate: &Path) -> bool {
    candidate.join(".git").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_path_is_percent_encoded() {
        let cfg = AcpxConfig::with_state_dir("/tmp/acpx-test");
        let path = cfg.record_path("weird/id with spaces");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "weird%2Fid%20with%20spaces.json");
    }

    #[test]
    fn layout_is_rooted_at_state_dir() {
        let cfg = AcpxConfig::with_state_dir("/srv/acpx");
        assert_eq!(cfg.sessions_dir(), PathBuf::from("/srv/acpx/sessions"));
        assert_eq!(cfg.queues_dir(), PathBuf::from("/srv/acpx/queues"));
        assert_eq!(
            cfg.events_lock_path("abc"),
            PathBuf::from("/srv/acpx/sessions/abc/events.lock")
        );
        assert_eq!(
            cfg.events_dir("abc").join(segment_name(3)),
            PathBuf::from("/srv/acpx/sessions/abc/events/3.ndjson")
        );
    }
}

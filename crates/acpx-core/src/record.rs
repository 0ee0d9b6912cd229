//! Durable session records.
//!
//! A `SessionRecord` is the unit of identity: one record per persistent named
//! session, serialised as atomically-replaced JSON with snake_case keys. The
//! record also carries the event-log cursor and the cached projections.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AcpxConfig;
use crate::thread::{AcpxState, SessionThread};

/// Snapshot of the event log state embedded in the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogState {
    /// Path of the active segment; present iff any event has been written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_path: Option<String>,
    /// Number of segment files on disk, the active one included.
    #[serde(default)]
    pub segment_count: u32,
    pub max_segment_bytes: u64,
    pub max_segments: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_write_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_write_error: Option<String>,
}

impl EventLogState {
    pub fn new(config: &AcpxConfig) -> Self {
        Self {
            active_path: None,
            segment_count: 0,
            max_segment_bytes: config.max_segment_bytes,
            max_segments: config.max_segments,
            last_write_at: None,
            last_write_error: None,
        }
    }
}

/// Durable session identity plus cached state.
///
/// Unknown fields are dropped on read; required fields are strict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque stable local id, percent-encoded into the record file name.
    pub acpx_record_id: String,
    /// Current ACP session id on the wire. May change after a
    /// fallback-to-new during connect.
    pub acp_session_id: String,
    /// Inner-agent session id extracted from `_meta`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    /// Exact command string used to spawn the agent. Part of the identity
    /// key and the reconnection key.
    pub agent_command: String,
    /// Absolute workspace root.
    pub cwd: PathBuf,
    /// `None` is the default-for-cwd session; named sessions are distinct.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Soft-closed flag; the record stays on disk.
    #[serde(default)]
    pub closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_agent_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_agent_exit_signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_agent_exit_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_agent_disconnect_reason: Option<String>,
    /// Monotonic event-log cursor: equals the `seq` of the most recently
    /// appended event.
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_id: Option<String>,
    pub event_log: EventLogState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    /// Opaque capability object from ACP `initialize`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_capabilities: Option<Value>,
    #[serde(default)]
    pub thread: SessionThread,
    #[serde(default)]
    pub acpx: AcpxState,
}

impl SessionRecord {
    /// Fresh record for a newly ensured session.
    pub fn new(
        config: &AcpxConfig,
        agent_command: impl Into<String>,
        cwd: PathBuf,
        name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            acpx_record_id: format!("sess-{}", uuid::Uuid::new_v4()),
            acp_session_id: String::new(),
            agent_session_id: None,
            agent_command: agent_command.into(),
            cwd,
            name,
            created_at: now,
            last_used_at: now,
            last_prompt_at: None,
            closed_at: None,
            closed: false,
            pid: None,
            agent_started_at: None,
            last_agent_exit_code: None,
            last_agent_exit_signal: None,
            last_agent_exit_at: None,
            last_agent_disconnect_reason: None,
            last_seq: 0,
            last_request_id: None,
            event_log: EventLogState::new(config),
            protocol_version: None,
            agent_capabilities: None,
            thread: SessionThread::default(),
            acpx: AcpxState::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SessionRecord {
        let config = AcpxConfig::with_state_dir("/tmp/acpx");
        let mut record = SessionRecord::new(
            &config,
            "mock-agent --acp",
            PathBuf::from("/work/project"),
            Some("refactor".into()),
        );
        record.acp_session_id = "acp-1".into();
        record.pid = Some(4242);
        record.last_seq = 7;
        record
    }

    #[test]
    fn round_trips_through_json() {
        let record = sample_record();
        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn disk_keys_are_snake_case() {
        let value = serde_json::to_value(sample_record()).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert!(keys.contains(&"acpx_record_id"));
        assert!(keys.contains(&"acp_session_id"));
        assert!(keys.contains(&"agent_command"));
        assert!(keys.contains(&"last_seq"));
        assert!(keys.contains(&"event_log"));
        assert!(!keys.iter().any(|k| k.chars().any(|c| c.is_ascii_uppercase())));
    }

    #[test]
    fn unknown_fields_are_dropped() {
        let mut value = serde_json::to_value(sample_record()).unwrap();
        value["some_future_field"] = serde_json::json!({"x": 1});
        let back: SessionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.acp_session_id, "acp-1");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut value = serde_json::to_value(sample_record()).unwrap();
        value.as_object_mut().unwrap().remove("agent_command");
        assert!(serde_json::from_value::<SessionRecord>(value).is_err());
    }
}

//! Segment-rotated, append-only event log.
//!
//! One NDJSON line per event envelope. The active segment lives at
//! `events/active.ndjson`; rotated segments at `events/N.ndjson` with `1`
//! the most recent. Writes happen under the per-session events lock, an
//! exclusive-create file. The writer never cleans a stale lock itself; the
//! queue-owner startup path does that once it has verified the holder pid is
//! dead.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use acpx_core::config::{active_segment_name, segment_name};
use acpx_core::{validate_event, AcpxConfig, AcpxEvent, EventDraft, SessionRecord, EVENT_SCHEMA};
use chrono::Utc;

use crate::error::{Result, StoreError};
use crate::records::SessionRecordStore;

/// Contended lock holders retry at this interval, forever.
const LOCK_RETRY: Duration = Duration::from_millis(15);

/// Held events lock; releasing removes the lock file.
#[derive(Debug)]
pub struct EventsLock {
    path: PathBuf,
}

impl EventsLock {
    /// Take the lock, retrying every 15 ms until the exclusive create
    /// succeeds.
    pub async fn acquire(config: &AcpxConfig, record_id: &str) -> Result<Self> {
        let path = config.events_lock_path(record_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for EventsLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Remove a leftover events lock whose recorded holder is no longer alive.
/// `pid_alive` is supplied by the caller; the store stays platform-agnostic.
pub fn clear_stale_events_lock(
    config: &AcpxConfig,
    record_id: &str,
    pid_alive: impl Fn(u32) -> bool,
) -> Result<bool> {
    let path = config.events_lock_path(record_id);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let holder: Option<u32> = contents.trim().parse().ok();
    let stale = match holder {
        Some(pid) => !pid_alive(pid),
        None => true,
    };
    if stale {
        tracing::warn!(path = %path.display(), holder = ?holder, "clearing stale events lock");
        fs::remove_file(&path)?;
    }
    Ok(stale)
}

/// Exclusive writer over one session's event log and record cursor.
pub struct EventLogWriter {
    store: SessionRecordStore,
    record: SessionRecord,
    _lock: EventsLock,
    events_dir: PathBuf,
    active: File,
    active_size: u64,
    rotated: u32,
}

impl EventLogWriter {
    /// Take the events lock and open the active segment for appending.
    pub async fn open(store: SessionRecordStore, record: SessionRecord) -> Result<Self> {
        let config = store.config().clone();
        let lock = EventsLock::acquire(&config, &record.acpx_record_id).await?;
        let events_dir = config.events_dir(&record.acpx_record_id);
        fs::create_dir_all(&events_dir)?;

        let active_path = events_dir.join(active_segment_name());
        let active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let active_size = active.metadata()?.len();
        let rotated = (1..=record.event_log.max_segments)
            .filter(|n| events_dir.join(segment_name(*n)).exists())
            .count() as u32;

        Ok(Self {
            store,
            record,
            _lock: lock,
            events_dir,
            active,
            active_size,
            rotated,
        })
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut SessionRecord {
        &mut self.record
    }

    /// Build the next envelope for this session. Assigns identity, the next
    /// `seq`, and a timestamp; does not persist.
    pub fn create_event(&self, draft: EventDraft) -> AcpxEvent {
        create_event_for_record(&self.record, draft)
    }

    /// Validate and append envelopes, then advance the record cursor.
    /// Nothing is written if any envelope fails validation or breaks the
    /// `seq` chain. Checkpointing atomically rewrites the record file.
    pub fn append_events(&mut self, events: &[AcpxEvent], checkpoint: bool) -> Result<()> {
        if events.is_empty() {
            if checkpoint {
                self.store.write(&self.record)?;
            }
            return Ok(());
        }

        let mut lines = Vec::with_capacity(events.len());
        let mut expected = self.record.last_seq + 1;
        for (i, event) in events.iter().enumerate() {
            validate_event(event, Some(&self.record.acpx_record_id))?;
            if i == 0 && event.seq != expected {
                return Err(StoreError::SeqMismatch {
                    expected,
                    found: event.seq,
                });
            }
            if i > 0 && event.seq < expected {
                return Err(StoreError::SeqMismatch {
                    expected,
                    found: event.seq,
                });
            }
            expected = event.seq + 1;
            let mut line = serde_json::to_string(event)?;
            line.push('\n');
            lines.push(line);
        }

        for (event, line) in events.iter().zip(&lines) {
            if let Err(err) = self.append_line(line) {
                self.record.event_log.last_write_error = Some(err.to_string());
                let _ = self.store.write(&self.record);
                return Err(err);
            }
            self.record.last_seq = event.seq;
            if let Some(request_id) = &event.request_id {
                self.record.last_request_id = Some(request_id.clone());
            }
            self.record.event_log.last_write_error = None;
            self.record.event_log.last_write_at = Some(Utc::now());
            self.record.event_log.active_path = Some(
                self.events_dir
                    .join(active_segment_name())
                    .to_string_lossy()
                    .into_owned(),
            );
            self.record.event_log.segment_count = self.rotated + 1;
        }
        self.record.last_used_at = Utc::now();

        if checkpoint {
            self.store.write(&self.record)?;
        }
        Ok(())
    }

    /// Final checkpoint (unless skipped) and lock release.
    pub fn close(self, checkpoint: bool) -> Result<()> {
        if checkpoint {
            self.store.write(&self.record)?;
        }
        Ok(())
    }

    fn append_line(&mut self, line: &str) -> Result<()> {
        let line_len = line.len() as u64;
        if self.active_size > 0
            && self.active_size + line_len > self.record.event_log.max_segment_bytes
        {
            self.rotate()?;
        }
        self.active.write_all(line.as_bytes())?;
        self.active.flush()?;
        self.active_size += line_len;
        Ok(())
    }

    /// Shift rotated segments up one slot, dropping the oldest at the cap,
    /// then move the active segment into slot 1 and start a fresh one.
    fn rotate(&mut self) -> Result<()> {
        let max = self.record.event_log.max_segments;
        let oldest = self.events_dir.join(segment_name(max));
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..max).rev() {
            let from = self.events_dir.join(segment_name(n));
            if from.exists() {
                fs::rename(&from, self.events_dir.join(segment_name(n + 1)))?;
            }
        }
        let active_path = self.events_dir.join(active_segment_name());
        fs::rename(&active_path, self.events_dir.join(segment_name(1)))?;
        self.active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        self.active_size = 0;
        self.rotated = (self.rotated + 1).min(max);
        Ok(())
    }
}

/// Build an envelope for `record` without persisting it. Used by the writer
/// and by read-only paths (status snapshots) that only feed the formatter.
pub fn create_event_for_record(record: &SessionRecord, draft: EventDraft) -> AcpxEvent {
    AcpxEvent {
        schema: EVENT_SCHEMA.to_string(),
        event_id: uuid::Uuid::new_v4().to_string(),
        session_id: record.acpx_record_id.clone(),
        acp_session_id: draft
            .acp_session_id
            .or_else(|| Some(record.acp_session_id.clone()).filter(|s| !s.is_empty())),
        agent_session_id: draft.agent_session_id.or_else(|| record.agent_session_id.clone()),
        request_id: draft.request_id,
        seq: record.last_seq + 1,
        ts: Utc::now(),
        payload: draft.payload,
    }
}

/// Replay a session's events oldest-first: rotated segments from the oldest
/// slot down to `1`, then the active segment. Invalid or unknown lines are
/// skipped so newer writers stay readable.
pub fn list_session_events(config: &AcpxConfig, record_id: &str) -> Result<Vec<AcpxEvent>> {
    let events_dir = config.events_dir(record_id);
    let max = config.max_segments;
    let mut events = Vec::new();
    for n in (1..=max).rev() {
        read_segment(&events_dir.join(segment_name(n)), record_id, &mut events)?;
    }
    read_segment(
        &events_dir.join(active_segment_name()),
        record_id,
        &mut events,
    )?;
    Ok(events)
}

fn read_segment(path: &Path, record_id: &str, out: &mut Vec<AcpxEvent>) -> Result<()> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AcpxEvent>(line) {
            Ok(event) if validate_event(&event, Some(record_id)).is_ok() => out.push(event),
            Ok(_) | Err(_) => {
                tracing::debug!(path = %path.display(), "skipping invalid event line");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use acpx_core::{EventPayload, SessionRecord};
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup(max_segment_bytes: u64, max_segments: u32) -> (TempDir, SessionRecordStore, SessionRecord) {
        let tmp = TempDir::new().unwrap();
        let mut config = AcpxConfig::with_state_dir(tmp.path());
        config.max_segment_bytes = max_segment_bytes;
        config.max_segments = max_segments;
        let store = SessionRecordStore::new(config.clone());
        let record = SessionRecord::new(&config, "mock-agent", PathBuf::from("/w"), None);
        store.write(&record).unwrap();
        (tmp, store, record)
    }

    fn update_draft(k: u32) -> EventDraft {
        EventDraft::new(EventPayload::Update {
            update: json!({ "update": format!("event-{k}") }),
        })
    }

    #[tokio::test]
    async fn appends_advance_cursor_and_round_trip() {
        let (_tmp, store, record) = setup(1024 * 1024, 7);
        let record_id = record.acpx_record_id.clone();
        let mut writer = EventLogWriter::open(store.clone(), record).await.unwrap();

        for k in 1..=3 {
            let event = writer.create_event(update_draft(k));
            assert_eq!(event.seq, k as u64);
            writer.append_events(&[event], true).unwrap();
        }
        assert_eq!(writer.record().last_seq, 3);
        writer.close(true).unwrap();

        let events = list_session_events(store.config(), &record_id).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        let on_disk = store.read(&record_id).unwrap();
        assert_eq!(on_disk.last_seq, 3);
        assert!(on_disk.event_log.active_path.is_some());
    }

    #[tokio::test]
    async fn rotation_boundary_produces_seven_segments_plus_active() {
        let (_tmp, store, record) = setup(1, 7);
        let record_id = record.acpx_record_id.clone();
        let mut writer = EventLogWriter::open(store.clone(), record).await.unwrap();

        for k in 1..=8 {
            let event = writer.create_event(update_draft(k));
            writer.append_events(&[event], true).unwrap();
            if k == 3 {
                assert_eq!(writer.record().event_log.segment_count, 3);
            }
        }
        let segment_count = writer.record().event_log.segment_count;
        assert_eq!(segment_count, 8);
        writer.close(true).unwrap();

        let events_dir = store.config().events_dir(&record_id);
        let mut segment_files = 0;
        for n in 1..=7 {
            if events_dir.join(segment_name(n)).exists() {
                segment_files += 1;
            }
        }
        assert_eq!(segment_files, 7);
        assert!(events_dir.join(active_segment_name()).exists());

        let events = list_session_events(store.config(), &record_id).unwrap();
        assert_eq!(events.len(), 8);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            (1..=8).collect::<Vec<u64>>()
        );
    }

    #[tokio::test]
    async fn duplicate_seq_fails_without_corrupting_the_log() {
        let (_tmp, store, record) = setup(1024 * 1024, 7);
        let record_id = record.acpx_record_id.clone();
        let mut writer = EventLogWriter::open(store.clone(), record).await.unwrap();

        let event = writer.create_event(update_draft(1));
        writer.append_events(&[event.clone()], true).unwrap();
        let err = writer.append_events(&[event], true).unwrap_err();
        assert!(matches!(err, StoreError::SeqMismatch { expected: 2, found: 1 }));
        writer.close(true).unwrap();

        let events = list_session_events(store.config(), &record_id).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn malformed_event_is_rejected_before_write() {
        let (_tmp, store, record) = setup(1024 * 1024, 7);
        let record_id = record.acpx_record_id.clone();
        let mut writer = EventLogWriter::open(store.clone(), record).await.unwrap();

        let mut event = writer.create_event(update_draft(1));
        event.session_id = "someone-else".into();
        assert!(writer.append_events(&[event], true).is_err());
        writer.close(false).unwrap();

        let events = list_session_events(store.config(), &record_id).unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn replay_skips_unknown_event_types() {
        let (_tmp, store, record) = setup(1024 * 1024, 7);
        let record_id = record.acpx_record_id.clone();
        let mut writer = EventLogWriter::open(store.clone(), record).await.unwrap();
        let event = writer.create_event(update_draft(1));
        writer.append_events(&[event], true).unwrap();
        writer.close(true).unwrap();

        // Simulate a newer writer's event type plus garbage.
        let active = store.config().events_dir(&record_id).join(active_segment_name());
        let mut contents = fs::read_to_string(&active).unwrap();
        contents.push_str("{\"schema\":\"acpx.event.v1\",\"type\":\"hologram\",\"data\":{}}\n");
        contents.push_str("not json at all\n");
        fs::write(&active, contents).unwrap();

        let events = list_session_events(store.config(), &record_id).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn events_lock_is_exclusive_and_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let config = AcpxConfig::with_state_dir(tmp.path());
        let lock = EventsLock::acquire(&config, "sess-x").await.unwrap();

        let second = tokio::time::timeout(
            Duration::from_millis(80),
            EventsLock::acquire(&config, "sess-x"),
        )
        .await;
        assert!(second.is_err(), "second acquire should still be retrying");

        drop(lock);
        let third = tokio::time::timeout(
            Duration::from_millis(500),
            EventsLock::acquire(&config, "sess-x"),
        )
        .await;
        assert!(third.is_ok());
    }

    #[test]
    fn stale_lock_cleanup_uses_caller_liveness() {
        let tmp = TempDir::new().unwrap();
        let config = AcpxConfig::with_state_dir(tmp.path());
        let path = config.events_lock_path("sess-y");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "12345\n").unwrap();

        // Holder reported alive: lock stays.
        assert!(!clear_stale_events_lock(&config, "sess-y", |_| true).unwrap());
        assert!(path.exists());

        // Holder dead: lock removed.
        assert!(clear_stale_events_lock(&config, "sess-y", |_| false).unwrap());
        assert!(!path.exists());
    }
}

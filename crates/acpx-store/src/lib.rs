//! # acpx-store
//!
//! Durable state for acpx sessions: the record store (atomically-replaced
//! JSON, one file per session) and the append-only, segment-rotated event
//! log that is the source of truth for replay.

pub mod error;
pub mod events;
pub mod records;

pub use error::{Result, StoreError};
pub use events::{
    clear_stale_events_lock, create_event_for_record, list_session_events, EventLogWriter,
    EventsLock,
};
pub use records::SessionRecordStore;

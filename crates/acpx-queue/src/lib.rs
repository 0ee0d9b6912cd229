//! # acpx-queue
//!
//! Cross-process coordination for one session: the file lease that elects a
//! queue owner, the newline-JSON IPC protocol served on the owner's Unix
//! socket, the client used by other CLI invocations, and the owner main
//! loop that drives prompt turns against the agent.

pub mod client;
pub mod lease;
pub mod owner;
pub mod wire;

pub use client::OwnerClient;
pub use lease::{
    lock_path, probe_health, queue_hash, read_lease, socket_path, try_acquire, windows_pipe_name,
    LeaseGuard, QueueOwnerHealth, QueueOwnerLease, HEARTBEAT_STALE,
};
pub use owner::{
    run_direct_control, run_queue_owner, ChannelSink, NullTaskSink, OwnerTask, QueueOwnerOptions,
    SocketSink, TaskSink,
};
pub use wire::{error_from_message, parse_request, OwnerMessage, QueueRequest, SendResult};

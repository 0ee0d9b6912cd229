//! Queue-owner lease.
//!
//! A lease is a file plus a socket: the file's existence (created with
//! exclusive-create semantics) *is* the lease, and the socket next to it is
//! where the owner serves. Stale leases, where the recorded pid is dead or
//! the heartbeat is old, are torn down by the next acquirer.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use acpx_acp::process::{pid_alive, terminate_process};
use acpx_core::{AcpxConfig, ErrorOrigin, OutputError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A heartbeat older than this marks the lease stale.
pub const HEARTBEAT_STALE: Duration = Duration::from_secs(15);

/// On-disk lease payload. camelCase keys are the documented lease-file
/// contract; readers accept unknown fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOwnerLease {
    pub pid: u32,
    pub session_id: String,
    pub socket_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// Strictly increasing across a continuous chain of owners.
    pub owner_generation: u64,
    #[serde(default)]
    pub queue_depth: u32,
}

impl QueueOwnerLease {
    pub fn heartbeat_is_stale(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.heartbeat_at);
        age.to_std()
            .map(|age| age > HEARTBEAT_STALE)
            .unwrap_or(false)
    }
}

/// First 24 hex chars of sha256, the shared name for lock, socket, and pipe.
pub fn queue_hash(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    hex::encode(digest)[..24].to_string()
}

pub fn lock_path(config: &AcpxConfig, session_id: &str) -> PathBuf {
    config.queues_dir().join(format!("{}.lock", queue_hash(session_id)))
}

pub fn socket_path(config: &AcpxConfig, session_id: &str) -> PathBuf {
    config.queues_dir().join(format!("{}.sock", queue_hash(session_id)))
}

/// Named-pipe equivalent of [`socket_path`] on Windows.
pub fn windows_pipe_name(session_id: &str) -> String {
    format!("\\\\.\\pipe\\acpx-{}", queue_hash(session_id))
}

/// Read the lease file if present. Unreadable contents count as absent.
pub fn read_lease(
    config: &AcpxConfig,
    session_id: &str,
) -> Result<Option<QueueOwnerLease>, OutputError> {
    let path = lock_path(config, session_id);
    match fs::read(&path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(err)),
    }
}

/// Held lease. Dropping does NOT release; call [`LeaseGuard::release`] so
/// teardown order (socket first, then lock) is explicit.
#[derive(Debug)]
pub struct LeaseGuard {
    config: AcpxConfig,
    lease: QueueOwnerLease,
}

impl LeaseGuard {
    pub fn lease(&self) -> &QueueOwnerLease {
        &self.lease
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.lease.socket_path
    }

    /// Rewrite the lease with a fresh heartbeat and the current queue depth.
    pub fn refresh(&mut self, queue_depth: u32) -> Result<(), OutputError> {
        self.lease.heartbeat_at = Utc::now();
        self.lease.queue_depth = queue_depth;
        let path = lock_path(&self.config, &self.lease.session_id);
        fs::write(&path, serde_json::to_vec_pretty(&self.lease).map_err(json_error)?)
            .map_err(io_error)
    }

    /// Remove the socket, then the lock file.
    pub fn release(self) {
        let _ = fs::remove_file(&self.lease.socket_path);
        let _ = fs::remove_file(lock_path(&self.config, &self.lease.session_id));
    }
}

/// Try to become the queue owner for `session_id`.
///
/// Returns `None` when a healthy owner already holds the lease. A stale
/// holder (dead pid or old heartbeat) is terminated and its lock and socket
/// removed, after which a single fresh create is attempted with the
/// displaced generation + 1.
pub async fn try_acquire(
    config: &AcpxConfig,
    session_id: &str,
) -> Result<Option<LeaseGuard>, OutputError> {
    fs::create_dir_all(config.queues_dir()).map_err(io_error)?;

    match create_lease_file(config, session_id, 1)? {
        Some(guard) => return Ok(Some(guard)),
        None => {}
    }

    let Some(existing) = read_lease(config, session_id)? else {
        // Lock exists but is unreadable; treat as stale with no holder.
        fs::remove_file(lock_path(config, session_id)).ok();
        return Ok(create_lease_file(config, session_id, 1)?);
    };

    let holder_alive = pid_alive(existing.pid);
    if holder_alive && !existing.heartbeat_is_stale() {
        return Ok(None);
    }

    tracing::info!(
        session = session_id,
        stale_pid = existing.pid,
        holder_alive,
        "taking over stale queue lease"
    );
    if holder_alive {
        terminate_process(existing.pid).await;
    }
    let _ = fs::remove_file(&existing.socket_path);
    let _ = fs::remove_file(lock_path(config, session_id));
    Ok(create_lease_file(config, session_id, existing.owner_generation + 1)?)
}

fn create_lease_file(
    config: &AcpxConfig,
    session_id: &str,
    generation: u64,
) -> Result<Option<LeaseGuard>, OutputError> {
    let path = lock_path(config, session_id);
    let now = Utc::now();
    let lease = QueueOwnerLease {
        pid: std::process::id(),
        session_id: session_id.to_string(),
        socket_path: socket_path(config, session_id),
        created_at: now,
        heartbeat_at: now,
        owner_generation: generation,
        queue_depth: 0,
    };
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            file.write_all(&serde_json::to_vec_pretty(&lease).map_err(json_error)?)
                .map_err(io_error)?;
            Ok(Some(LeaseGuard {
                config: config.clone(),
                lease,
            }))
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(io_error(err)),
    }
}

/// Point-in-time health of a session's queue owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOwnerHealth {
    pub has_lease: bool,
    pub pid_alive: bool,
    pub socket_reachable: bool,
    /// A reachable socket wins over a dead-looking pid: the listener may
    /// have been inherited by a successor process.
    pub healthy: bool,
}

pub async fn probe_health(config: &AcpxConfig, session_id: &str) -> QueueOwnerHealth {
    let lease = read_lease(config, session_id).ok().flatten();
    let (has_lease, holder_alive, socket) = match &lease {
        Some(lease) => (true, pid_alive(lease.pid), Some(lease.socket_path.clone())),
        None => (false, false, None),
    };
    let socket_reachable = match socket {
        Some(path) => tokio::time::timeout(
            Duration::from_millis(250),
            tokio::net::UnixStream::connect(&path),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false),
        None => false,
    };
    QueueOwnerHealth {
        has_lease,
        pid_alive: holder_alive,
        socket_reachable,
        healthy: has_lease && socket_reachable,
    }
}

fn io_error(err: std::io::Error) -> OutputError {
    OutputError::runtime(format!("queue lease IO error: {err}")).with_origin(ErrorOrigin::Queue)
}

fn json_error(err: serde_json::Error) -> OutputError {
    OutputError::runtime(format!("queue lease encode error: {err}")).with_origin(ErrorOrigin::Queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hash_is_stable_and_short() {
        let hash = queue_hash("sess-1");
        assert_eq!(hash.len(), 24);
        assert_eq!(hash, queue_hash("sess-1"));
        assert_ne!(hash, queue_hash("sess-2"));
        assert!(windows_pipe_name("sess-1").starts_with("\\\\.\\pipe\\acpx-"));
    }

    #[tokio::test]
    async fn acquire_is_exclusive_while_holder_is_healthy() {
        let tmp = TempDir::new().unwrap();
        let config = AcpxConfig::with_state_dir(tmp.path());

        let guard = try_acquire(&config, "sess-1").await.unwrap().unwrap();
        assert_eq!(guard.lease().owner_generation, 1);
        // Same-process holder is alive with a fresh heartbeat.
        assert!(try_acquire(&config, "sess-1").await.unwrap().is_none());
        guard.release();
        assert!(read_lease(&config, "sess-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_dead_pid_lease_is_taken_over_with_bumped_generation() {
        let tmp = TempDir::new().unwrap();
        let config = AcpxConfig::with_state_dir(tmp.path());
        fs::create_dir_all(config.queues_dir()).unwrap();

        let stale = QueueOwnerLease {
            pid: u32::MAX - 1,
            session_id: "sess-1".into(),
            socket_path: socket_path(&config, "sess-1"),
            created_at: Utc::now(),
            heartbeat_at: Utc::now(),
            owner_generation: 6,
            queue_depth: 2,
        };
        fs::write(
            lock_path(&config, "sess-1"),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        let guard = try_acquire(&config, "sess-1").await.unwrap().unwrap();
        assert_eq!(guard.lease().owner_generation, 7);
        assert_eq!(guard.lease().pid, std::process::id());
        guard.release();
    }

    #[test]
    fn heartbeat_staleness_threshold() {
        let mut lease = QueueOwnerLease {
            pid: std::process::id(),
            session_id: "sess-2".into(),
            socket_path: PathBuf::from("/tmp/x.sock"),
            created_at: Utc::now(),
            heartbeat_at: Utc::now(),
            owner_generation: 1,
            queue_depth: 0,
        };
        assert!(!lease.heartbeat_is_stale());
        lease.heartbeat_at = Utc::now() - chrono::Duration::seconds(16);
        assert!(lease.heartbeat_is_stale());
    }

    #[tokio::test]
    async fn probe_reports_healthy_when_socket_listens_despite_dead_pid() {
        let tmp = TempDir::new().unwrap();
        let config = AcpxConfig::with_state_dir(tmp.path());
        fs::create_dir_all(config.queues_dir()).unwrap();

        let sock = socket_path(&config, "sess-3");
        let _listener = tokio::net::UnixListener::bind(&sock).unwrap();
        let lease = QueueOwnerLease {
            pid: u32::MAX - 1,
            session_id: "sess-3".into(),
            socket_path: sock,
            created_at: Utc::now(),
            heartbeat_at: Utc::now(),
            owner_generation: 1,
            queue_depth: 0,
        };
        fs::write(
            lock_path(&config, "sess-3"),
            serde_json::to_vec(&lease).unwrap(),
        )
        .unwrap();

        let health = probe_health(&config, "sess-3").await;
        assert!(health.has_lease);
        assert!(!health.pid_alive);
        assert!(health.socket_reachable);
        assert!(health.healthy);
    }

    #[tokio::test]
    async fn probe_without_lease_is_unhealthy() {
        let tmp = TempDir::new().unwrap();
        let config = AcpxConfig::with_state_dir(tmp.path());
        let health = probe_health(&config, "sess-none").await;
        assert!(!health.has_lease);
        assert!(!health.healthy);
    }

    #[test]
    fn lease_file_keys_are_camel_case() {
        let lease = QueueOwnerLease {
            pid: 1,
            session_id: "s".into(),
            socket_path: PathBuf::from("/tmp/x.sock"),
            created_at: Utc::now(),
            heartbeat_at: Utc::now(),
            owner_generation: 3,
            queue_depth: 1,
        };
        let value = serde_json::to_value(&lease).unwrap();
        assert!(value.get("sessionId").is_some());
        assert!(value.get("socketPath").is_some());
        assert!(value.get("heartbeatAt").is_some());
        assert!(value.get("ownerGeneration").is_some());
        assert!(value.get("queueDepth").is_some());
    }
}

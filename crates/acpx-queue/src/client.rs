//! Client side of the owner socket.
//!
//! One logical exchange per connection: write a single request line, read
//! `accepted`, then read stream messages until the terminal one. Connect
//! retries cover the window where a fresh owner has the lease but has not
//! bound its socket yet.

use std::io::ErrorKind;
use std::time::Duration;

use acpx_acp::process::pid_alive;
use acpx_core::{detail, ErrorOrigin, OutputError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::lease::QueueOwnerLease;
use crate::wire::{OwnerMessage, QueueRequest};

const CONNECT_ATTEMPTS: u32 = 40;
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// One connected exchange with the queue owner.
pub struct OwnerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl OwnerClient {
    /// Connect to the owner's socket, retrying briefly while the socket is
    /// missing or refusing and the owner pid still looks alive.
    pub async fn connect(lease: &QueueOwnerLease) -> Result<Self, OutputError> {
        let mut attempt = 0;
        loop {
            match UnixStream::connect(&lease.socket_path).await {
                Ok(stream) => {
                    let (read, write) = stream.into_split();
                    return Ok(Self {
                        reader: BufReader::new(read),
                        writer: write,
                    });
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::NotFound | ErrorKind::ConnectionRefused
                    ) && pid_alive(lease.pid)
                        && attempt < CONNECT_ATTEMPTS =>
                {
                    attempt += 1;
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
                Err(err) => {
                    return Err(OutputError::runtime(format!(
                        "queue owner socket unreachable: {err}"
                    ))
                    .with_origin(ErrorOrigin::Queue)
                    .with_detail(detail::QUEUE_NOT_ACCEPTING_REQUESTS));
                }
            }
        }
    }

    pub async fn send_request(&mut self, request: &QueueRequest) -> Result<(), OutputError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|err| OutputError::runtime(format!("encode queue request: {err}")))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|err| disconnected(err, detail::QUEUE_DISCONNECTED_BEFORE_ACK))?;
        self.writer
            .flush()
            .await
            .map_err(|err| disconnected(err, detail::QUEUE_DISCONNECTED_BEFORE_ACK))?;
        Ok(())
    }

    /// Next message, or `None` on a clean close.
    pub async fn read_message(&mut self) -> Result<Option<OwnerMessage>, OutputError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|err| disconnected(err, detail::QUEUE_OWNER_CLOSED))?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed).map(Some).map_err(|err| {
                OutputError::runtime(format!("invalid owner message: {err}"))
                    .with_origin(ErrorOrigin::Queue)
                    .with_detail(detail::QUEUE_PROTOCOL_INVALID_JSON)
            });
        }
    }

    /// Send one request and wait for `accepted`; any other first message is
    /// a protocol error (owner error messages are surfaced typed).
    pub async fn submit(&mut self, request: &QueueRequest) -> Result<(), OutputError> {
        self.send_request(request).await?;
        match self.read_message().await? {
            Some(OwnerMessage::Accepted { request_id })
                if request_id == request.request_id() =>
            {
                Ok(())
            }
            Some(other) => {
                if let Some(err) = crate::wire::error_from_message(&other) {
                    return Err(err);
                }
                Err(OutputError::runtime(format!(
                    "expected accepted, got {other:?}"
                ))
                .with_origin(ErrorOrigin::Queue))
            }
            None => Err(OutputError::runtime("queue owner closed before ack")
                .with_origin(ErrorOrigin::Queue)
                .with_detail(detail::QUEUE_DISCONNECTED_BEFORE_ACK)),
        }
    }
}

fn disconnected(err: std::io::Error, detail_code: &str) -> OutputError {
    OutputError::runtime(format!("queue owner connection lost: {err}"))
        .with_origin(ErrorOrigin::Queue)
        .with_detail(detail_code)
}

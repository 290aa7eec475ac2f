//! Session State and Request Correlation
//!
//! Status bookkeeping for one logical session, and the table of requests
//! waiting for an answer. Only the supervisor task touches a [`PendingTable`],
//! so settlement needs no locking: an entry is removed and completed in the
//! same step, which makes every request settle exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::network::signer::SignError;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No transport and nothing scheduled.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, handshake running.
    Authenticating,
    /// Authenticated; requests allowed.
    Connected,
    /// Handshake failed on the current transport.
    AuthFailed,
    /// Waiting for a scheduled reconnect.
    Reconnecting,
    /// Reconnect attempts exhausted; needs an explicit `connect()`.
    ReconnectFailed,
}

impl Status {
    /// Wire/log name.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Disconnected => "disconnected",
            Status::Connecting => "connecting",
            Status::Authenticating => "authenticating",
            Status::Connected => "connected",
            Status::AuthFailed => "auth_failed",
            Status::Reconnecting => "reconnecting",
            Status::ReconnectFailed => "reconnect_failed",
        }
    }

    /// A connection attempt is open or scheduled.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Status::Connecting | Status::Authenticating | Status::Reconnecting)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status transition, as broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// New status.
    pub status: Status,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    /// Stamp a status with the current time.
    pub fn now(status: Status) -> Self {
        Self { status, at: Utc::now() }
    }
}

/// Point-in-time view of the session, readable from any handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Current status.
    pub status: Status,
    /// Transport generation; bumps for every new socket.
    pub epoch: u64,
    /// Consecutive failed attempts since the last successful handshake.
    pub reconnect_attempts: u32,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: Status::Disconnected,
            epoch: 0,
            reconnect_attempts: 0,
        }
    }
}

/// Request-scoped errors. None of these change session status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Session is not authenticated.
    #[error("not connected")]
    NotConnected,
    /// No answer within the request timeout.
    #[error("request {id} ({method}) timed out after {after:?}")]
    Timeout {
        /// Request id.
        id: u64,
        /// Method name.
        method: String,
        /// Configured timeout.
        after: Duration,
    },
    /// The server answered with an error envelope.
    #[error("request rejected ({code}): {message}")]
    Rejected {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
    },
    /// `close()` was called while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,
    /// The transport dropped while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,
    /// The request could not be signed.
    #[error("signing failed: {0}")]
    Signing(#[from] SignError),
    /// The request could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),
    /// The response payload had an unexpected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Outcome delivered to a waiting caller.
pub type RequestOutcome = Result<Value, RequestError>;

/// A request waiting for its answer.
#[derive(Debug)]
pub struct PendingRequest {
    /// Request id.
    pub id: u64,
    /// Method name (for timeout errors and logs).
    pub method: String,
    /// When the request times out.
    pub deadline: Instant,
    /// Configured timeout.
    pub timeout: Duration,
    /// Completion.
    pub reply: oneshot::Sender<RequestOutcome>,
}

/// Outstanding requests of the current transport, keyed by id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: BTreeMap<u64, PendingRequest>,
}

impl PendingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request.
    pub fn insert(&mut self, request: PendingRequest) {
        self.entries.insert(request.id, request);
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No outstanding requests.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Is `id` outstanding.
    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove and complete one request. Returns false for unknown ids.
    pub fn settle(&mut self, id: u64, outcome: RequestOutcome) -> bool {
        match self.entries.remove(&id) {
            Some(request) => {
                // Caller may have stopped waiting; nothing to do then.
                let _ = request.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Earliest deadline among outstanding requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|r| r.deadline).min()
    }

    /// Settle every request whose deadline has passed. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .entries
            .values()
            .filter(|r| r.deadline <= now)
            .map(|r| r.id)
            .collect();

        for id in &expired {
            if let Some(request) = self.entries.remove(id) {
                let _ = request.reply.send(Err(RequestError::Timeout {
                    id: request.id,
                    method: request.method,
                    after: request.timeout,
                }));
            }
        }
        expired.len()
    }

    /// Settle everything with the same error. Returns how many.
    pub fn fail_all(&mut self, error: RequestError) -> usize {
        let entries = std::mem::take(&mut self.entries);
        let count = entries.len();
        for (_, request) in entries {
            let _ = request.reply.send(Err(error.clone()));
        }
        count
    }
}

//! Context proxy client: the host's service-client surface, usable from any
//! dispatcher thread, implemented by round-tripping calls over the context
//! request and response rings.
//!
//! Each acknowledged call registers a wait slot, pushes a [`ContextCall`],
//! and blocks until the demultiplexer delivers the matching
//! [`ContextResult`](crate::bridge::protocol::ContextResult), the call is
//! cancelled by shutdown, or the per-client timeout expires. The timeout
//! covers the whole call, including time spent waiting for room in a full
//! request ring.

mod wait_table;

pub use wait_table::WaitTable;

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::bridge::codec::{CodecError, WireCodec};
use crate::bridge::protocol::{ContextCall, CorrelationId, Object, Operation, Reply, Version};
use crate::ring::{RingError, RingProducer};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context client is stopped")]
    Stopped,

    #[error("context call cancelled by shutdown")]
    Cancelled,

    #[error("context call timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("too many outstanding context calls (limit {limit})")]
    Saturated { limit: usize },

    #[error("host rejected {op}: {reason}")]
    Remote { op: &'static str, reason: String },

    #[error("unexpected reply to {op}: {got}")]
    Unexpected { op: &'static str, got: &'static str },

    #[error("context channel error: {0}")]
    Ipc(#[from] RingError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ContextError {
    /// Whether the same call may succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Saturated { .. })
    }
}

/// Result of an acknowledged store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    pub version: Version,
    pub timestamp_us: u64,
}

/// Cloneable handle to the host service client.
#[derive(Clone)]
pub struct ContextClient {
    requests: Arc<RingProducer>,
    table: Arc<WaitTable>,
    codec: WireCodec<ContextCall>,
    timeout: Duration,
}

impl ContextClient {
    pub fn new(requests: Arc<RingProducer>, table: Arc<WaitTable>, timeout: Duration) -> Self {
        Self {
            requests,
            table,
            codec: WireCodec::new(),
            timeout,
        }
    }

    /// Copy of this client with a different call timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_stopped(&self) -> bool {
        self.table.is_closed()
    }

    pub(crate) fn wait_table(&self) -> &Arc<WaitTable> {
        &self.table
    }

    pub fn put(&self, object: Object) -> Result<Stored, ContextError> {
        match self.call(Operation::Put { object })? {
            Reply::Stored {
                version,
                timestamp_us,
            } => Ok(Stored {
                version,
                timestamp_us,
            }),
            other => Err(unexpected("put", &other)),
        }
    }

    /// Store without waiting for (or receiving) an acknowledgement.
    pub fn put_and_forget(&self, object: Object) -> Result<(), ContextError> {
        if self.is_stopped() {
            return Err(ContextError::Stopped);
        }
        let deadline = deadline_after(self.timeout);
        let call = ContextCall {
            id: self.table.next_id(),
            op: Operation::PutAndForget { object },
        };
        self.push(&self.codec.encode(&call)?, deadline)
    }

    /// Store and trigger downstream processing without persisting. The
    /// returned handle resolves when the host acknowledges.
    pub fn trigger_put(&self, object: Object) -> Result<TriggerPutHandle, ContextError> {
        let deadline = deadline_after(self.timeout);
        let pending = self.submit(Operation::TriggerPut { object }, deadline)?;
        Ok(TriggerPutHandle {
            pending,
            timeout: self.timeout,
        })
    }

    /// Fetch `key` at `version` ([`CURRENT_VERSION`](crate::bridge::protocol::CURRENT_VERSION)
    /// for the latest). `None` when the host has no such object.
    pub fn get(&self, key: impl Into<String>, version: Version) -> Result<Option<Object>, ContextError> {
        let op = Operation::Get {
            key: key.into(),
            version,
        };
        found_or_none("get", self.call(op)?)
    }

    pub fn get_by_time(
        &self,
        key: impl Into<String>,
        timestamp_us: u64,
    ) -> Result<Option<Object>, ContextError> {
        let op = Operation::GetByTime {
            key: key.into(),
            timestamp_us,
        };
        found_or_none("get_by_time", self.call(op)?)
    }

    pub fn get_size(&self, key: impl Into<String>, version: Version) -> Result<u64, ContextError> {
        let op = Operation::GetSize {
            key: key.into(),
            version,
        };
        match self.call(op)? {
            Reply::Size(size) => Ok(size),
            other => Err(unexpected("get_size", &other)),
        }
    }

    pub fn remove(&self, key: impl Into<String>) -> Result<Stored, ContextError> {
        match self.call(Operation::Remove { key: key.into() })? {
            Reply::Stored {
                version,
                timestamp_us,
            } => Ok(Stored {
                version,
                timestamp_us,
            }),
            other => Err(unexpected("remove", &other)),
        }
    }

    pub fn list_keys(
        &self,
        object_pool: impl Into<String>,
        version: Version,
    ) -> Result<Vec<String>, ContextError> {
        let op = Operation::ListKeys {
            object_pool: object_pool.into(),
            version,
        };
        match self.call(op)? {
            Reply::Keys(keys) => Ok(keys),
            other => Err(unexpected("list_keys", &other)),
        }
    }

    fn call(&self, op: Operation) -> Result<Reply, ContextError> {
        let deadline = deadline_after(self.timeout);
        self.submit(op, deadline)?.wait(deadline, self.timeout)
    }

    fn submit(&self, op: Operation, deadline: Instant) -> Result<PendingReply, ContextError> {
        let kind = op.kind();
        let (id, rx) = self.table.register()?;
        let pending = PendingReply {
            id,
            kind,
            rx,
            table: Arc::clone(&self.table),
            settled: false,
        };

        let bytes = self.codec.encode(&ContextCall { id, op })?;
        self.push(&bytes, deadline)?;
        tracing::trace!(id = %id, op = kind, "Context call sent");
        Ok(pending)
    }

    fn push(&self, bytes: &[u8], deadline: Instant) -> Result<(), ContextError> {
        match self.requests.push_until(bytes, deadline) {
            Ok(()) => Ok(()),
            Err(RingError::TimedOut) => {
                tracing::debug!(timeout = ?self.timeout, "Context request ring stayed full");
                Err(ContextError::Timeout {
                    after: self.timeout,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A registered call waiting for its reply. Dropping it abandons the slot.
struct PendingReply {
    id: CorrelationId,
    kind: &'static str,
    rx: Receiver<Reply>,
    table: Arc<WaitTable>,
    settled: bool,
}

impl PendingReply {
    /// Wait until `deadline`; `budget` is the whole call's timeout, reported
    /// on expiry.
    fn wait(mut self, deadline: Instant, budget: Duration) -> Result<Reply, ContextError> {
        let left = deadline.saturating_duration_since(Instant::now());
        let outcome = self.rx.recv_timeout(left);
        self.settled = true;
        match outcome {
            Ok(Reply::Cancelled) => Err(ContextError::Cancelled),
            Ok(Reply::Failed { reason }) => Err(ContextError::Remote {
                op: self.kind,
                reason,
            }),
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.table.abandon(self.id);
                tracing::debug!(id = %self.id, op = self.kind, timeout = ?budget, "Context call timed out");
                Err(ContextError::Timeout { after: budget })
            }
            // Slot removed without a reply: only happens on teardown.
            Err(RecvTimeoutError::Disconnected) => Err(ContextError::Cancelled),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.settled {
            self.table.abandon(self.id);
        }
    }
}

/// Pending acknowledgement of a [`ContextClient::trigger_put`].
pub struct TriggerPutHandle {
    pending: PendingReply,
    timeout: Duration,
}

impl TriggerPutHandle {
    pub fn id(&self) -> CorrelationId {
        self.pending.id
    }

    /// Block until acknowledged, using the client's timeout.
    pub fn wait(self) -> Result<(), ContextError> {
        let timeout = self.timeout;
        self.wait_timeout(timeout)
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<(), ContextError> {
        match self.pending.wait(deadline_after(timeout), timeout)? {
            Reply::Triggered => Ok(()),
            other => Err(unexpected("trigger_put", &other)),
        }
    }
}

/// `timeout` from now, capped so absurd timeouts cannot overflow.
fn deadline_after(timeout: Duration) -> Instant {
    const HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 3600);
    let now = Instant::now();
    now.checked_add(timeout.min(HORIZON)).unwrap_or(now)
}

fn found_or_none(op: &'static str, reply: Reply) -> Result<Option<Object>, ContextError> {
    match reply {
        Reply::Found(object) => Ok(Some(object)),
        Reply::NotFound => Ok(None),
        other => Err(unexpected(op, &other)),
    }
}

fn unexpected(op: &'static str, reply: &Reply) -> ContextError {
    ContextError::Unexpected {
        op,
        got: reply.kind(),
    }
}

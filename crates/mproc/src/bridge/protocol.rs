//! Wire protocol types for host-worker communication.
//!
//! Three rings:
//! - **Commit** (host → worker): [`InvocationRequest`]
//! - **Context request** (worker threads → host): [`ContextCall`]
//! - **Context response** (host → worker): [`ContextResult`]
//!
//! Payloads are bincode, which is not self-describing: no
//! internally tagged enums, no skipped fields, no `serde_json::Value`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Object version as assigned by the host store.
pub type Version = i64;

/// Version placeholder meaning "latest" / "not assigned yet".
pub const CURRENT_VERSION: Version = -1;

/// Identifier pairing a context call with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A keyed, versioned value as stored by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub key: String,
    pub version: Version,
    pub timestamp_us: u64,
    pub message_id: u64,
    pub blob: Vec<u8>,
}

impl Object {
    pub fn new(key: impl Into<String>, blob: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            version: CURRENT_VERSION,
            timestamp_us: 0,
            message_id: 0,
            blob: blob.into(),
        }
    }

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = message_id;
        self
    }
}

/// One committed object routed to the UDL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub key: String,
    /// Length of the object-pool prefix of `key`.
    pub prefix_length: u32,
    pub version: Version,
    /// Encoded [`Object`].
    pub value: Vec<u8>,
    /// Destination key prefix → trigger-on-put.
    pub outputs: BTreeMap<String, bool>,
    pub worker_id: u32,
}

/// Operation proxied to the host service client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put { object: Object },
    PutAndForget { object: Object },
    TriggerPut { object: Object },
    Get { key: String, version: Version },
    GetByTime { key: String, timestamp_us: u64 },
    GetSize { key: String, version: Version },
    Remove { key: String },
    ListKeys { object_pool: String, version: Version },
    /// Worker-side warning/error shipped to the host log.
    Diagnostic {
        level: String,
        target: String,
        message: String,
        /// Diagnostics dropped under backpressure since the previous one.
        dropped: u64,
    },
}

impl Operation {
    /// Whether the host answers this operation with a [`ContextResult`].
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Self::PutAndForget { .. } | Self::Diagnostic { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::PutAndForget { .. } => "put_and_forget",
            Self::TriggerPut { .. } => "trigger_put",
            Self::Get { .. } => "get",
            Self::GetByTime { .. } => "get_by_time",
            Self::GetSize { .. } => "get_size",
            Self::Remove { .. } => "remove",
            Self::ListKeys { .. } => "list_keys",
            Self::Diagnostic { .. } => "diagnostic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextCall {
    pub id: CorrelationId,
    pub op: Operation,
}

/// Host answer to a [`ContextCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Stored { version: Version, timestamp_us: u64 },
    Triggered,
    Found(Object),
    NotFound,
    Size(u64),
    Keys(Vec<String>),
    Failed { reason: String },
    /// Synthesized worker-side when the call is abandoned at shutdown.
    Cancelled,
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stored { .. } => "stored",
            Self::Triggered => "triggered",
            Self::Found(_) => "found",
            Self::NotFound => "not_found",
            Self::Size(_) => "size",
            Self::Keys(_) => "keys",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextResult {
    pub id: CorrelationId,
    pub reply: Reply,
}

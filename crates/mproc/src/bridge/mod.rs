//! IPC bridge for host-worker communication.
//!
//! # Architecture
//!
//! - **protocol**: Message types (InvocationRequest, ContextCall, ContextResult)
//! - **codec**: bincode payload codec; framing is done by the ring

pub mod codec;
pub mod protocol;

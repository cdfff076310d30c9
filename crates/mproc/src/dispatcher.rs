//! Upcall dispatcher: a fixed pool of OS threads draining the commit ring.
//!
//! Each thread holds at most one request at a time. Callback errors and
//! panics are contained to the invocation that raised them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use serde::Serialize;

use crate::bridge::codec::{CodecError, WireCodec};
use crate::bridge::protocol::{InvocationRequest, Object};
use crate::context::ContextClient;
use crate::lifecycle::ServerEvent;
use crate::ring::{RingConsumer, RingError};
use crate::upcall::{Invocation, Upcall};

#[derive(Debug, Default)]
pub struct DispatcherStats {
    invocations: AtomicU64,
    failures: AtomicU64,
    panics: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests handed to the upcall.
    pub invocations: u64,
    /// Invocations that returned an error or panicked.
    pub failures: u64,
    pub panics: u64,
    /// Requests that could not be decoded.
    pub malformed: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Everything a dispatcher thread needs.
pub(crate) struct DispatchContext {
    pub commit: Arc<RingConsumer>,
    pub upcall: Arc<dyn Upcall>,
    pub client: ContextClient,
    pub stop: Arc<AtomicBool>,
    pub stats: Arc<DispatcherStats>,
    pub events: Sender<ServerEvent>,
}

pub(crate) fn spawn_pool(
    ctx: Arc<DispatchContext>,
    num_threads: usize,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..num_threads)
        .map(|index| {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name(format!("mproc-dispatch-{index}"))
                .spawn(move || run(&ctx, index))
        })
        .collect()
}

fn run(ctx: &DispatchContext, index: usize) {
    let codec = WireCodec::<InvocationRequest>::new();
    let object_codec = WireCodec::<Object>::new();
    tracing::debug!(thread = index, "Dispatcher started");

    while !ctx.stop.load(Ordering::Acquire) {
        let bytes = match ctx.commit.pop() {
            Ok(bytes) => bytes,
            Err(RingError::Closed) => break,
            Err(e) => {
                tracing::error!(thread = index, error = %e, "Commit channel failed");
                let _ = ctx.events.send(ServerEvent::Fatal {
                    error: e.to_string(),
                });
                break;
            }
        };

        let invocation = match decode(&codec, &object_codec, &bytes, index) {
            Ok(invocation) => invocation,
            Err(e) => {
                ctx.stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(thread = index, error = %e, "Skipping malformed invocation request");
                continue;
            }
        };
        dispatch(ctx, invocation);
    }

    tracing::debug!(thread = index, "Dispatcher exiting");
    let _ = ctx.events.send(ServerEvent::DispatcherExited { index });
}

fn decode(
    codec: &WireCodec<InvocationRequest>,
    object_codec: &WireCodec<Object>,
    bytes: &[u8],
    thread_index: usize,
) -> Result<Invocation, CodecError> {
    let request = codec.decode(bytes)?;
    let value = object_codec.decode(&request.value)?;
    Ok(Invocation {
        key: request.key,
        prefix_length: request.prefix_length as usize,
        version: request.version,
        value,
        outputs: request.outputs,
        worker_id: request.worker_id,
        thread_index,
    })
}

fn dispatch(ctx: &DispatchContext, invocation: Invocation) {
    let key = invocation.key.clone();
    let thread = invocation.thread_index;
    ctx.stats.invocations.fetch_add(1, Ordering::Relaxed);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        ctx.upcall.invoke(invocation, &ctx.client)
    }));
    match outcome {
        Ok(Ok(())) => {
            tracing::trace!(thread, key = %key, "Invocation complete");
        }
        Ok(Err(e)) => {
            ctx.stats.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(thread, key = %key, error = %format!("{e:#}"), "Upcall failed");
        }
        Err(payload) => {
            ctx.stats.failures.fetch_add(1, Ordering::Relaxed);
            ctx.stats.panics.fetch_add(1, Ordering::Relaxed);
            tracing::error!(thread, key = %key, panic = panic_message(&*payload), "Upcall panicked");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

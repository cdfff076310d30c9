//! Worker diagnostics shipped to the host.
//!
//! [`WorkerTracingLayer`] captures WARN and ERROR events into a bounded
//! queue; the server's forwarder thread turns them into
//! [`Operation::Diagnostic`] calls on the context request ring, where the
//! host re-emits them in its own log. Events that do not fit the queue are
//! counted and reported with the next one that does.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::thread::{self, JoinHandle};

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::codec::WireCodec;
use crate::bridge::protocol::{ContextCall, Operation};
use crate::context::WaitTable;
use crate::ring::{RingError, RingProducer};

/// Targets whose events are never forwarded (the forwarding path itself).
const LOCAL_ONLY_TARGETS: &[&str] = &["mproc::ring", "mproc::diagnostics"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: String,
    pub target: String,
    pub message: String,
}

enum Message {
    Event(Diagnostic),
    Shutdown,
}

#[derive(Clone)]
pub struct DiagnosticSink {
    tx: SyncSender<Message>,
    dropped: Arc<AtomicU64>,
}

pub struct DiagnosticStream {
    rx: Receiver<Message>,
    tx: SyncSender<Message>,
    dropped: Arc<AtomicU64>,
}

pub fn diagnostic_channel(capacity: usize) -> (DiagnosticSink, DiagnosticStream) {
    let (tx, rx) = sync_channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        DiagnosticSink {
            tx: tx.clone(),
            dropped: Arc::clone(&dropped),
        },
        DiagnosticStream { rx, tx, dropped },
    )
}

impl DiagnosticSink {
    /// Queue a diagnostic without blocking.
    pub fn emit(&self, diagnostic: Diagnostic) {
        match self.tx.try_send(Message::Event(diagnostic)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // Forwarder gone: the server has stopped.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl DiagnosticStream {
    /// Next queued diagnostic with the drop count accumulated since the
    /// previous one, or `None` once shut down.
    pub fn recv(&self) -> Option<(Diagnostic, u64)> {
        match self.rx.recv().ok()? {
            Message::Event(diagnostic) => {
                Some((diagnostic, self.dropped.swap(0, Ordering::Relaxed)))
            }
            Message::Shutdown => None,
        }
    }

    fn shutdown_handle(&self) -> SyncSender<Message> {
        self.tx.clone()
    }
}

/// Forwarder thread plus the handle that stops it.
pub(crate) struct Forwarder {
    thread: JoinHandle<()>,
    shutdown: SyncSender<Message>,
}

impl Forwarder {
    pub(crate) fn spawn(
        stream: DiagnosticStream,
        requests: Arc<RingProducer>,
        table: Arc<WaitTable>,
    ) -> std::io::Result<Self> {
        let shutdown = stream.shutdown_handle();
        let thread = thread::Builder::new()
            .name("mproc-diagnostics".to_string())
            .spawn(move || forward(&stream, &requests, &table))?;
        Ok(Self { thread, shutdown })
    }

    pub(crate) fn stop(self) {
        // Fails only if the forwarder already exited.
        let _ = self.shutdown.send(Message::Shutdown);
        if self.thread.join().is_err() {
            tracing::error!("Diagnostics forwarder panicked");
        }
    }
}

fn forward(stream: &DiagnosticStream, requests: &RingProducer, table: &WaitTable) {
    let codec = WireCodec::<ContextCall>::new();
    while let Some((diagnostic, dropped)) = stream.recv() {
        let call = ContextCall {
            id: table.next_id(),
            op: Operation::Diagnostic {
                level: diagnostic.level,
                target: diagnostic.target,
                message: diagnostic.message,
                dropped,
            },
        };
        let bytes = match codec.encode(&call) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to encode diagnostic");
                continue;
            }
        };
        match requests.push(&bytes) {
            Ok(()) => {}
            Err(RingError::Closed) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to forward diagnostic");
            }
        }
    }
}

/// Tracing layer that queues WARN and ERROR events for the host.
pub struct WorkerTracingLayer {
    sink: DiagnosticSink,
}

impl WorkerTracingLayer {
    pub fn new(sink: DiagnosticSink) -> Self {
        Self { sink }
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level ordering: ERROR < WARN < INFO.
        if *metadata.level() > Level::WARN {
            return;
        }
        let target = metadata.target();
        if LOCAL_ONLY_TARGETS.iter().any(|t| target.starts_with(t)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink.emit(Diagnostic {
            level: Self::level_to_string(metadata.level()).to_string(),
            target: target.to_string(),
            message: visitor.finish(),
        });
    }
}

/// Collects the message plus any structured fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

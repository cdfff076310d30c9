//! Worker-side process manager.
//!
//! [`UdlServer`] owns the configuration, the resolved upcall and the three
//! attached channels. [`UdlServer::run`] starts the dispatcher pool, the
//! response demultiplexer and (optionally) the diagnostics forwarder, then
//! supervises them until one of:
//!
//! - the host closes the commit channel and every queued request has been
//!   dispatched (drained),
//! - a stop is requested through a [`Stopper`] or the host closes the
//!   response channel,
//! - a channel fails (fatal).
//!
//! Teardown cancels outstanding context calls, lets in-flight invocations
//! finish, joins every thread and releases the channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::channels::WorkerChannels;
use crate::config::{ConfigError, ServerConfig};
use crate::context::{ContextClient, WaitTable};
use crate::demux;
use crate::diagnostics::{DiagnosticStream, Forwarder};
use crate::dispatcher::{self, DispatchContext, DispatcherStats, StatsSnapshot};
use crate::lifecycle::{Lifecycle, ServerEvent, ServerState};
use crate::ring::RingError;
use crate::upcall::{ResolveError, UdlRegistry, Upcall};

/// Exit code for a server that failed to start.
pub const EXIT_STARTUP_FAILURE: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to attach channels: {0}")]
    Channel(#[from] RingError),

    #[error("failed to spawn server thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Host closed the commit channel and the queue drained.
    Drained,
    Requested { reason: String },
    Fatal { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub reason: StopReason,
    pub stats: StatsSnapshot,
    /// Context calls cancelled by teardown.
    pub cancelled_calls: usize,
}

impl StopReport {
    pub fn is_orderly(&self) -> bool {
        !matches!(self.reason, StopReason::Fatal { .. })
    }

    /// 0 for an orderly stop, 1 after a fatal channel error.
    pub fn exit_code(&self) -> u8 {
        if self.is_orderly() { 0 } else { 1 }
    }
}

/// Requests an orderly stop. Cheap to clone; usable from signal handlers'
/// async tasks and other threads.
#[derive(Clone)]
pub struct Stopper {
    events: Sender<ServerEvent>,
}

impl Stopper {
    pub fn stop(&self, reason: impl Into<String>) {
        // The supervisor is gone once the server has stopped.
        let _ = self.events.send(ServerEvent::StopRequested {
            reason: reason.into(),
        });
    }
}

pub struct UdlServer {
    config: ServerConfig,
    upcall: Arc<dyn Upcall>,
    channels: WorkerChannels,
    diagnostics: Option<DiagnosticStream>,
    lifecycle: Arc<Lifecycle>,
}

impl UdlServer {
    /// Validate `config`, resolve its UDL from `registry` and attach to the
    /// host's channels.
    pub fn new(config: ServerConfig, registry: &UdlRegistry) -> Result<Self, ServerError> {
        config.validate()?;
        let upcall = registry.resolve(&config)?;
        let channels = WorkerChannels::open(&config.channels)?;
        tracing::info!(
            udl_id = %config.udl_id,
            object_pool = %config.object_pool_path,
            num_threads = config.num_threads,
            "UDL server created"
        );
        Self::with_channels(config, upcall, channels)
    }

    /// Build over already-attached channels.
    pub fn with_channels(
        config: ServerConfig,
        upcall: Arc<dyn Upcall>,
        channels: WorkerChannels,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            config,
            upcall,
            channels,
            diagnostics: None,
            lifecycle: Arc::new(Lifecycle::new()),
        })
    }

    /// Forward queued worker diagnostics to the host while running.
    pub fn with_diagnostics(mut self, stream: DiagnosticStream) -> Self {
        self.diagnostics = Some(stream);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.current()
    }

    /// Start serving. With `wait`, supervise on this thread and return a
    /// handle to the already stopped server; otherwise supervise on a
    /// background thread.
    pub fn run(self, wait: bool) -> Result<ServerHandle, ServerError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let (running, events) = self.start()?;
        let stopper = running.stopper();
        let stats = Arc::clone(&running.stats);

        let supervision = if wait {
            Supervision::Done(running.supervise(events))
        } else {
            let thread = thread::Builder::new()
                .name("mproc-supervisor".to_string())
                .spawn(move || running.supervise(events))?;
            Supervision::Thread(thread)
        };

        Ok(ServerHandle {
            lifecycle,
            stopper,
            stats,
            supervision,
        })
    }

    fn start(self) -> Result<(Running, Receiver<ServerEvent>), ServerError> {
        let (events_tx, events_rx) = mpsc::channel();
        let table = Arc::new(WaitTable::new(self.config.outstanding_call_limit()));
        let client = ContextClient::new(
            Arc::clone(&self.channels.requests),
            Arc::clone(&table),
            self.config.context_call_timeout(),
        );
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(DispatcherStats::default());

        let mut running = Running {
            lifecycle: self.lifecycle,
            channels: self.channels,
            table,
            stop,
            stats,
            events: events_tx,
            dispatchers: Vec::new(),
            demux: None,
            forwarder: None,
            num_threads: self.config.num_threads,
        };

        if let Err(e) = running.spawn_threads(self.upcall, client, self.diagnostics) {
            tracing::error!(error = %e, "Failed to start UDL server threads");
            running.teardown();
            running.lifecycle.transition(ServerState::Stopped);
            return Err(e);
        }

        running.lifecycle.transition(ServerState::Running);
        tracing::info!(
            udl_id = %self.config.udl_id,
            num_threads = self.config.num_threads,
            "UDL server running"
        );
        Ok((running, events_rx))
    }
}

/// Live threads and shared state of a started server.
struct Running {
    lifecycle: Arc<Lifecycle>,
    channels: WorkerChannels,
    table: Arc<WaitTable>,
    stop: Arc<AtomicBool>,
    stats: Arc<DispatcherStats>,
    events: Sender<ServerEvent>,
    dispatchers: Vec<JoinHandle<()>>,
    demux: Option<JoinHandle<()>>,
    forwarder: Option<Forwarder>,
    num_threads: usize,
}

impl Running {
    fn stopper(&self) -> Stopper {
        Stopper {
            events: self.events.clone(),
        }
    }

    fn spawn_threads(
        &mut self,
        upcall: Arc<dyn Upcall>,
        client: ContextClient,
        diagnostics: Option<DiagnosticStream>,
    ) -> Result<(), ServerError> {
        if let Some(stream) = diagnostics {
            self.forwarder = Some(Forwarder::spawn(
                stream,
                Arc::clone(&self.channels.requests),
                Arc::clone(&self.table),
            )?);
        }

        self.demux = Some(demux::spawn(
            Arc::clone(&self.channels.responses),
            Arc::clone(&self.table),
            self.events.clone(),
        )?);

        let ctx = Arc::new(DispatchContext {
            commit: Arc::clone(&self.channels.commit),
            upcall,
            client,
            stop: Arc::clone(&self.stop),
            stats: Arc::clone(&self.stats),
            events: self.events.clone(),
        });
        self.dispatchers = dispatcher::spawn_pool(ctx, self.num_threads)?;
        Ok(())
    }

    fn supervise(mut self, events: Receiver<ServerEvent>) -> StopReport {
        let mut live = self.num_threads;
        let reason = loop {
            // `self.events` keeps the channel open, so recv only fails if
            // every sender vanished, which cannot happen here.
            let Ok(event) = events.recv() else {
                break StopReason::Fatal {
                    error: "supervisor event channel closed".to_string(),
                };
            };
            match event {
                ServerEvent::DispatcherExited { index } => {
                    live = live.saturating_sub(1);
                    tracing::debug!(thread = index, live, "Dispatcher exited");
                    if live == 0 {
                        tracing::info!("Commit channel drained");
                        break StopReason::Drained;
                    }
                }
                ServerEvent::StopRequested { reason } => {
                    tracing::info!(reason = %reason, "Stop requested");
                    break StopReason::Requested { reason };
                }
                ServerEvent::Fatal { error } => {
                    tracing::error!(error = %error, "Fatal channel error, stopping");
                    break StopReason::Fatal { error };
                }
            }
        };

        self.lifecycle.transition(ServerState::Stopping);
        let cancelled_calls = self.teardown();
        self.lifecycle.transition(ServerState::Stopped);

        let report = StopReport {
            reason,
            stats: self.stats.snapshot(),
            cancelled_calls,
        };
        tracing::info!(
            reason = ?report.reason,
            invocations = report.stats.invocations,
            failures = report.stats.failures,
            cancelled_calls,
            "UDL server stopped"
        );
        report
    }

    /// Stop every thread and release the channels. Returns the number of
    /// context calls cancelled.
    fn teardown(&mut self) -> usize {
        self.stop.store(true, Ordering::Release);
        let cancelled = self.table.close_and_cancel();
        self.channels.close_all();

        for (index, thread) in self.dispatchers.drain(..).enumerate() {
            if thread.join().is_err() {
                tracing::error!(thread = index, "Dispatcher thread panicked");
            }
        }
        if let Some(demux) = self.demux.take()
            && demux.join().is_err()
        {
            tracing::error!("Response demultiplexer panicked");
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.stop();
        }
        cancelled
    }
}

enum Supervision {
    Thread(JoinHandle<StopReport>),
    Done(StopReport),
}

/// Handle to a started server.
pub struct ServerHandle {
    lifecycle: Arc<Lifecycle>,
    stopper: Stopper,
    stats: Arc<DispatcherStats>,
    supervision: Supervision,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        self.lifecycle.current()
    }

    /// Block until the server reaches at least `state`.
    pub fn wait_for(&self, state: ServerState) -> ServerState {
        self.lifecycle.wait_for(state)
    }

    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop("stop requested");
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the server to stop and return its report.
    pub fn join(self) -> StopReport {
        match self.supervision {
            Supervision::Done(report) => report,
            Supervision::Thread(thread) => thread.join().unwrap_or_else(|_| {
                tracing::error!("Server supervisor panicked");
                self.lifecycle.transition(ServerState::Stopped);
                StopReport {
                    reason: StopReason::Fatal {
                        error: "supervisor panicked".to_string(),
                    },
                    stats: self.stats.snapshot(),
                    cancelled_calls: 0,
                }
            }),
        }
    }
}

/// Construct a server for `config` and run it.
///
/// With `wait` the call returns once the server has stopped; otherwise it
/// returns as soon as the server is running.
pub fn run_server(
    config: ServerConfig,
    registry: &UdlRegistry,
    wait: bool,
) -> Result<ServerHandle, ServerError> {
    UdlServer::new(config, registry)?.run(wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::WireCodec;
    use crate::bridge::protocol::{
        ContextCall, ContextResult, InvocationRequest, Object, Operation, Reply,
    };
    use crate::channels::{self, HostChannels};
    use crate::config::ChannelIds;
    use crate::context::ContextError;
    use crate::upcall::upcall_fn;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn config(num_threads: usize) -> ServerConfig {
        ServerConfig::new("/frames/", "test", ChannelIds::generate(64 * 1024))
            .with_num_threads(num_threads)
            .with_edge("/out/", false)
    }

    fn commit(host: &HostChannels, key: &str) {
        let value = WireCodec::new().encode(&Object::new(key, b"v".to_vec())).unwrap();
        let request = InvocationRequest {
            key: key.to_string(),
            prefix_length: 8,
            version: 1,
            value,
            outputs: [("/out/".to_string(), false)].into_iter().collect::<BTreeMap<_, _>>(),
            worker_id: 0,
        };
        host.commit.push(&WireCodec::new().encode(&request).unwrap()).unwrap();
    }

    fn next_call(host: &HostChannels) -> ContextCall {
        WireCodec::new().decode(&host.requests.pop().unwrap()).unwrap()
    }

    #[test]
    fn host_close_drains_queue_and_exits_orderly() {
        let (host, worker) = channels::loopback(64 * 1024).unwrap();
        let upcall = upcall_fn(|inv, ctx| {
            ctx.put_and_forget(Object::new(format!("/out/{}", inv.suffix()), inv.value.blob))?;
            Ok(())
        });
        let server = UdlServer::with_channels(config(3), Arc::new(upcall), worker).unwrap();
        assert_eq!(server.state(), ServerState::Created);

        for i in 0..20 {
            commit(&host, &format!("/frames/{i}"));
        }
        host.commit.close();

        let report = server.run(true).unwrap().join();
        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.stats.invocations, 20);

        let mut keys: Vec<String> = (0..20)
            .map(|_| match next_call(&host).op {
                Operation::PutAndForget { object } => object.key,
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        keys.sort();
        let mut expected: Vec<String> = (0..20).map(|i| format!("/out/{i}")).collect();
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn every_request_is_forwarded_once_across_threads() {
        let (host, worker) = channels::loopback(64 * 1024).unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let upcall = {
            let calls = Arc::clone(&calls);
            upcall_fn(move |inv, ctx| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(inv.outputs.get("/out/"), Some(&false));
                ctx.put_and_forget(Object::new(inv.key, inv.value.blob))?;
                Ok(())
            })
        };
        let server = UdlServer::with_channels(config(4), Arc::new(upcall), worker).unwrap();

        let total = 100;
        for i in 0..total {
            let key = format!("frame/{i}");
            let value = WireCodec::new().encode(&Object::new(key.clone(), vec![i as u8])).unwrap();
            let request = InvocationRequest {
                key,
                prefix_length: 0,
                version: i as i64,
                value,
                outputs: [("/out/".to_string(), false)].into_iter().collect(),
                worker_id: 0,
            };
            host.commit.push(&WireCodec::new().encode(&request).unwrap()).unwrap();
        }
        host.commit.close();

        let report = server.run(true).unwrap().join();
        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(report.stats.invocations, total as u64);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), total);

        let mut keys = std::collections::BTreeSet::new();
        for _ in 0..total {
            match next_call(&host).op {
                Operation::PutAndForget { object } => assert!(keys.insert(object.key)),
                other => panic!("unexpected op {other:?}"),
            }
        }
        let expected: std::collections::BTreeSet<String> =
            (0..total).map(|i| format!("frame/{i}")).collect();
        assert_eq!(keys, expected);
        // Nothing beyond the forwarded frames, and the worker closed its end.
        assert!(matches!(host.requests.try_pop(), Err(RingError::Closed)));
    }

    #[test]
    fn requested_stop_cancels_outstanding_calls() {
        let (host, worker) = channels::loopback(64 * 1024).unwrap();
        let (results_tx, results_rx) = mpsc::channel();
        let results_tx = std::sync::Mutex::new(results_tx);
        let upcall = upcall_fn(move |inv, ctx| {
            let outcome = ctx.put(Object::new(format!("/out/{}", inv.suffix()), vec![]));
            results_tx.lock().unwrap().send(outcome.map(|_| ())).unwrap();
            Ok(())
        });
        let config = config(3).with_context_call_timeout(Duration::from_secs(60));
        let handle = UdlServer::with_channels(config, Arc::new(upcall), worker)
            .unwrap()
            .run(false)
            .unwrap();
        handle.wait_for(ServerState::Running);

        for i in 0..3 {
            commit(&host, &format!("/frames/{i}"));
        }
        // All three calls are registered once they are on the ring.
        for _ in 0..3 {
            next_call(&host);
        }

        handle.stop();
        let report = handle.join();
        assert_eq!(
            report.reason,
            StopReason::Requested {
                reason: "stop requested".to_string()
            }
        );
        assert_eq!(report.cancelled_calls, 3);
        assert_eq!(report.exit_code(), 0);

        for _ in 0..3 {
            assert!(matches!(
                results_rx.recv().unwrap(),
                Err(ContextError::Cancelled)
            ));
        }
    }

    #[test]
    fn replies_reach_the_right_thread() {
        let (host, worker) = channels::loopback(64 * 1024).unwrap();
        let (versions_tx, versions_rx) = mpsc::channel();
        let versions_tx = std::sync::Mutex::new(versions_tx);
        let upcall = upcall_fn(move |inv, ctx| {
            let stored = ctx.put(Object::new(inv.key.clone(), vec![]))?;
            versions_tx.lock().unwrap().send((inv.key, stored.version)).unwrap();
            Ok(())
        });
        let handle = UdlServer::with_channels(config(4), Arc::new(upcall), worker)
            .unwrap()
            .run(false)
            .unwrap();

        let total = 40;
        for i in 0..total {
            commit(&host, &format!("/frames/{i}"));
        }
        // Answer each put with a version derived from its key, in arrival order.
        for _ in 0..total {
            let call = next_call(&host);
            let Operation::Put { object } = call.op else {
                panic!("expected put");
            };
            let n: i64 = object.key.rsplit('/').next().unwrap().parse().unwrap();
            let result = ContextResult {
                id: call.id,
                reply: Reply::Stored {
                    version: n * 10,
                    timestamp_us: 0,
                },
            };
            host.responses.push(&WireCodec::new().encode(&result).unwrap()).unwrap();
        }

        for _ in 0..total {
            let (key, version) = versions_rx.recv().unwrap();
            let n: i64 = key.rsplit('/').next().unwrap().parse().unwrap();
            assert_eq!(version, n * 10);
        }

        host.commit.close();
        let report = handle.join();
        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(report.stats.failures, 0);
    }

    #[test]
    fn unanswered_put_times_out_and_thread_continues() {
        let (host, worker) = channels::loopback(64 * 1024).unwrap();
        let (outcome_tx, outcome_rx) = mpsc::channel();
        let outcome_tx = std::sync::Mutex::new(outcome_tx);
        let upcall = upcall_fn(move |inv, ctx| {
            // Only the first call gets a short deadline.
            let ctx = if inv.suffix() == "0" {
                ctx.with_timeout(Duration::from_millis(100))
            } else {
                ctx.clone()
            };
            let outcome = ctx.put(Object::new(format!("/out/{}", inv.suffix()), vec![]));
            outcome_tx.lock().unwrap().send(outcome.map(|_| ())).unwrap();
            ctx.put_and_forget(Object::new("/out/after-timeout", vec![]))?;
            Ok(())
        });
        let config = config(1).with_context_call_timeout(Duration::from_secs(60));
        let handle = UdlServer::with_channels(config, Arc::new(upcall), worker)
            .unwrap()
            .run(false)
            .unwrap();

        commit(&host, "/frames/0");
        let put = next_call(&host);
        assert!(matches!(put.op, Operation::Put { .. }));
        assert!(matches!(
            outcome_rx.recv().unwrap(),
            Err(ContextError::Timeout { .. })
        ));
        assert!(matches!(
            next_call(&host).op,
            Operation::PutAndForget { object } if object.key == "/out/after-timeout"
        ));

        // The late reply is dropped and the server keeps going.
        let late = ContextResult {
            id: put.id,
            reply: Reply::Stored {
                version: 1,
                timestamp_us: 0,
            },
        };
        host.responses.push(&WireCodec::new().encode(&late).unwrap()).unwrap();
        commit(&host, "/frames/1");
        assert!(matches!(next_call(&host).op, Operation::Put { .. }));

        handle.stop();
        let report = handle.join();
        assert_eq!(report.stats.invocations, 2);
        assert_eq!(report.cancelled_calls, 1);
        // The second invocation's follow-up store is rejected after stop.
        assert_eq!(report.stats.failures, 1);
        assert!(matches!(
            outcome_rx.recv().unwrap(),
            Err(ContextError::Cancelled)
        ));
    }

    #[test]
    fn corrupt_commit_frame_is_fatal() {
        let (host, worker) = channels::loopback(4096).unwrap();
        let handle = UdlServer::with_channels(
            config(2),
            Arc::new(upcall_fn(|_inv, _ctx| Ok(()))),
            worker,
        )
        .unwrap()
        .run(false)
        .unwrap();
        handle.wait_for(ServerState::Running);

        host.commit.ring().inject_raw(&u32::MAX.to_le_bytes());
        let report = handle.join();
        assert!(matches!(report.reason, StopReason::Fatal { .. }));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn host_closing_responses_requests_stop() {
        let (host, worker) = channels::loopback(4096).unwrap();
        let handle = UdlServer::with_channels(
            config(1),
            Arc::new(upcall_fn(|_inv, _ctx| Ok(()))),
            worker,
        )
        .unwrap()
        .run(false)
        .unwrap();

        host.responses.close();
        let report = handle.join();
        assert!(matches!(report.reason, StopReason::Requested { .. }));
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn invalid_config_fails_before_start() {
        let (_host, worker) = channels::loopback(4096).unwrap();
        let result = UdlServer::with_channels(
            config(0),
            Arc::new(upcall_fn(|_inv, _ctx| Ok(()))),
            worker,
        );
        assert!(matches!(
            result,
            Err(ServerError::Config(ConfigError::InvalidThreadCount { .. }))
        ));
    }

    #[test]
    fn run_server_rejects_unknown_udl() {
        let registry = UdlRegistry::new();
        let result = run_server(config(1), &registry, true);
        assert!(matches!(
            result,
            Err(ServerError::Resolve(ResolveError::Config(ConfigError::UnknownUdl(_))))
        ));
    }
}

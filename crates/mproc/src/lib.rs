//! mproc: out-of-process UDL server.
//!
//! User-defined logic runs in a worker process. The host commits objects
//! over a shared-memory ring; worker threads call back into the host's
//! service client through a second pair of rings.

pub mod bridge;
pub mod channels;
pub mod config;
pub mod context;
mod demux;
pub mod diagnostics;
mod dispatcher;
pub mod host;
mod lifecycle;
pub mod resource;
pub mod ring;
pub mod server;
pub mod service;
pub mod upcall;

pub use bridge::protocol::{CURRENT_VERSION, CorrelationId, Object, Version};
pub use channels::{HostChannels, WorkerChannels};
pub use config::{
    CONFIG_ENV, ChannelIds, ChannelSpec, ConfigError, ExecutionEnvironment, ServerConfig,
    Statefulness,
};
pub use context::{ContextClient, ContextError, Stored, TriggerPutHandle};
pub use diagnostics::{DiagnosticSink, DiagnosticStream, WorkerTracingLayer, diagnostic_channel};
pub use dispatcher::{DispatcherStats, StatsSnapshot};
pub use host::{ContextServer, HostError, ProcessSpawner, SpawnError, WorkerExit, WorkerManager, WorkerSpawner};
pub use lifecycle::{Lifecycle, ServerState};
pub use resource::ResourceCache;
pub use server::{
    EXIT_STARTUP_FAILURE, ServerError, ServerHandle, StopReason, StopReport, Stopper, UdlServer,
    run_server,
};
pub use service::{InMemoryServiceClient, ServiceClient, ServiceError};
pub use upcall::{Invocation, ResolveError, UdlRegistry, Upcall, upcall_fn};

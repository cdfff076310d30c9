//! Host side: spawning the worker, serving its context calls, feeding the
//! commit channel and reaping it.
//!
//! Flow:
//! 1. Create the three named channels
//! 2. Start the context server against the host's [`ServiceClient`]
//! 3. Spawn the worker with the configuration in its environment
//! 4. Submit committed objects
//! 5. Shut down: close the commit channel (or signal), reap, unlink

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::runtime::Handle;

use crate::bridge::codec::{CodecError, WireCodec};
use crate::bridge::protocol::{
    ContextCall, ContextResult, InvocationRequest, Object, Operation, Reply,
};
use crate::channels::HostChannels;
use crate::config::{CONFIG_ENV, ConfigError, ServerConfig};
use crate::lifecycle::{Lifecycle, ServerState};
use crate::ring::{RingConsumer, RingError, RingProducer};
use crate::service::{ServiceClient, execute};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to encode worker configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &ServerConfig) -> Result<Child, SpawnError>;
}

/// Runs a worker executable with the configuration in [`CONFIG_ENV`].
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, config: &ServerConfig) -> Result<Child, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&config.app_cwd)
            .env(CONFIG_ENV, config.to_json()?)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(target_os = "linux")]
        terminate_with_parent(&mut command);

        let child = command.spawn()?;
        tracing::info!(
            program = %self.program.display(),
            pid = ?child.id(),
            udl_id = %config.udl_id,
            "Spawned worker"
        );
        Ok(child)
    }
}

/// Have the kernel send SIGTERM to the worker if the host dies.
#[cfg(target_os = "linux")]
fn terminate_with_parent(command: &mut Command) {
    // SAFETY: prctl is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)
                .map_err(std::io::Error::from)
        });
    }
}

/// Drains the context request channel and answers each call from the
/// host's service client. Calls are executed in arrival order.
pub struct ContextServer {
    thread: JoinHandle<()>,
}

impl ContextServer {
    pub fn spawn(
        channels: &HostChannels,
        client: Arc<dyn ServiceClient>,
        runtime: Handle,
    ) -> std::io::Result<Self> {
        let requests = Arc::clone(&channels.requests);
        let responses = Arc::clone(&channels.responses);
        let thread = thread::Builder::new()
            .name("mproc-context-server".to_string())
            .spawn(move || serve(&requests, &responses, client.as_ref(), &runtime))?;
        Ok(Self { thread })
    }

    /// Wait for the server to finish; it stops once the request channel is
    /// closed and drained.
    pub fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!("Context server panicked");
        }
    }
}

fn serve(
    requests: &RingConsumer,
    responses: &RingProducer,
    client: &dyn ServiceClient,
    runtime: &Handle,
) {
    let call_codec = WireCodec::<ContextCall>::new();
    let result_codec = WireCodec::<ContextResult>::new();
    let mut served: u64 = 0;

    loop {
        let bytes = match requests.pop() {
            Ok(bytes) => bytes,
            Err(RingError::Closed) => break,
            Err(e) => {
                tracing::error!(error = %e, "Context request channel failed");
                responses.close();
                break;
            }
        };
        let call = match call_codec.decode(&bytes) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable context call");
                continue;
            }
        };

        if let Operation::Diagnostic {
            level,
            target,
            message,
            dropped,
        } = &call.op
        {
            emit_worker_diagnostic(level, target, message, *dropped);
            continue;
        }

        let id = call.id;
        served += 1;
        let Some(reply) = runtime.block_on(execute(client, call.op)) else {
            continue;
        };
        let bytes = match result_codec.encode(&ContextResult { id, reply }) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(id = %id, error = %e, "Failed to encode context result");
                continue;
            }
        };
        match responses.push(&bytes) {
            Ok(()) => {}
            Err(RingError::Closed) => break,
            Err(RingError::FrameTooLarge { len, capacity }) => {
                tracing::error!(id = %id, len, capacity, "Context result too large for channel");
                // Fail the call instead of leaving the caller to time out.
                let reply = Reply::Failed {
                    reason: format!("reply of {len} bytes exceeds response channel capacity {capacity}"),
                };
                let pushed = result_codec
                    .encode(&ContextResult { id, reply })
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| responses.push(&bytes).map_err(|e| e.to_string()));
                if let Err(e) = pushed {
                    tracing::error!(id = %id, error = %e, "Failed to report oversized context result");
                }
            }
            Err(e) => {
                tracing::error!(id = %id, error = %e, "Context response channel failed");
                break;
            }
        }
    }
    tracing::debug!(served, "Context server stopped");
}

fn emit_worker_diagnostic(level: &str, target: &str, message: &str, dropped: u64) {
    match level {
        "error" => tracing::error!(target: "mproc::worker", worker_target = %target, "{message}"),
        _ => tracing::warn!(target: "mproc::worker", worker_target = %target, "{message}"),
    }
    if dropped > 0 {
        tracing::warn!(
            target: "mproc::worker",
            dropped,
            "Worker diagnostics dropped under backpressure"
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("channel error: {0}")]
    Channel(#[from] RingError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("host thread error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker manager is stopping")]
    Stopping,
}

/// How a worker ended.
#[derive(Debug, Clone, Copy)]
pub struct WorkerExit {
    pub status: ExitStatus,
    /// The worker exited by itself within the grace period.
    pub orderly: bool,
}

impl WorkerExit {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Owns one worker process and its channels.
pub struct WorkerManager {
    config: ServerConfig,
    channels: HostChannels,
    child: Child,
    context: Option<ContextServer>,
    lifecycle: Arc<Lifecycle>,
    codec: WireCodec<InvocationRequest>,
    object_codec: WireCodec<Object>,
    worker_id: u32,
}

impl WorkerManager {
    /// Create the channels, start serving context calls with `client` and
    /// spawn the worker.
    pub async fn start(
        config: ServerConfig,
        spawner: &dyn WorkerSpawner,
        client: Arc<dyn ServiceClient>,
    ) -> Result<Self, HostError> {
        config.validate()?;
        let lifecycle = Arc::new(Lifecycle::new());

        tracing::info!(udl_id = %config.udl_id, commit = %config.channels.commit.id, "Creating worker channels");
        let channels = HostChannels::create(&config.channels)?;
        let context = ContextServer::spawn(&channels, client, Handle::current())?;

        let child = match spawner.spawn(&config) {
            Ok(child) => child,
            Err(e) => {
                channels.close_all();
                join_context(context).await;
                lifecycle.transition(ServerState::Stopped);
                return Err(e.into());
            }
        };
        lifecycle.transition(ServerState::Running);

        Ok(Self {
            config,
            channels,
            child,
            context: Some(context),
            lifecycle,
            codec: WireCodec::new(),
            object_codec: WireCodec::new(),
            worker_id: 0,
        })
    }

    /// Tag placed on every submitted request.
    pub fn with_worker_id(mut self, worker_id: u32) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.current()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the worker has already exited.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>, HostError> {
        Ok(self.child.try_wait()?)
    }

    fn encode_request(&self, object: &Object) -> Result<Vec<u8>, HostError> {
        if self.lifecycle.current() >= ServerState::Stopping {
            return Err(HostError::Stopping);
        }
        let pool = self.config.object_pool_path.as_str();
        let prefix_length = if object.key.starts_with(pool) { pool.len() } else { 0 };
        let request = InvocationRequest {
            key: object.key.clone(),
            prefix_length: prefix_length as u32,
            version: object.version,
            value: self.object_codec.encode(object)?,
            outputs: self.config.edges.clone(),
            worker_id: self.worker_id,
        };
        Ok(self.codec.encode(&request)?)
    }

    /// Queue a committed object for the worker, blocking while the commit
    /// channel is full.
    pub fn submit_blocking(&self, object: &Object) -> Result<(), HostError> {
        let bytes = self.encode_request(object)?;
        self.channels.commit.push(&bytes)?;
        Ok(())
    }

    pub async fn submit(&self, object: &Object) -> Result<(), HostError> {
        let bytes = self.encode_request(object)?;
        let commit = Arc::clone(&self.channels.commit);
        tokio::task::spawn_blocking(move || commit.push(&bytes))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    /// Close the commit channel so the worker drains its queue and exits.
    /// After `grace` it is sent SIGTERM, and after another `grace` killed.
    pub async fn shutdown(self, grace: Duration) -> Result<WorkerExit, HostError> {
        self.lifecycle.transition(ServerState::Stopping);
        tracing::info!(pid = ?self.pid(), "Closing commit channel");
        self.channels.commit.close();
        self.reap(grace, true).await
    }

    /// Send SIGTERM right away; kill after `grace`.
    pub async fn terminate(self, grace: Duration) -> Result<WorkerExit, HostError> {
        self.lifecycle.transition(ServerState::Stopping);
        self.signal_term();
        self.reap(grace, false).await
    }

    fn signal_term(&self) {
        let Some(pid) = self.pid() else {
            return;
        };
        tracing::info!(pid, "Sending SIGTERM to worker");
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            tracing::warn!(pid = %pid, error = %e, "Failed to signal worker");
        }
    }

    async fn reap(mut self, grace: Duration, graceful: bool) -> Result<WorkerExit, HostError> {
        let mut orderly = graceful;
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                orderly = false;
                let escalated = if graceful {
                    tracing::warn!(?grace, "Worker did not exit after commit close");
                    self.signal_term();
                    tokio::time::timeout(grace, self.child.wait()).await.ok()
                } else {
                    None
                };
                match escalated {
                    Some(status) => status?,
                    None => {
                        tracing::warn!(pid = ?self.pid(), "Killing worker");
                        self.child.kill().await?;
                        self.child.wait().await?
                    }
                }
            }
        };

        self.channels.close_all();
        if let Some(context) = self.context.take() {
            join_context(context).await;
        }
        self.lifecycle.transition(ServerState::Stopped);
        tracing::info!(?status, orderly, "Worker reaped");
        // Dropping the channels unlinks the named segments.
        Ok(WorkerExit { status, orderly })
    }
}

async fn join_context(context: ContextServer) {
    if tokio::task::spawn_blocking(move || context.join()).await.is_err() {
        tracing::error!("Failed to join context server");
    }
}

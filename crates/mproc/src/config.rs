//! Server configuration bundle.
//!
//! Built once by the host, handed to the worker as JSON in
//! [`CONFIG_ENV`], validated at construction and immutable afterwards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ring::MIN_CAPACITY;

/// Environment variable carrying the JSON configuration to the worker.
pub const CONFIG_ENV: &str = "MPROC_SERVER_CONFIG";

const DEFAULT_CHANNEL_CAPACITY: usize = 1 << 20;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const OUTSTANDING_CALLS_PER_THREAD: usize = 8;

/// Where the UDL vertex executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEnvironment {
    /// Inside the host process. Not valid for an out-of-process server.
    Pthread,
    Process,
    Docker,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statefulness {
    Stateful,
    #[default]
    Stateless,
    /// The UDL must only ever run on one thread.
    SingleThreaded,
}

/// One ring: shared-memory identifier plus data capacity in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: String,
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

impl ChannelSpec {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity,
        }
    }
}

/// The three rings a server attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIds {
    pub commit: ChannelSpec,
    pub context_request: ChannelSpec,
    pub context_response: ChannelSpec,
}

impl ChannelIds {
    /// Fresh, collision-free identifiers for one worker.
    pub fn generate(capacity: usize) -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self {
            commit: ChannelSpec::new(format!("mproc-{tag}-commit"), capacity),
            context_request: ChannelSpec::new(format!("mproc-{tag}-ctxreq"), capacity),
            context_response: ChannelSpec::new(format!("mproc-{tag}-ctxres"), capacity),
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&'static str, &ChannelSpec)> {
        [
            ("commit", &self.commit),
            ("context_request", &self.context_request),
            ("context_response", &self.context_response),
        ]
        .into_iter()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("execution environment {0:?} cannot host an out-of-process UDL server")]
    InvalidExecutionEnvironment(ExecutionEnvironment),

    #[error("invalid thread count {num_threads}: {reason}")]
    InvalidThreadCount {
        num_threads: usize,
        reason: &'static str,
    },

    #[error("invalid object pool path '{0}': must start with '/'")]
    InvalidObjectPool(String),

    #[error("invalid {channel} channel: {reason}")]
    InvalidChannel {
        channel: &'static str,
        reason: String,
    },

    #[error("context_call_timeout_ms must be positive")]
    InvalidCallTimeout,

    #[error("unknown UDL id: {0}")]
    UnknownUdl(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Read(#[from] std::io::Error),

    #[error("{CONFIG_ENV} is not set")]
    MissingEnv,
}

fn default_app_cwd() -> PathBuf {
    PathBuf::from(".")
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Working directory of the worker process.
    #[serde(default = "default_app_cwd")]
    pub app_cwd: PathBuf,
    pub object_pool_path: String,
    pub udl_id: String,
    #[serde(default)]
    pub udl_conf: serde_json::Value,
    pub exe_env: ExecutionEnvironment,
    #[serde(default)]
    pub exe_env_conf: serde_json::Value,
    #[serde(default)]
    pub statefulness: Statefulness,
    pub num_threads: usize,
    /// Destination key prefix → trigger-on-put.
    #[serde(default)]
    pub edges: BTreeMap<String, bool>,
    pub channels: ChannelIds,
    #[serde(default = "default_call_timeout_ms")]
    pub context_call_timeout_ms: u64,
    /// Bound on registered wait slots; defaults to 8 per dispatcher thread.
    #[serde(default)]
    pub max_outstanding_calls: Option<usize>,
}

impl ServerConfig {
    pub fn new(
        object_pool_path: impl Into<String>,
        udl_id: impl Into<String>,
        channels: ChannelIds,
    ) -> Self {
        Self {
            app_cwd: default_app_cwd(),
            object_pool_path: object_pool_path.into(),
            udl_id: udl_id.into(),
            udl_conf: serde_json::Value::Null,
            exe_env: ExecutionEnvironment::Process,
            exe_env_conf: serde_json::Value::Null,
            statefulness: Statefulness::default(),
            num_threads: 1,
            edges: BTreeMap::new(),
            channels,
            context_call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            max_outstanding_calls: None,
        }
    }

    pub fn with_app_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.app_cwd = cwd.into();
        self
    }

    pub fn with_udl_conf(mut self, conf: serde_json::Value) -> Self {
        self.udl_conf = conf;
        self
    }

    pub fn with_exe_env(mut self, exe_env: ExecutionEnvironment, conf: serde_json::Value) -> Self {
        self.exe_env = exe_env;
        self.exe_env_conf = conf;
        self
    }

    pub fn with_statefulness(mut self, statefulness: Statefulness) -> Self {
        self.statefulness = statefulness;
        self
    }

    pub fn with_num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn with_edge(mut self, destination: impl Into<String>, trigger_on_put: bool) -> Self {
        self.edges.insert(destination.into(), trigger_on_put);
        self
    }

    pub fn with_context_call_timeout(mut self, timeout: Duration) -> Self {
        self.context_call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_outstanding_calls(mut self, n: usize) -> Self {
        self.max_outstanding_calls = Some(n);
        self
    }

    pub fn context_call_timeout(&self) -> Duration {
        Duration::from_millis(self.context_call_timeout_ms)
    }

    pub fn outstanding_call_limit(&self) -> usize {
        self.max_outstanding_calls
            .unwrap_or(self.num_threads * OUTSTANDING_CALLS_PER_THREAD)
            .max(1)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Read the configuration the host placed in [`CONFIG_ENV`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let json = std::env::var(CONFIG_ENV).map_err(|_| ConfigError::MissingEnv)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.udl_id.trim().is_empty() {
            return Err(ConfigError::MissingField("udl_id"));
        }
        if self.object_pool_path.is_empty() {
            return Err(ConfigError::MissingField("object_pool_path"));
        }
        if !self.object_pool_path.starts_with('/') {
            return Err(ConfigError::InvalidObjectPool(self.object_pool_path.clone()));
        }
        if self.exe_env == ExecutionEnvironment::Pthread {
            return Err(ConfigError::InvalidExecutionEnvironment(self.exe_env));
        }
        if self.num_threads == 0 {
            return Err(ConfigError::InvalidThreadCount {
                num_threads: 0,
                reason: "at least one dispatcher thread is required",
            });
        }
        if self.statefulness == Statefulness::SingleThreaded && self.num_threads != 1 {
            return Err(ConfigError::InvalidThreadCount {
                num_threads: self.num_threads,
                reason: "a single-threaded UDL needs exactly one dispatcher thread",
            });
        }
        if self.context_call_timeout_ms == 0 {
            return Err(ConfigError::InvalidCallTimeout);
        }

        let mut seen = Vec::with_capacity(3);
        for (channel, spec) in self.channels.iter() {
            if spec.id.trim_matches('/').is_empty() {
                return Err(ConfigError::InvalidChannel {
                    channel,
                    reason: "empty id".to_string(),
                });
            }
            if spec.capacity < MIN_CAPACITY {
                return Err(ConfigError::InvalidChannel {
                    channel,
                    reason: format!("capacity {} below minimum {MIN_CAPACITY}", spec.capacity),
                });
            }
            if seen.contains(&spec.id.as_str()) {
                return Err(ConfigError::InvalidChannel {
                    channel,
                    reason: format!("id '{}' is used by another channel", spec.id),
                });
            }
            seen.push(spec.id.as_str());
        }
        Ok(())
    }
}

//! Callback surface for user-defined logic.
//!
//! A UDL is an [`Upcall`] resolved by id from a [`UdlRegistry`] of
//! factories. The factory runs once per server with the full
//! [`ServerConfig`]; the resulting upcall is shared by every dispatcher
//! thread.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::bridge::protocol::{Object, Version};
use crate::config::{ConfigError, ServerConfig};
use crate::context::ContextClient;

/// One committed object handed to the UDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub key: String,
    pub prefix_length: usize,
    pub version: Version,
    pub value: Object,
    /// Destination key prefix → trigger-on-put.
    pub outputs: BTreeMap<String, bool>,
    pub worker_id: u32,
    /// Index of the dispatcher thread running this invocation.
    pub thread_index: usize,
}

impl Invocation {
    /// Part of the key after the object-pool prefix.
    pub fn suffix(&self) -> &str {
        self.key.get(self.prefix_length..).unwrap_or("")
    }

    /// Object pool the key was committed under.
    pub fn object_pool(&self) -> &str {
        self.key.get(..self.prefix_length).unwrap_or(&self.key)
    }
}

pub trait Upcall: Send + Sync {
    fn invoke(&self, invocation: Invocation, context: &ContextClient) -> anyhow::Result<()>;
}

impl<F> Upcall for F
where
    F: Fn(Invocation, &ContextClient) -> anyhow::Result<()> + Send + Sync,
{
    fn invoke(&self, invocation: Invocation, context: &ContextClient) -> anyhow::Result<()> {
        self(invocation, context)
    }
}

/// Pins a closure to the [`Upcall`] signature so its argument lifetimes
/// infer correctly.
pub fn upcall_fn<F>(f: F) -> F
where
    F: Fn(Invocation, &ContextClient) -> anyhow::Result<()> + Send + Sync,
{
    f
}

type UdlFactory = dyn Fn(&ServerConfig) -> anyhow::Result<Arc<dyn Upcall>> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to initialize UDL {udl_id}: {source:#}")]
    Init {
        udl_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// UDL id → factory.
#[derive(Default, Clone)]
pub struct UdlRegistry {
    factories: HashMap<String, Arc<UdlFactory>>,
}

impl UdlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, udl_id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ServerConfig) -> anyhow::Result<Arc<dyn Upcall>> + Send + Sync + 'static,
    {
        self.factories.insert(udl_id.into(), Arc::new(factory));
        self
    }

    pub fn with<F>(mut self, udl_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServerConfig) -> anyhow::Result<Arc<dyn Upcall>> + Send + Sync + 'static,
    {
        self.register(udl_id, factory);
        self
    }

    pub fn contains(&self, udl_id: &str) -> bool {
        self.factories.contains_key(udl_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the upcall named by `config.udl_id`.
    pub fn resolve(&self, config: &ServerConfig) -> Result<Arc<dyn Upcall>, ResolveError> {
        let factory = self
            .factories
            .get(&config.udl_id)
            .ok_or_else(|| ConfigError::UnknownUdl(config.udl_id.clone()))?;
        factory(config).map_err(|source| ResolveError::Init {
            udl_id: config.udl_id.clone(),
            source,
        })
    }
}

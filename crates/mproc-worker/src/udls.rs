//! UDLs built into the worker binary.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use mproc::{
    ContextClient, Invocation, Object, ResourceCache, ServerConfig, UdlRegistry, Upcall,
};
use serde::Deserialize;

/// Frame filter: forwards frames whose score is below the threshold to
/// every output edge.
pub const FILTER_UDL_ID: &str = "22b86c6e-9d92-11eb-81d0-0242ac110002";

pub fn registry() -> UdlRegistry {
    UdlRegistry::new().with(FILTER_UDL_ID, |config: &ServerConfig| {
        Ok(Arc::new(FrameFilter::from_config(config)?) as Arc<dyn Upcall>)
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FilterConf {
    /// Frames scoring at or above this are dropped.
    threshold: f32,
    /// Frames shorter than this are dropped.
    min_bytes: usize,
}

impl Default for FilterConf {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            min_bytes: 0,
        }
    }
}

/// Per-thread scoring state.
struct Scorer {
    conf: FilterConf,
    scored: AtomicU64,
}

impl Scorer {
    /// Mean byte intensity in `[0, 1]`.
    fn score(&self, blob: &[u8]) -> f32 {
        self.scored.fetch_add(1, Ordering::Relaxed);
        if blob.is_empty() {
            return 0.0;
        }
        let sum: u64 = blob.iter().map(|&b| u64::from(b)).sum();
        sum as f32 / (blob.len() as f32 * 255.0)
    }

    fn accepts(&self, blob: &[u8]) -> bool {
        blob.len() >= self.conf.min_bytes && self.score(blob) < self.conf.threshold
    }
}

struct FrameFilter {
    conf: FilterConf,
    scorers: ResourceCache<Scorer>,
}

impl FrameFilter {
    fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let conf = if config.udl_conf.is_null() {
            FilterConf::default()
        } else {
            FilterConf::deserialize(&config.udl_conf).context("invalid filter configuration")?
        };
        tracing::info!(threshold = conf.threshold, min_bytes = conf.min_bytes, "Frame filter configured");
        Ok(Self {
            conf,
            scorers: ResourceCache::new(),
        })
    }
}

impl Upcall for FrameFilter {
    fn invoke(&self, invocation: Invocation, context: &ContextClient) -> anyhow::Result<()> {
        let scorer = self.scorers.get_or_try_init(|| {
            Ok::<_, anyhow::Error>(Scorer {
                conf: self.conf.clone(),
                scored: AtomicU64::new(0),
            })
        })?;
        if !scorer.accepts(&invocation.value.blob) {
            tracing::trace!(
                key = %invocation.key,
                scored_on_thread = scorer.scored.load(Ordering::Relaxed),
                "Frame filtered out"
            );
            return Ok(());
        }

        let suffix = invocation.suffix();
        for (destination, trigger) in &invocation.outputs {
            let object = Object::new(format!("{destination}{suffix}"), invocation.value.blob.clone())
                .with_message_id(invocation.value.message_id);
            if *trigger {
                context
                    .trigger_put(object)?
                    .wait()
                    .with_context(|| format!("trigger_put to {destination}"))?;
            } else {
                context.put_and_forget(object)?;
            }
        }
        Ok(())
    }
}

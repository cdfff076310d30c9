//! Payload codec for ring frames.
//!
//! The ring adds the `[u32 length]` framing; this codec only turns protocol
//! values into payload bytes and back, with bincode. Both processes come from
//! one build, so no cross-version compatibility is attempted.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to decode {what} ({len} bytes): {source}")]
    Decode {
        what: &'static str,
        len: usize,
        #[source]
        source: bincode::Error,
    },
}

/// Codec for one protocol type.
pub struct WireCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for WireCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for WireCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> WireCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }

    fn what() -> &'static str {
        let name = std::any::type_name::<T>();
        name.rsplit("::").next().unwrap_or(name)
    }
}

impl<T: Serialize> WireCodec<T> {
    pub fn encode(&self, item: &T) -> Result<Vec<u8>, CodecError> {
        let bytes = bincode::serialize(item).map_err(|source| CodecError::Encode {
            what: Self::what(),
            source,
        })?;
        // Not forwarded as a diagnostic: the forwarder itself encodes frames.
        tracing::trace!(size_bytes = bytes.len(), what = Self::what(), "Encoded frame");
        Ok(bytes)
    }
}

impl<T: DeserializeOwned> WireCodec<T> {
    pub fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|source| CodecError::Decode {
            what: Self::what(),
            len: bytes.len(),
            source,
        })
    }
}

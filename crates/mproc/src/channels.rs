//! The three rings between a host and one worker, seen from either side.

use std::sync::Arc;

use crate::config::{ChannelIds, ChannelSpec};
use crate::ring::{Ring, RingConsumer, RingError, RingProducer};

/// Worker-side endpoints.
#[derive(Clone)]
pub struct WorkerChannels {
    pub commit: Arc<RingConsumer>,
    pub requests: Arc<RingProducer>,
    pub responses: Arc<RingConsumer>,
}

/// Host-side endpoints. The host creates (and owns) the named segments.
#[derive(Clone)]
pub struct HostChannels {
    pub commit: Arc<RingProducer>,
    pub requests: Arc<RingConsumer>,
    pub responses: Arc<RingProducer>,
}

impl WorkerChannels {
    /// Attach to the rings the host created.
    pub fn open(ids: &ChannelIds) -> Result<Self, RingError> {
        let open = |spec: &ChannelSpec| Ring::open(&spec.id, spec.capacity);
        Ok(Self {
            commit: Arc::new(RingConsumer::new(open(&ids.commit)?)),
            requests: Arc::new(RingProducer::new(open(&ids.context_request)?)),
            responses: Arc::new(RingConsumer::new(open(&ids.context_response)?)),
        })
    }

    /// Close every ring; blocked operations on both sides wake up.
    pub fn close_all(&self) {
        self.commit.close();
        self.requests.close();
        self.responses.close();
    }
}

impl HostChannels {
    pub fn create(ids: &ChannelIds) -> Result<Self, RingError> {
        let commit = Ring::create(&ids.commit.id, ids.commit.capacity)?;
        let requests = Ring::create(&ids.context_request.id, ids.context_request.capacity)?;
        let responses = Ring::create(&ids.context_response.id, ids.context_response.capacity)?;
        Ok(Self {
            commit: Arc::new(RingProducer::new(commit)),
            requests: Arc::new(RingConsumer::new(requests)),
            responses: Arc::new(RingProducer::new(responses)),
        })
    }

    pub fn close_all(&self) {
        self.commit.close();
        self.requests.close();
        self.responses.close();
    }
}

/// Connected host and worker endpoints over anonymous rings, for running
/// both sides in one process.
pub fn loopback(capacity: usize) -> Result<(HostChannels, WorkerChannels), RingError> {
    let commit = Ring::anonymous(capacity)?;
    let requests = Ring::anonymous(capacity)?;
    let responses = Ring::anonymous(capacity)?;

    let host = HostChannels {
        commit: Arc::new(RingProducer::new(Arc::clone(&commit))),
        requests: Arc::new(RingConsumer::new(Arc::clone(&requests))),
        responses: Arc::new(RingProducer::new(Arc::clone(&responses))),
    };
    let worker = WorkerChannels {
        commit: Arc::new(RingConsumer::new(commit)),
        requests: Arc::new(RingProducer::new(requests)),
        responses: Arc::new(RingConsumer::new(responses)),
    };
    Ok((host, worker))
}

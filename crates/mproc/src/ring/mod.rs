//! Byte-framed ring channels over memory shared by two processes.
//!
//! A ring is a header followed by a circular data area. Frames are
//! `[u32 little-endian length][payload]` and may wrap around the end of the
//! data area. `head` and `tail` are monotonic byte counters: the consumer
//! owns `head`, the producer owns `tail`, and each publishes with release
//! ordering after touching the bytes it covers.
//!
//! Endpoints:
//! - [`RingProducer`]: pushes frames. Concurrent producers in one process are
//!   arbitrated by a producer-side lock, so frames never interleave.
//! - [`RingConsumer`]: pops frames. Concurrent consumers in one process are
//!   arbitrated the same way, so each frame is delivered exactly once.
//!
//! Closing (from either side) wakes every blocked operation. Frames pushed
//! before the close are still delivered; after that `pop` reports
//! [`RingError::Closed`].

mod doorbell;
mod segment;

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use segment::Segment;

const MAGIC: u64 = 0x6d70_726f_635f_7231;
const FRAME_HEADER: usize = 4;
const WAIT_SLICE: Duration = Duration::from_millis(50);
/// Poll interval while another producer thread holds the ring.
const LOCK_SLICE: Duration = Duration::from_millis(1);

/// Smallest data area a ring accepts.
pub const MIN_CAPACITY: usize = 64;

#[repr(C, align(64))]
struct CacheLine<T>(T);

#[repr(C)]
struct Header {
    magic: AtomicU64,
    capacity: AtomicU64,
    closed: AtomicU32,
    /// Bumped after every publish of `tail` (and on close).
    readable: AtomicU32,
    /// Bumped after every publish of `head` (and on close).
    writable: AtomicU32,
    head: CacheLine<AtomicU64>,
    tail: CacheLine<AtomicU64>,
}

const DATA_OFFSET: usize = std::mem::size_of::<Header>().next_multiple_of(64);

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("channel closed")]
    Closed,

    #[error("channel full")]
    Full,

    #[error("channel still full at the deadline")]
    TimedOut,

    #[error("frame of {len} bytes does not fit a channel of {capacity} bytes")]
    FrameTooLarge { len: usize, capacity: u64 },

    #[error("corrupt frame in channel {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("shared segment {id} unavailable: {source}")]
    Unavailable {
        id: String,
        #[source]
        source: nix::Error,
    },

    #[error("shared segment {id} rejected: {reason}")]
    Mismatch { id: String, reason: String },

    #[error("invalid channel capacity {capacity} (minimum {min})")]
    InvalidCapacity { capacity: usize, min: usize },
}

impl RingError {
    /// Errors after which the channel can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Corrupt { .. } | Self::Unavailable { .. } | Self::Mismatch { .. }
        )
    }
}

/// How a push behaves while the ring is full.
#[derive(Debug, Clone, Copy)]
enum Wait {
    Never,
    Forever,
    Until(Instant),
}

impl Wait {
    /// Length of the next sleep, or `None` once the deadline has passed.
    fn slice(self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::Forever => Some(WAIT_SLICE),
            Self::Until(deadline) => deadline
                .checked_duration_since(Instant::now())
                .filter(|left| !left.is_zero())
                .map(|left| left.min(WAIT_SLICE)),
        }
    }
}

/// A ring mapped into this process.
pub struct Ring {
    id: String,
    segment: Segment,
    capacity: u64,
}

impl Ring {
    /// Create and initialize a named ring. The creator owns the name and
    /// unlinks it when the last handle drops.
    pub fn create(id: &str, capacity: usize) -> Result<Arc<Self>, RingError> {
        check_capacity(capacity)?;
        let name = shm_name(id);
        let segment = Segment::create(&name, DATA_OFFSET + capacity).map_err(|source| {
            RingError::Unavailable {
                id: name.clone(),
                source,
            }
        })?;
        Ok(Arc::new(Self::initialize(name, segment, capacity)))
    }

    /// Attach to a ring created by the peer process.
    pub fn open(id: &str, capacity: usize) -> Result<Arc<Self>, RingError> {
        check_capacity(capacity)?;
        let name = shm_name(id);
        let segment = Segment::open(&name, DATA_OFFSET + capacity).map_err(|source| {
            RingError::Unavailable {
                id: name.clone(),
                source,
            }
        })?;

        let ring = Self {
            id: name,
            segment,
            capacity: capacity as u64,
        };
        let header = ring.header();
        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(RingError::Mismatch {
                id: ring.id.clone(),
                reason: "segment is not an initialized ring".to_string(),
            });
        }
        let actual = header.capacity.load(Ordering::Relaxed);
        if actual != ring.capacity {
            return Err(RingError::Mismatch {
                id: ring.id.clone(),
                reason: format!("capacity is {actual}, expected {capacity}"),
            });
        }
        tracing::debug!(id = %ring.id, capacity, "Attached to ring");
        Ok(Arc::new(ring))
    }

    /// Ring over an anonymous shared mapping (same process, or inherited by fork).
    pub fn anonymous(capacity: usize) -> Result<Arc<Self>, RingError> {
        check_capacity(capacity)?;
        let segment =
            Segment::anonymous(DATA_OFFSET + capacity).map_err(|source| RingError::Unavailable {
                id: "anonymous".to_string(),
                source,
            })?;
        Ok(Arc::new(Self::initialize(
            "anonymous".to_string(),
            segment,
            capacity,
        )))
    }

    fn initialize(id: String, segment: Segment, capacity: usize) -> Self {
        debug_assert!(segment.len() >= DATA_OFFSET + capacity);
        let ring = Self {
            id,
            segment,
            capacity: capacity as u64,
        };
        // Fresh mappings are zero-filled: cursors, flags and sequences start at 0.
        let header = ring.header();
        header.capacity.store(ring.capacity, Ordering::Relaxed);
        header.magic.store(MAGIC, Ordering::Release);
        tracing::debug!(id = %ring.id, capacity, "Initialized ring");
        ring
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Bytes currently queued, frame headers included.
    pub fn pending_bytes(&self) -> usize {
        let header = self.header();
        let tail = header.tail.0.load(Ordering::Acquire);
        let head = header.head.0.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    pub fn close(&self) {
        let header = self.header();
        if header.closed.swap(1, Ordering::AcqRel) == 0 {
            tracing::debug!(id = %self.id, "Closing ring");
        }
        header.readable.fetch_add(1, Ordering::Release);
        header.writable.fetch_add(1, Ordering::Release);
        doorbell::wake_all(&header.readable);
        doorbell::wake_all(&header.writable);
    }

    fn header(&self) -> &Header {
        // SAFETY: the segment starts with a `Header`-sized, page-aligned region
        // that lives as long as `self`; all fields are atomics.
        unsafe { &*(self.segment.as_ptr() as *const Header) }
    }

    fn data(&self) -> *mut u8 {
        // SAFETY: DATA_OFFSET + capacity is within the mapping.
        unsafe { self.segment.as_ptr().add(DATA_OFFSET) }
    }

    fn write_at(&self, pos: u64, src: &[u8]) {
        let cap = self.capacity as usize;
        let start = (pos % self.capacity) as usize;
        let first = src.len().min(cap - start);
        // SAFETY: callers only write into space the consumer has released, and
        // both copies stay within the data area.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(start), first);
            ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data(), src.len() - first);
        }
    }

    fn read_at(&self, pos: u64, dst: &mut [u8]) {
        let cap = self.capacity as usize;
        let start = (pos % self.capacity) as usize;
        let first = dst.len().min(cap - start);
        // SAFETY: callers only read bytes the producer has published, and both
        // copies stay within the data area.
        unsafe {
            ptr::copy_nonoverlapping(self.data().add(start), dst.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.data(), dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }

    /// Caller must be the only producer of this ring at this moment.
    fn push_frame(&self, payload: &[u8], wait: Wait) -> Result<(), RingError> {
        let frame_len = FRAME_HEADER + payload.len();
        if payload.len() > u32::MAX as usize || frame_len as u64 > self.capacity {
            return Err(RingError::FrameTooLarge {
                len: payload.len(),
                capacity: self.capacity,
            });
        }

        let header = self.header();
        loop {
            let seq = header.writable.load(Ordering::Acquire);
            if header.closed.load(Ordering::Acquire) != 0 {
                return Err(RingError::Closed);
            }

            let tail = header.tail.0.load(Ordering::Relaxed);
            let head = header.head.0.load(Ordering::Acquire);
            let free = self.capacity.saturating_sub(tail.wrapping_sub(head));
            if free >= frame_len as u64 {
                self.write_at(tail, &(payload.len() as u32).to_le_bytes());
                self.write_at(tail + FRAME_HEADER as u64, payload);
                header.tail.0.store(tail + frame_len as u64, Ordering::Release);
                header.readable.fetch_add(1, Ordering::Release);
                doorbell::wake_all(&header.readable);
                tracing::trace!(id = %self.id, len = payload.len(), "Pushed frame");
                return Ok(());
            }

            match (wait, wait.slice()) {
                (Wait::Never, _) => return Err(RingError::Full),
                (_, None) => return Err(RingError::TimedOut),
                (_, Some(slice)) => doorbell::wait(&header.writable, seq, slice),
            }
        }
    }

    /// Caller must be the only consumer of this ring at this moment.
    fn pop_frame(&self, blocking: bool) -> Result<Option<Vec<u8>>, RingError> {
        let header = self.header();
        loop {
            let seq = header.readable.load(Ordering::Acquire);
            let head = header.head.0.load(Ordering::Relaxed);
            let tail = header.tail.0.load(Ordering::Acquire);

            if tail != head {
                return self.take_frame(head, tail).map(Some);
            }

            if header.closed.load(Ordering::Acquire) != 0 {
                // A frame published just before the close must still be delivered.
                if header.tail.0.load(Ordering::Acquire) != head {
                    continue;
                }
                return Err(RingError::Closed);
            }

            if !blocking {
                return Ok(None);
            }
            doorbell::wait(&header.readable, seq, WAIT_SLICE);
        }
    }

    fn take_frame(&self, head: u64, tail: u64) -> Result<Vec<u8>, RingError> {
        let available = tail.wrapping_sub(head);
        if available > self.capacity || available < FRAME_HEADER as u64 {
            return Err(self.corrupt(format!(
                "{available} bytes published at cursor {head}"
            )));
        }

        let mut len_bytes = [0u8; FRAME_HEADER];
        self.read_at(head, &mut len_bytes);
        let len = u32::from_le_bytes(len_bytes) as u64;
        if FRAME_HEADER as u64 + len > available {
            return Err(self.corrupt(format!(
                "length {len} exceeds the {available} bytes published"
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.read_at(head + FRAME_HEADER as u64, &mut payload);

        let header = self.header();
        header
            .head
            .0
            .store(head + FRAME_HEADER as u64 + len, Ordering::Release);
        header.writable.fetch_add(1, Ordering::Release);
        doorbell::wake_all(&header.writable);
        tracing::trace!(id = %self.id, len, "Popped frame");
        Ok(payload)
    }

    fn corrupt(&self, reason: String) -> RingError {
        tracing::error!(id = %self.id, %reason, "Corrupt ring frame");
        RingError::Corrupt {
            id: self.id.clone(),
            reason,
        }
    }

    /// Publish raw bytes without framing.
    #[cfg(test)]
    pub(crate) fn inject_raw(&self, bytes: &[u8]) {
        let header = self.header();
        let tail = header.tail.0.load(Ordering::Relaxed);
        self.write_at(tail, bytes);
        header.tail.0.store(tail + bytes.len() as u64, Ordering::Release);
        header.readable.fetch_add(1, Ordering::Release);
        doorbell::wake_all(&header.readable);
    }
}

fn check_capacity(capacity: usize) -> Result<(), RingError> {
    if capacity < MIN_CAPACITY {
        return Err(RingError::InvalidCapacity {
            capacity,
            min: MIN_CAPACITY,
        });
    }
    Ok(())
}

/// POSIX shm names are a single path component with a leading slash.
fn shm_name(id: &str) -> String {
    let trimmed = id.trim_start_matches('/');
    format!("/{}", trimmed.replace('/', "_"))
}

/// Producing end of a ring. Shareable across threads; pushes are serialized.
pub struct RingProducer {
    ring: Arc<Ring>,
    lock: Mutex<()>,
}

impl RingProducer {
    pub fn new(ring: Arc<Ring>) -> Self {
        Self {
            ring,
            lock: Mutex::new(()),
        }
    }

    /// Push one frame, blocking while the ring is full.
    pub fn push(&self, payload: &[u8]) -> Result<(), RingError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ring.push_frame(payload, Wait::Forever)
    }

    /// Push one frame, waiting for room (and for other producer threads)
    /// until `deadline`, then [`RingError::TimedOut`].
    pub fn push_until(&self, payload: &[u8], deadline: Instant) -> Result<(), RingError> {
        let wait = Wait::Until(deadline);
        loop {
            match self.lock.try_lock() {
                Ok(_guard) => return self.ring.push_frame(payload, wait),
                Err(TryLockError::Poisoned(poisoned)) => {
                    let _guard = poisoned.into_inner();
                    return self.ring.push_frame(payload, wait);
                }
                Err(TryLockError::WouldBlock) => {
                    if self.ring.is_closed() {
                        return Err(RingError::Closed);
                    }
                    let Some(slice) = wait.slice() else {
                        return Err(RingError::TimedOut);
                    };
                    std::thread::sleep(slice.min(LOCK_SLICE));
                }
            }
        }
    }

    /// Push one frame if there is room right now (and no other producer
    /// thread holds the ring), otherwise [`RingError::Full`].
    pub fn try_push(&self, payload: &[u8]) -> Result<(), RingError> {
        let _guard = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(RingError::Full),
        };
        self.ring.push_frame(payload, Wait::Never)
    }

    pub fn close(&self) {
        self.ring.close();
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }
}

/// Consuming end of a ring. Shareable across threads; each frame goes to
/// exactly one caller.
pub struct RingConsumer {
    ring: Arc<Ring>,
    lock: Mutex<()>,
}

impl RingConsumer {
    pub fn new(ring: Arc<Ring>) -> Self {
        Self {
            ring,
            lock: Mutex::new(()),
        }
    }

    /// Pop one frame, blocking while the ring is empty.
    pub fn pop(&self) -> Result<Vec<u8>, RingError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.ring.pop_frame(true)? {
            Some(frame) => Ok(frame),
            None => Err(RingError::Closed),
        }
    }

    /// Pop one frame if one is queued; `Ok(None)` when empty.
    pub fn try_pop(&self) -> Result<Option<Vec<u8>>, RingError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ring.pop_frame(false)
    }

    pub fn close(&self) {
        self.ring.close();
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }
}

/// Both ends of an anonymous ring.
pub fn pair(capacity: usize) -> Result<(RingProducer, RingConsumer), RingError> {
    let ring = Ring::anonymous(capacity)?;
    Ok((
        RingProducer::new(Arc::clone(&ring)),
        RingConsumer::new(ring),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn push_then_pop_preserves_order() {
        let (tx, rx) = pair(1024).unwrap();
        tx.push(b"first").unwrap();
        tx.push(b"").unwrap();
        tx.push(b"third").unwrap();

        assert_eq!(rx.pop().unwrap(), b"first");
        assert_eq!(rx.pop().unwrap(), b"");
        assert_eq!(rx.pop().unwrap(), b"third");
        assert!(rx.try_pop().unwrap().is_none());
    }

    #[test]
    fn frames_wrap_around_the_data_area() {
        let (tx, rx) = pair(64).unwrap();
        for round in 0..50u8 {
            let payload: Vec<u8> = (0..(17 + round % 23)).map(|i| i ^ round).collect();
            tx.push(&payload).unwrap();
            assert_eq!(rx.pop().unwrap(), payload);
        }
        assert_eq!(tx.ring().pending_bytes(), 0);
    }

    #[test]
    fn oversized_frame_is_rejected_without_blocking() {
        let (tx, _rx) = pair(64).unwrap();
        let err = tx.push(&[0u8; 61]).unwrap_err();
        assert!(matches!(err, RingError::FrameTooLarge { len: 61, .. }));
        tx.push(&[0u8; 60]).unwrap();
    }

    #[test]
    fn capacity_below_minimum_is_rejected() {
        assert!(matches!(
            Ring::anonymous(8),
            Err(RingError::InvalidCapacity { capacity: 8, .. })
        ));
    }

    #[test]
    fn try_push_reports_full() {
        let (tx, rx) = pair(64).unwrap();
        tx.push(&[1u8; 40]).unwrap();
        assert!(matches!(tx.try_push(&[2u8; 40]), Err(RingError::Full)));
        rx.pop().unwrap();
        tx.try_push(&[2u8; 40]).unwrap();
    }

    #[test]
    fn push_until_gives_up_at_the_deadline() {
        let (tx, rx) = pair(64).unwrap();
        tx.push(&[1u8; 40]).unwrap();

        let started = Instant::now();
        let err = tx
            .push_until(&[2u8; 40], started + Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, RingError::TimedOut));
        assert!(!err.is_fatal());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));

        rx.pop().unwrap();
        tx.push_until(&[2u8; 40], Instant::now() + Duration::from_secs(1))
            .unwrap();
        assert_eq!(rx.pop().unwrap(), vec![2u8; 40]);
    }

    #[test]
    fn push_until_waits_out_a_blocked_producer() {
        let (tx, rx) = pair(64).unwrap();
        let tx = Arc::new(tx);
        tx.push(&[1u8; 40]).unwrap();

        // This producer holds the lock while it waits for room.
        let blocked = {
            let tx = Arc::clone(&tx);
            thread::spawn(move || tx.push(&[3u8; 40]))
        };
        thread::sleep(Duration::from_millis(50));

        let err = tx
            .push_until(&[2u8; 8], Instant::now() + Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, RingError::TimedOut));

        rx.pop().unwrap();
        blocked.join().unwrap().unwrap();
        assert_eq!(rx.pop().unwrap(), vec![3u8; 40]);
    }

    #[test]
    fn push_blocks_while_full_until_a_pop() {
        let (tx, rx) = pair(64).unwrap();
        tx.push(&[7u8; 40]).unwrap();

        let pushed = Arc::new(AtomicBool::new(false));
        let pushed_flag = Arc::clone(&pushed);
        let producer = thread::spawn(move || {
            tx.push(&[8u8; 40]).unwrap();
            pushed_flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(150));
        assert!(!pushed.load(Ordering::SeqCst), "push should block on a full ring");

        assert_eq!(rx.pop().unwrap(), vec![7u8; 40]);
        producer.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(rx.pop().unwrap(), vec![8u8; 40]);
    }

    #[test]
    fn pop_blocks_while_empty_until_a_push() {
        let (tx, rx) = pair(256).unwrap();
        let started = Instant::now();
        let consumer = thread::spawn(move || rx.pop().unwrap());

        thread::sleep(Duration::from_millis(100));
        assert!(!consumer.is_finished());
        tx.push(b"wake").unwrap();

        assert_eq!(consumer.join().unwrap(), b"wake");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let (tx, rx) = pair(256).unwrap();
        let consumer = thread::spawn(move || rx.pop());
        thread::sleep(Duration::from_millis(50));
        tx.close();
        assert!(matches!(consumer.join().unwrap(), Err(RingError::Closed)));
    }

    #[test]
    fn close_wakes_blocked_push() {
        let (tx, rx) = pair(64).unwrap();
        tx.push(&[0u8; 50]).unwrap();
        let producer = thread::spawn(move || tx.push(&[0u8; 50]));
        thread::sleep(Duration::from_millis(50));
        rx.close();
        assert!(matches!(producer.join().unwrap(), Err(RingError::Closed)));
    }

    #[test]
    fn close_still_delivers_queued_frames() {
        let (tx, rx) = pair(256).unwrap();
        tx.push(b"a").unwrap();
        tx.push(b"b").unwrap();
        tx.close();

        assert!(matches!(tx.push(b"c"), Err(RingError::Closed)));
        assert_eq!(rx.pop().unwrap(), b"a");
        assert_eq!(rx.pop().unwrap(), b"b");
        assert!(matches!(rx.pop(), Err(RingError::Closed)));
        assert!(matches!(rx.try_pop(), Err(RingError::Closed)));
    }

    #[test]
    fn corrupt_length_is_detected() {
        let (_tx, rx) = pair(128).unwrap();
        let mut raw = 1000u32.to_le_bytes().to_vec();
        raw.extend_from_slice(b"short");
        rx.ring().inject_raw(&raw);

        let err = rx.pop().unwrap_err();
        assert!(matches!(err, RingError::Corrupt { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn concurrent_producers_never_interleave_frames() {
        let (tx, rx) = pair(512).unwrap();
        let tx = Arc::new(tx);
        const PRODUCERS: u8 = 4;
        const PER_PRODUCER: usize = 250;

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = Arc::clone(&tx);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let len = 8 + (i % 40);
                        let mut frame = vec![p; len];
                        frame[1..5].copy_from_slice(&(i as u32).to_le_bytes());
                        tx.push(&frame).unwrap();
                    }
                })
            })
            .collect();

        let mut next_seen = vec![0u32; PRODUCERS as usize];
        for _ in 0..(PRODUCERS as usize * PER_PRODUCER) {
            let frame = rx.pop().unwrap();
            let producer = frame[0];
            let seq = u32::from_le_bytes(frame[1..5].try_into().unwrap());
            assert!(frame[5..].iter().all(|b| *b == producer), "interleaved frame");
            assert_eq!(next_seen[producer as usize], seq, "per-producer order");
            next_seen[producer as usize] += 1;
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(rx.try_pop().unwrap().is_none());
    }

    #[test]
    fn concurrent_consumers_receive_each_frame_once() {
        let (tx, rx) = pair(1024).unwrap();
        let rx = Arc::new(rx);
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let rx = Arc::clone(&rx);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Ok(frame) = rx.pop() {
                        seen.push(u32::from_le_bytes(frame.try_into().unwrap()));
                    }
                    seen
                })
            })
            .collect();

        for i in 0..600u32 {
            tx.push(&i.to_le_bytes()).unwrap();
        }
        tx.close();

        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..600).collect::<Vec<_>>());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn named_ring_is_shared_between_mappings() {
        let id = format!("mproc-test-{}", uuid::Uuid::new_v4());
        let created = Ring::create(&id, 256).unwrap();
        let opened = Ring::open(&id, 256).unwrap();

        let tx = RingProducer::new(created);
        let rx = RingConsumer::new(opened);
        tx.push(b"across mappings").unwrap();
        assert_eq!(rx.pop().unwrap(), b"across mappings");

        assert!(matches!(
            Ring::open(&id, 512),
            Err(RingError::Mismatch { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn opening_a_missing_ring_is_unavailable() {
        let id = format!("mproc-missing-{}", uuid::Uuid::new_v4());
        let err = Ring::open(&id, 256).err().unwrap();
        assert!(matches!(err, RingError::Unavailable { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn shm_names_are_single_components() {
        assert_eq!(shm_name("commit"), "/commit");
        assert_eq!(shm_name("/pool/a"), "/pool_a");
    }
}

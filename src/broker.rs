//! The broker: one arena, one pool, many channels.
//!
//! [`Broker`] is the single-threaded heart of the crate. The embedding
//! event loop owns it exclusively and drives it with three kinds of
//! stimulus: requests ([`Broker::dispatch`]), connection lifecycle
//! ([`Broker::open_channel`] / [`Broker::close_channel`]) and timer
//! expiry ([`Broker::expire_vouchers`]). Requests either return a
//! [`Response`] immediately or park inside the broker; parked requests
//! complete later through the completion queue, from where the loop
//! drains them with [`Broker::next_completion`].
//!
//! ```no_run
//! use depot::broker::{Broker, BrokerConfig, Outcome};
//! use depot::protocol::{Request, SharePolicy, PROTOCOL_VERSION};
//!
//! # fn main() -> depot::error::Result<()> {
//! let mut broker = Broker::with_memfd(1 << 20, BrokerConfig::default())?;
//! let ch = broker.open_channel();
//! broker.dispatch(ch, 1, Request::Hello { version: PROTOCOL_VERSION });
//! let outcome = broker.dispatch(
//!     ch,
//!     2,
//!     Request::Alloc { size: 4096, clear: true, policy: SharePolicy::Standard },
//! );
//! if let Outcome::Reply(reply) = outcome {
//!     println!("allocated {:?}", reply.token);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::alloc::{Allocator, FreeList};
use crate::channel::Channel;
use crate::clock::{Clock, ClockTime, NullTimer, SystemClock, Timer};
use crate::error::{Error, Result};
use crate::pool::{Mode, Pool};
use crate::protocol::{Request, Response, Status};
use crate::segment::{HeapSegment, MemfdSegment, Segment, SegmentDescriptor};
use crate::token::TokenSequence;
use crate::voucher::VoucherQueue;

// ============================================================================
// Identifiers and completion plumbing
// ============================================================================

/// Identifies one connection for the lifetime of the broker.
///
/// Ids are never reused, so a completion addressed to a closed channel can
/// be recognized and dropped instead of reaching a new connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A deferred reply: which channel it belongs to and what to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Channel the response must be delivered on.
    pub channel: ChannelId,
    /// The response itself, carrying the parked request's sequence number.
    pub response: Response,
}

/// What [`Broker::dispatch`] did with a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The request completed; send this response.
    Reply(Response),
    /// The request parked. Its response arrives later as a [`Completion`].
    Pending,
}

impl Outcome {
    /// The immediate response, or `None` if the request parked.
    pub fn into_reply(self) -> Option<Response> {
        match self {
            Outcome::Reply(response) => Some(response),
            Outcome::Pending => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for a [`Broker`].
///
/// ```
/// use depot::broker::BrokerConfig;
/// use std::time::Duration;
///
/// let config = BrokerConfig {
///     voucher_ttl: Duration::from_secs(10),
///     ..Default::default()
/// };
/// assert_eq!(config.expiry_batch_delay, Duration::from_secs(5));
/// ```
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Seed for the token sequence. Zero (the default) seeds from process
    /// entropy; a nonzero value makes token values reproducible.
    pub token_seed: u64,
    /// How long a voucher stays redeemable. Must be nonzero.
    pub voucher_ttl: Duration,
    /// How long past the earliest expiry the timer is allowed to fire, so
    /// that near-simultaneous expirations collapse into one wakeup.
    pub expiry_batch_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            token_seed: 0,
            voucher_ttl: Duration::from_secs(60),
            expiry_batch_delay: Duration::from_secs(5),
        }
    }
}

/// A point-in-time census of broker state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Live objects in the pool.
    pub objects: usize,
    /// Connected channels.
    pub channels: usize,
    /// Outstanding vouchers.
    pub vouchers: usize,
    /// Completions queued but not yet collected.
    pub queued_completions: usize,
    /// Total arena size in bytes.
    pub arena_size: u64,
    /// Arena bytes not currently allocated.
    pub free_bytes: u64,
}

// ============================================================================
// Broker
// ============================================================================

/// Brokers objects carved out of one shared arena between local channels.
///
/// Not [`Sync`]: exactly one thread drives it, which is what makes the
/// request handlers free of locking. See the [module docs](self) for the
/// driving contract.
pub struct Broker {
    pub(crate) pool: Pool,
    pub(crate) vouchers: VoucherQueue,
    pub(crate) channels: HashMap<ChannelId, Channel>,
    pub(crate) tokens: TokenSequence,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) outbox: VecDeque<Completion>,
    next_channel: u64,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("channels", &self.channels.len())
            .field("queued_completions", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Create a broker over the given segment and sub-allocator, on the
    /// system clock.
    pub fn new(
        segment: Arc<dyn Segment>,
        alloc: Box<dyn Allocator>,
        config: BrokerConfig,
    ) -> Result<Self> {
        Self::with_clock(segment, alloc, config, Arc::new(SystemClock::new()))
    }

    /// Create a broker with an explicit clock, for deterministic tests.
    pub fn with_clock(
        segment: Arc<dyn Segment>,
        alloc: Box<dyn Allocator>,
        config: BrokerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.voucher_ttl.is_zero() {
            return Err(Error::InvalidConfig("voucher ttl must be nonzero".into()));
        }
        if segment.is_empty() {
            return Err(Error::InvalidSegment("arena segment is empty".into()));
        }
        if segment.as_mut_ptr().is_none() {
            // Unpublish(clear) and realloc moves write through the arena.
            return Err(Error::InvalidSegment("arena segment is read-only".into()));
        }
        let capacity = alloc.capacity();
        if capacity == 0 || capacity > segment.len() as u64 {
            return Err(Error::InvalidSegment(format!(
                "allocator capacity {capacity} does not fit a segment of {} bytes",
                segment.len()
            )));
        }

        let tokens = if config.token_seed == 0 {
            TokenSequence::from_entropy()
        } else {
            TokenSequence::new(config.token_seed)
        };
        let vouchers = VoucherQueue::new(
            config.voucher_ttl.into(),
            config.expiry_batch_delay.into(),
            Box::new(NullTimer),
        );

        debug!(
            arena = segment.len(),
            shareable = segment.descriptor().is_some(),
            clock = clock.name(),
            "broker created"
        );
        Ok(Self {
            pool: Pool::new(segment, alloc),
            vouchers,
            channels: HashMap::new(),
            tokens,
            clock,
            outbox: VecDeque::new(),
            next_channel: 1,
        })
    }

    /// Convenience constructor: a process-private heap arena with the
    /// first-fit allocator. Clients cannot map this arena; useful for
    /// tests and single-process embeddings.
    pub fn with_heap(size: usize, config: BrokerConfig) -> Result<Self> {
        let segment: Arc<dyn Segment> = Arc::new(HeapSegment::new(size)?);
        let alloc = Box::new(FreeList::new(segment.clone()));
        Self::new(segment, alloc, config)
    }

    /// Convenience constructor: a memfd-backed arena with the first-fit
    /// allocator. The descriptor from [`Broker::segment_descriptor`] lets
    /// clients map the same memory.
    pub fn with_memfd(size: usize, config: BrokerConfig) -> Result<Self> {
        let segment: Arc<dyn Segment> = Arc::new(MemfdSegment::new(size)?);
        let alloc = Box::new(FreeList::new(segment.clone()));
        Self::new(segment, alloc, config)
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Register a new connection and return its id.
    pub fn open_channel(&mut self) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        self.channels.insert(id, Channel::new());
        debug!(channel = %id, "channel opened");
        id
    }

    /// Unregister a connection, unwinding everything it holds: parked
    /// requests die silently, open grants are closed out (which can
    /// complete other channels' parked requests) and every reference is
    /// released. Completions already queued for the channel are dropped.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a connected channel.
    pub fn close_channel(&mut self, id: ChannelId) {
        self.teardown_channel(id);
        self.channels.remove(&id);
        self.outbox.retain(|c| c.channel != id);
        debug!(channel = %id, "channel closed");
    }

    /// Tear everything down in an orderly way: every channel is closed,
    /// outstanding vouchers are dropped, and the pool is verified empty.
    ///
    /// # Panics
    ///
    /// Panics if objects survive the unwind, which indicates reference
    /// counting drift.
    pub fn shutdown(mut self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.teardown_channel(id);
            self.channels.remove(&id);
        }
        let dropped = self.vouchers.drain_all(&mut self.pool);
        self.outbox.clear();
        debug!(vouchers = dropped, "broker shut down");
        assert!(self.pool.is_empty(), "objects leaked at shutdown");
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Handle one request on a channel.
    ///
    /// `seq` is echoed in the response so callers can multiplex requests;
    /// parked requests echo it in their eventual [`Completion`]. Until a
    /// channel has completed the [`Request::Hello`] handshake everything
    /// else is refused.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not a connected channel.
    pub fn dispatch(&mut self, channel: ChannelId, seq: u64, request: Request) -> Outcome {
        trace!(channel = %channel, seq, op = request.name(), "request");
        if !self.channel(channel).greeted && !matches!(request, Request::Hello { .. }) {
            return Outcome::Reply(Response::new(seq, Status::InvalidRequest));
        }
        match request {
            Request::Hello { version } => Outcome::Reply(self.op_hello(channel, seq, version)),
            Request::GetSegment { index } => {
                Outcome::Reply(self.op_get_segment(channel, seq, index))
            }
            Request::Alloc { size, clear, policy } => {
                Outcome::Reply(self.op_alloc(channel, seq, size, clear, policy))
            }
            Request::Open { token, policy, wait } => {
                self.op_open(channel, seq, token, policy, wait)
            }
            Request::Close { token } => Outcome::Reply(self.op_close(channel, seq, token)),
            Request::Publish { token } => Outcome::Reply(self.op_publish(channel, seq, token)),
            Request::Unpublish { token, clear, wait } => {
                self.op_unpublish(channel, seq, token, clear, wait)
            }
            Request::Resize { token, new_size } => {
                Outcome::Reply(self.op_resize(channel, seq, token, new_size))
            }
            Request::CreateVoucher { token } => {
                Outcome::Reply(self.op_create_voucher(channel, seq, token))
            }
            Request::DiscardVoucher { token } => {
                Outcome::Reply(self.op_discard_voucher(channel, seq, token))
            }
        }
    }

    /// Collect the next deferred reply, oldest first.
    pub fn next_completion(&mut self) -> Option<Completion> {
        self.outbox.pop_front()
    }

    pub(crate) fn push_completion(&mut self, channel: ChannelId, response: Response) {
        trace!(
            channel = %channel,
            seq = response.seq,
            status = %response.status,
            "completion queued"
        );
        self.outbox.push_back(Completion { channel, response });
    }

    // ------------------------------------------------------------------
    // Timekeeping
    // ------------------------------------------------------------------

    /// Drop every voucher whose lifetime has passed, releasing the
    /// references they hold. The embedding loop calls this when the
    /// voucher timer fires; calling it early or spuriously is harmless.
    pub fn expire_vouchers(&mut self) -> usize {
        let now = self.clock.now();
        let expired = self.vouchers.expire_due(now, &mut self.pool);
        if expired > 0 {
            debug!(count = expired, "vouchers expired");
        }
        expired
    }

    /// The instant by which [`Broker::expire_vouchers`] should run, if any
    /// vouchers are outstanding. Includes the batching slack.
    pub fn voucher_deadline(&self) -> Option<ClockTime> {
        self.vouchers.next_deadline()
    }

    /// Install the timer the voucher queue keeps armed at its next
    /// deadline. The default timer discards all requests, which suits
    /// embeddings that poll [`Broker::voucher_deadline`] instead.
    pub fn set_voucher_timer(&mut self, timer: Box<dyn Timer>) {
        self.vouchers.set_timer(timer);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// The arena segment all objects live in.
    pub fn segment(&self) -> &Arc<dyn Segment> {
        self.pool.segment()
    }

    /// How a client maps the arena, or `None` for process-private arenas.
    /// Delivered out of band; the in-band protocol only reports sizes.
    pub fn segment_descriptor(&self) -> Option<SegmentDescriptor> {
        self.pool.segment().descriptor()
    }

    /// Current counters, for logs and tests.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            objects: self.pool.len(),
            channels: self.channels.len(),
            vouchers: self.vouchers.len(),
            queued_completions: self.outbox.len(),
            arena_size: self.pool.segment().len() as u64,
            free_bytes: self.pool.free_bytes(),
        }
    }

    /// Cross-check every redundant count and back-reference, panicking on
    /// the first inconsistency. Costs a full walk of all state; meant for
    /// tests and debug embeddings.
    pub fn verify_invariants(&self) {
        for (id, obj) in self.pool.iter() {
            let mut refs = self.vouchers.count_targeting(id);
            let mut opens = 0u32;
            for ch in self.channels.values() {
                for handle in ch.handles.values() {
                    if handle.object == id {
                        refs += handle.refs;
                        opens += handle.opens;
                    }
                }
            }
            assert_eq!(obj.refs, refs, "reference count drift on object {id}");
            assert_eq!(obj.opens, opens, "open count drift on object {id}");
            assert!(obj.opens <= obj.refs, "more opens than refs on object {id}");
            assert!(obj.refs > 0, "object {id} alive without references");

            match obj.mode() {
                Mode::Writing => {
                    if let Some(writer) = obj.writer {
                        assert!(
                            self.channels.contains_key(&writer),
                            "writer of object {id} is not connected"
                        );
                    } else {
                        // Abandoned: every parked wait-open was answered
                        // when the writer walked away.
                        assert!(
                            obj.publish_waiters.is_empty(),
                            "wait-open parked on abandoned object {id}"
                        );
                    }
                }
                Mode::Published | Mode::ShareMutable => {
                    assert!(obj.writer.is_none(), "open object {id} has a writer");
                    assert!(
                        obj.publish_waiters.is_empty(),
                        "wait-open parked on open object {id}"
                    );
                }
            }

            for href in &obj.publish_waiters {
                let handle = self
                    .channels
                    .get(&href.channel)
                    .and_then(|ch| ch.handles.get(&href.token));
                match handle {
                    Some(h) => {
                        assert_eq!(h.object, id, "waiter entry points at wrong object");
                        assert!(
                            !h.pending_opens.is_empty(),
                            "waiter entry for handle with no parked opens"
                        );
                    }
                    None => panic!("waiter entry for missing handle on object {id}"),
                }
            }

            if let Some(waiter) = obj.sole_waiter {
                assert_eq!(
                    obj.mode(),
                    Mode::Published,
                    "wait-unpublish parked on object {id} that is not published"
                );
                let handle = self
                    .channels
                    .get(&waiter.channel)
                    .and_then(|ch| ch.handles.get(&waiter.token));
                match handle {
                    Some(h) => {
                        assert_eq!(h.object, id, "sole waiter points at wrong object");
                        assert!(h.sole_wait.is_some(), "sole waiter lost its parked state");
                        assert!(h.opens >= 1, "sole waiter holds no open");
                    }
                    None => panic!("sole waiter missing on object {id}"),
                }
            }
        }

        for (cid, ch) in &self.channels {
            for (token, handle) in &ch.handles {
                let obj = self.pool.obj(handle.object);
                assert!(handle.refs > 0, "dead handle {token} on channel {cid}");
                assert!(
                    handle.opens <= handle.client_refs(),
                    "handle {token} on channel {cid} has more opens than usable refs"
                );
                let href = crate::handle::HandleRef {
                    channel: *cid,
                    token: *token,
                };
                if !handle.pending_opens.is_empty() {
                    assert!(
                        obj.publish_waiters.contains(&href),
                        "parked opens on {token} not registered with the object"
                    );
                }
                if handle.sole_wait.is_some() {
                    assert_eq!(
                        obj.sole_waiter,
                        Some(href),
                        "parked unpublish on {token} not registered with the object"
                    );
                }
            }
        }
    }

    pub(crate) fn channel(&self, id: ChannelId) -> &Channel {
        match self.channels.get(&id) {
            Some(ch) => ch,
            None => panic!("unknown channel {id}"),
        }
    }

    pub(crate) fn channel_mut(&mut self, id: ChannelId) -> &mut Channel {
        match self.channels.get_mut(&id) {
            Some(ch) => ch,
            None => panic!("unknown channel {id}"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SharePolicy;

    /// Segment whose mapping refuses writes, as a read-only client view would.
    struct ReadOnlySegment(Box<[u8]>);

    impl Segment for ReadOnlySegment {
        fn as_ptr(&self) -> *const u8 {
            self.0.as_ptr()
        }

        fn as_mut_ptr(&self) -> Option<*mut u8> {
            None
        }

        fn len(&self) -> usize {
            self.0.len()
        }

        fn descriptor(&self) -> Option<SegmentDescriptor> {
            None
        }
    }

    /// Test that configuration and segment validation reject bad setups.
    #[test]
    fn construction_validation() {
        let config = BrokerConfig {
            voucher_ttl: Duration::ZERO,
            ..Default::default()
        };
        let err = Broker::with_heap(4096, config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        // Allocator sized for a bigger segment than the one provided.
        let big: Arc<dyn Segment> = Arc::new(HeapSegment::new(8192).unwrap());
        let small: Arc<dyn Segment> = Arc::new(HeapSegment::new(4096).unwrap());
        let alloc = Box::new(FreeList::new(big));
        let err = Broker::new(small, alloc, BrokerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidSegment(_)));

        // A read-only mapping cannot serve as the arena.
        let frozen: Arc<dyn Segment> =
            Arc::new(ReadOnlySegment(vec![0; 4096].into_boxed_slice()));
        let alloc = Box::new(FreeList::new(frozen.clone()));
        let err = Broker::new(frozen, alloc, BrokerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidSegment(_)));
    }

    /// Test that a fixed seed makes token values reproducible.
    #[test]
    fn seeded_tokens_are_reproducible() {
        let config = BrokerConfig {
            token_seed: 42,
            ..Default::default()
        };
        let mut a = Broker::with_heap(4096, config.clone()).unwrap();
        let mut b = Broker::with_heap(4096, config).unwrap();
        assert_eq!(a.tokens.next_token(), b.tokens.next_token());
    }

    #[test]
    fn stats_track_allocations() {
        let mut broker = Broker::with_heap(4096, BrokerConfig::default()).unwrap();
        let ch = broker.open_channel();
        broker.dispatch(ch, 1, Request::Hello { version: crate::protocol::PROTOCOL_VERSION });

        let before = broker.stats();
        assert_eq!(before.objects, 0);
        assert_eq!(before.channels, 1);
        assert_eq!(before.arena_size, 4096);
        assert_eq!(before.free_bytes, 4096);

        let reply = broker
            .dispatch(
                ch,
                2,
                Request::Alloc { size: 100, clear: false, policy: SharePolicy::Standard },
            )
            .into_reply()
            .unwrap();
        assert!(reply.is_ok());

        let after = broker.stats();
        assert_eq!(after.objects, 1);
        // Sizes are rounded up to the allocation grain.
        assert_eq!(after.free_bytes, 4096 - 112);
        broker.verify_invariants();
    }

    #[test]
    fn heap_arena_has_no_descriptor() {
        let broker = Broker::with_heap(4096, BrokerConfig::default()).unwrap();
        assert!(broker.segment_descriptor().is_none());
    }

    #[test]
    fn memfd_arena_is_shareable() {
        let broker = Broker::with_memfd(4096, BrokerConfig::default()).unwrap();
        match broker.segment_descriptor() {
            Some(SegmentDescriptor::Fd { size, .. }) => assert_eq!(size, 4096),
            other => panic!("unexpected descriptor {other:?}"),
        }
    }

    #[test]
    fn shutdown_with_clean_state() {
        let mut broker = Broker::with_heap(4096, BrokerConfig::default()).unwrap();
        let ch = broker.open_channel();
        broker.dispatch(ch, 1, Request::Hello { version: crate::protocol::PROTOCOL_VERSION });
        broker.dispatch(
            ch,
            2,
            Request::Alloc { size: 64, clear: false, policy: SharePolicy::Standard },
        );
        // The open allocation is unwound by the channel teardown.
        broker.shutdown();
    }
}

//! Per-channel handles and the continuation registry.
//!
//! A handle is one channel's grip on one object: a local reference count, a
//! local open count, and any parked waitable work. Waiting is data, not
//! callbacks: a parked wait-open is a sequence number on the handle plus a
//! back-reference on the object, and the operation that makes the wait
//! resolvable (publish, close, teardown) resumes it synchronously by
//! pushing a completion into the broker's outbox.

use crate::broker::{Broker, ChannelId};
use crate::pool::ObjectId;
use crate::protocol::{Response, Status};
use crate::token::Token;
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Locates a waiting handle from an object's side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HandleRef {
    /// Channel owning the handle.
    pub(crate) channel: ChannelId,
    /// Key of the handle in that channel's table.
    pub(crate) token: Token,
}

/// A parked wait-unpublish: completed when the waiter's open becomes the
/// object's only one, or cancelled.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SoleWait {
    /// Sequence number of the parked request.
    pub(crate) seq: u64,
    /// Zero the object when the reclaim completes.
    pub(crate) clear: bool,
}

/// One channel's grip on one object.
///
/// `refs` counts client references plus parked wait-opens (each parked
/// wait-open holds the reference that will become the client's on success).
/// `opens` counts access grants and never exceeds `refs`.
pub(crate) struct Handle {
    /// The object this handle grips. Survives rekeys; the table key the
    /// client knows may grow stale, the id never does.
    pub(crate) object: ObjectId,
    /// Local reference count.
    pub(crate) refs: u32,
    /// Local open count.
    pub(crate) opens: u32,
    /// Parked wait-open sequence numbers, in registration order.
    pub(crate) pending_opens: SmallVec<[u64; 2]>,
    /// Parked wait-unpublish, if any.
    pub(crate) sole_wait: Option<SoleWait>,
}

impl Handle {
    pub(crate) fn new(object: ObjectId) -> Self {
        Self {
            object,
            refs: 0,
            opens: 0,
            pending_opens: SmallVec::new(),
            sole_wait: None,
        }
    }

    /// References the client actually holds (total minus parked wait-opens).
    pub(crate) fn client_refs(&self) -> u32 {
        self.refs - self.pending_opens.len() as u32
    }
}

impl Broker {
    /// Panicking handle lookup; stale entries are a broker bug, not a
    /// client error.
    pub(crate) fn handle_mut(&mut self, channel: ChannelId, token: Token) -> &mut Handle {
        match self
            .channels
            .get_mut(&channel)
            .and_then(|ch| ch.handles.get_mut(&token))
        {
            Some(handle) => handle,
            None => panic!("no handle for token {token} on channel {channel}"),
        }
    }

    /// Drop one handle reference, mirroring it on the object; destroy the
    /// handle at zero. Parked work must be detached before the last
    /// reference goes.
    pub(crate) fn release_handle_ref(&mut self, channel: ChannelId, token: Token) {
        let Some(ch) = self.channels.get_mut(&channel) else {
            panic!("unknown channel {channel}");
        };
        let Some(handle) = ch.handles.get_mut(&token) else {
            panic!("no handle for token {token} on channel {channel}");
        };
        assert!(handle.refs > 0, "handle refcount underflow on {token}");
        handle.refs -= 1;
        let id = handle.object;
        if handle.refs == 0 {
            assert_eq!(handle.opens, 0, "handle destroyed while open");
            assert!(
                handle.pending_opens.is_empty() && handle.sole_wait.is_none(),
                "handle destroyed with parked work"
            );
            ch.handles.shift_remove(&token);
            trace!(channel = %channel, token = %token, "handle destroyed");
        }
        self.pool.release(id);
    }

    /// Park a wait-open on the handle and register it with the object.
    ///
    /// The caller has already taken the pending reference.
    pub(crate) fn register_publish_wait(&mut self, id: ObjectId, href: HandleRef, seq: u64) {
        let handle = self.handle_mut(href.channel, href.token);
        let first = handle.pending_opens.is_empty();
        handle.pending_opens.push(seq);
        if first {
            self.pool.obj_mut(id).publish_waiters.push(href);
        }
        trace!(id = %id, channel = %href.channel, seq, "wait-open parked");
    }

    /// Resume every parked wait-open on the object.
    ///
    /// On success each parked request becomes a real open (its pending
    /// reference becomes the client's). On cancellation each completes busy
    /// and its pending reference is released. Resumption order is
    /// last-registered-first.
    pub(crate) fn fire_publish_waits(&mut self, id: ObjectId, success: bool) {
        let waiters = std::mem::take(&mut self.pool.obj_mut(id).publish_waiters);
        if waiters.is_empty() {
            return;
        }
        debug!(id = %id, waiters = waiters.len(), success, "resuming wait-opens");

        for href in waiters.iter().rev() {
            let handle = match self
                .channels
                .get_mut(&href.channel)
                .and_then(|ch| ch.handles.get_mut(&href.token))
            {
                Some(handle) => handle,
                None => panic!("parked waiter without handle on channel {}", href.channel),
            };
            let seqs = std::mem::take(&mut handle.pending_opens);
            debug_assert!(!seqs.is_empty());

            if success {
                handle.opens += seqs.len() as u32;
                let obj = self.pool.obj_mut(id);
                obj.opens += seqs.len() as u32;
                let (offset, size) = (obj.offset, obj.size);
                for &seq in seqs.iter().rev() {
                    self.push_completion(
                        href.channel,
                        Response::new(seq, Status::Ok)
                            .with_token(href.token)
                            .with_extent(offset, size),
                    );
                }
            } else {
                for &seq in seqs.iter().rev() {
                    self.push_completion(
                        href.channel,
                        Response::new(seq, Status::ObjectBusy).with_token(href.token),
                    );
                }
                // Pending references die with their requests. The handle
                // (and object) may go with the last one.
                for _ in 0..seqs.len() {
                    self.release_handle_ref(href.channel, href.token);
                }
            }
        }
    }

    /// Park a wait-unpublish. The object side must be free.
    pub(crate) fn register_sole_wait(
        &mut self,
        id: ObjectId,
        href: HandleRef,
        seq: u64,
        clear: bool,
    ) {
        let obj = self.pool.obj_mut(id);
        debug_assert!(obj.sole_waiter.is_none(), "sole waiter slot occupied");
        obj.sole_waiter = Some(href);
        let handle = self.handle_mut(href.channel, href.token);
        debug_assert!(handle.sole_wait.is_none());
        handle.sole_wait = Some(SoleWait { seq, clear });
        trace!(id = %id, channel = %href.channel, seq, "wait-unpublish parked");
    }

    /// Complete a parked wait-unpublish: the waiter's open is now the only
    /// one, so reclaim the object for it. Returns the fresh token the
    /// waiter's handle was rekeyed to.
    pub(crate) fn fire_sole_wait(&mut self, id: ObjectId) -> Token {
        let obj = self.pool.obj_mut(id);
        let Some(href) = obj.sole_waiter.take() else {
            panic!("no sole waiter on object {id}");
        };
        debug_assert_eq!(obj.opens, 1);
        let handle = self.handle_mut(href.channel, href.token);
        let Some(SoleWait { seq, clear }) = handle.sole_wait.take() else {
            panic!("sole waiter without parked record");
        };
        debug_assert_eq!(handle.opens, 1);

        let new_token = self.reclaim_for_writer(id, href, clear);
        let obj = self.pool.obj(id);
        let (offset, size) = (obj.offset, obj.size);
        self.push_completion(
            href.channel,
            Response::new(seq, Status::Ok)
                .with_token(new_token)
                .with_extent(offset, size),
        );
        new_token
    }

    /// Cancel a parked wait-unpublish with a busy completion (the waiter
    /// gave up its own access, so sole ownership can never arrive).
    pub(crate) fn cancel_sole_wait(&mut self, id: ObjectId) {
        let obj = self.pool.obj_mut(id);
        let Some(href) = obj.sole_waiter.take() else {
            panic!("no sole waiter on object {id}");
        };
        let handle = self.handle_mut(href.channel, href.token);
        let Some(SoleWait { seq, .. }) = handle.sole_wait.take() else {
            panic!("sole waiter without parked record");
        };
        debug!(id = %id, channel = %href.channel, "wait-unpublish cancelled");
        self.push_completion(
            href.channel,
            Response::new(seq, Status::ObjectBusy).with_token(href.token),
        );
    }

    /// Silently drop a handle's parked wait-opens (teardown path; the dying
    /// channel gets no completions). Returns how many pending references
    /// the caller must release.
    pub(crate) fn detach_pending_opens(&mut self, id: ObjectId, href: HandleRef) -> usize {
        let handle = self.handle_mut(href.channel, href.token);
        let seqs = std::mem::take(&mut handle.pending_opens);
        if !seqs.is_empty() {
            self.pool
                .obj_mut(id)
                .publish_waiters
                .retain(|w| *w != href);
        }
        seqs.len()
    }

    /// Silently drop a handle's parked wait-unpublish (teardown path).
    pub(crate) fn detach_sole_wait(&mut self, id: ObjectId, href: HandleRef) {
        let handle = self.handle_mut(href.channel, href.token);
        if handle.sole_wait.take().is_some() {
            let obj = self.pool.obj_mut(id);
            debug_assert_eq!(obj.sole_waiter, Some(href));
            obj.sole_waiter = None;
        }
    }
}

//! Channels: the per-connection façade and every request operation.
//!
//! A channel owns a table of handles keyed by the token the client used to
//! acquire each one. Operations act on that table and mirror every local
//! count change onto the pool, so the object-level invariants (global refs
//! = handle refs + vouchers, global opens = handle opens) hold after every
//! request. Waitable operations either reply immediately or park
//! themselves; parked work resolves through the continuation registry.

use crate::broker::{Broker, ChannelId, Outcome};
use crate::handle::{Handle, HandleRef};
use crate::pool::ObjectId;
use crate::protocol::{Response, SharePolicy, Status, PROTOCOL_VERSION};
use crate::token::Token;
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

/// Per-connection state: the handle table and the handshake flag.
///
/// The table is insertion-ordered so teardown unwinds handles in the order
/// the connection acquired them.
pub(crate) struct Channel {
    /// Handles keyed by the token the client knows them under. After an
    /// unpublish elsewhere the key can lag the object's current token; the
    /// handle still works, because it references the object by id.
    pub(crate) handles: IndexMap<Token, Handle>,
    /// Set by a successful Hello; everything else requires it.
    pub(crate) greeted: bool,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Self {
            handles: IndexMap::new(),
            greeted: false,
        }
    }
}

/// What an open-style token lookup landed on.
#[derive(Clone, Copy)]
enum Resolved {
    /// The channel already holds a handle under this token.
    Handle(ObjectId),
    /// The token is an object's current token.
    Pool(ObjectId),
    /// The token is a live voucher for the target.
    Voucher(Token, ObjectId),
}

impl Broker {
    /// Handshake. Must be the first request on the channel; the version
    /// must match.
    pub(crate) fn op_hello(&mut self, channel: ChannelId, seq: u64, version: u32) -> Response {
        let ch = self.channel_mut(channel);
        if ch.greeted {
            warn!(channel = %channel, "repeated handshake");
            return Response::new(seq, Status::InvalidRequest);
        }
        if version != PROTOCOL_VERSION {
            warn!(channel = %channel, version, "handshake version mismatch");
            return Response::new(seq, Status::InvalidRequest);
        }
        ch.greeted = true;
        debug!(channel = %channel, version, "channel greeted");
        Response::new(seq, Status::Ok)
    }

    /// Query an arena segment. There is exactly one, index 0; its size is
    /// returned in-band and the mapping descriptor travels out of band.
    pub(crate) fn op_get_segment(&mut self, channel: ChannelId, seq: u64, index: u32) -> Response {
        if index != 0 {
            return Response::new(seq, Status::NoSuchSegment);
        }
        let size = self.pool.segment().len() as u64;
        trace!(channel = %channel, size, "segment queried");
        Response::new(seq, Status::Ok).with_size(size)
    }

    /// Allocate a fresh object. The caller gets a handle with one
    /// reference and one open; for standard policy it becomes the
    /// exclusive writer.
    pub(crate) fn op_alloc(
        &mut self,
        channel: ChannelId,
        seq: u64,
        size: u64,
        clear: bool,
        policy: SharePolicy,
    ) -> Response {
        if size == 0 {
            return Response::new(seq, Status::InvalidRequest);
        }
        let token = self.tokens.next_token();
        let Some(id) = self.pool.create(token, size, clear, policy) else {
            debug!(channel = %channel, size, "allocation refused: arena exhausted");
            return Response::new(seq, Status::OutOfMemory);
        };
        {
            let obj = self.pool.obj_mut(id);
            obj.opens = 1;
            if policy.is_gated() {
                obj.writer = Some(channel);
            }
        }
        let mut handle = Handle::new(id);
        handle.refs = 1;
        handle.opens = 1;
        let prev = self.channel_mut(channel).handles.insert(token, handle);
        debug_assert!(prev.is_none(), "token key collision");

        let obj = self.pool.obj(id);
        debug!(channel = %channel, token = %token, size, policy = %policy, "object allocated");
        Response::new(seq, Status::Ok)
            .with_token(token)
            .with_extent(obj.offset, obj.size)
    }

    /// Acquire an object: by a token this channel already tracks, by an
    /// object's current token, or by redeeming a voucher.
    pub(crate) fn op_open(
        &mut self,
        channel: ChannelId,
        seq: u64,
        token: Token,
        policy: SharePolicy,
        wait: bool,
    ) -> Outcome {
        let resolved = {
            let ch = self.channel(channel);
            if let Some(h) = ch.handles.get(&token) {
                Some(Resolved::Handle(h.object))
            } else if let Some(id) = self.pool.find(token) {
                Some(Resolved::Pool(id))
            } else {
                self.vouchers
                    .peek_target(token)
                    .map(|target| Resolved::Voucher(token, target))
            }
        };
        let Some(resolved) = resolved else {
            return Outcome::Reply(Response::new(seq, Status::NoSuchObject));
        };
        let id = match resolved {
            Resolved::Handle(id) | Resolved::Pool(id) | Resolved::Voucher(_, id) => id,
        };

        // Policy is checked before anything is counted or consumed; a
        // mismatched voucher stays live.
        if self.pool.obj(id).policy != policy {
            return Outcome::Reply(Response::new(seq, Status::NoSuchObject));
        }

        // The key this channel will track the object under.
        let key = match resolved {
            Resolved::Handle(_) | Resolved::Pool(_) => token,
            Resolved::Voucher(..) => self.pool.obj(id).token,
        };

        // Take the reference: transferred off the voucher, or fresh.
        match resolved {
            Resolved::Voucher(vtok, _) => {
                let consumed = self.vouchers.remove(vtok);
                debug_assert!(consumed.is_some());
                // The voucher's reference moves onto the handle; the
                // object's count is unchanged.
                self.handle_entry(channel, key, id).refs += 1;
                debug!(channel = %channel, voucher = %vtok, token = %key, "voucher redeemed");
            }
            _ => {
                self.handle_entry(channel, key, id).refs += 1;
                self.pool.retain(id);
            }
        }

        if !self.pool.obj(id).is_open_gated() {
            let handle = self.handle_mut(channel, key);
            handle.opens += 1;
            let obj = self.pool.obj_mut(id);
            obj.opens += 1;
            let (offset, size) = (obj.offset, obj.size);
            trace!(channel = %channel, token = %key, "open granted");
            return Outcome::Reply(
                Response::new(seq, Status::Ok)
                    .with_token(key)
                    .with_extent(offset, size),
            );
        }

        // A wait can only park while a writer remains to publish. Once the
        // writer is gone the object can never become visible, so the wait
        // form gets the same busy answer a cancelled wait would.
        let abandoned = self.pool.obj(id).writer.is_none();
        if wait && !abandoned {
            self.register_publish_wait(id, HandleRef { channel, token: key }, seq);
            Outcome::Pending
        } else {
            // The reference is kept: the caller holds the object for a
            // retry and gives it up with Close.
            trace!(channel = %channel, token = %key, "open refused: unpublished");
            Outcome::Reply(Response::new(seq, Status::ObjectBusy).with_token(key))
        }
    }

    /// Release one reference (and one open grant, if any). The last
    /// reference anywhere destroys the object.
    pub(crate) fn op_close(&mut self, channel: ChannelId, seq: u64, token: Token) -> Response {
        let Some(handle) = self.channel(channel).handles.get(&token) else {
            return Response::new(seq, Status::NoSuchObject);
        };
        if handle.client_refs() == 0 {
            // Every remaining reference backs a parked wait-open; those are
            // cancelled by disconnecting, not by Close.
            return Response::new(seq, Status::InvalidRequest);
        }
        let id = handle.object;
        let mut key = token;
        if handle.opens > 0 {
            // Closing can fire this handle's own parked wait-unpublish,
            // which rekeys the handle to the reclaimed token.
            key = self.close_one_open(channel, token, id);
        }
        self.release_handle_ref(channel, key);
        Response::new(seq, Status::Ok)
    }

    /// Make an unpublished standard object visible. Writer-only; wakes
    /// every parked wait-open.
    pub(crate) fn op_publish(&mut self, channel: ChannelId, seq: u64, token: Token) -> Response {
        let id = match self.channel(channel).handles.get(&token) {
            Some(h) => h.object,
            None => match self.pool.find(token) {
                Some(id) => id,
                None => return Response::new(seq, Status::NoSuchObject),
            },
        };
        {
            let obj = self.pool.obj_mut(id);
            if obj.writer != Some(channel) {
                // Already published, share-mutable, abandoned, or not ours.
                return Response::new(seq, Status::InvalidRequest);
            }
            obj.published = true;
            obj.writer = None;
        }
        debug!(id = %id, token = %token, channel = %channel, "object published");
        self.fire_publish_waits(id, true);
        Response::new(seq, Status::Ok).with_token(token)
    }

    /// Reclaim a published object for exclusive writing under a fresh
    /// token. Requires this channel's open to be the object's only one;
    /// with `wait` the request parks until that becomes true.
    pub(crate) fn op_unpublish(
        &mut self,
        channel: ChannelId,
        seq: u64,
        token: Token,
        clear: bool,
        wait: bool,
    ) -> Outcome {
        let Some(handle) = self.channel(channel).handles.get(&token) else {
            let status = if self.pool.find(token).is_some() {
                // Somebody's object, but not held here.
                Status::InvalidRequest
            } else {
                Status::NoSuchObject
            };
            return Outcome::Reply(Response::new(seq, status));
        };
        let id = handle.object;
        let handle_opens = handle.opens;

        let (reclaimable, obj_opens, waiter_parked) = {
            let obj = self.pool.obj(id);
            (
                obj.policy.is_gated() && obj.published,
                obj.opens,
                obj.sole_waiter.is_some(),
            )
        };
        if !reclaimable {
            return Outcome::Reply(Response::new(seq, Status::InvalidRequest));
        }

        if handle_opens == 1 && obj_opens == 1 {
            let new_token = self.reclaim_for_writer(id, HandleRef { channel, token }, clear);
            let obj = self.pool.obj(id);
            return Outcome::Reply(
                Response::new(seq, Status::Ok)
                    .with_token(new_token)
                    .with_extent(obj.offset, obj.size),
            );
        }

        // Contended. Parking requires an open of our own to wait behind,
        // and the object only carries one parked reclaim at a time.
        if !wait || handle_opens == 0 || waiter_parked {
            return Outcome::Reply(Response::new(seq, Status::ObjectBusy).with_token(token));
        }
        self.register_sole_wait(id, HandleRef { channel, token }, seq, clear);
        Outcome::Pending
    }

    /// Change an object's size. Writer-only, so the object is unpublished
    /// and nobody else can be using it.
    pub(crate) fn op_resize(
        &mut self,
        channel: ChannelId,
        seq: u64,
        token: Token,
        new_size: u64,
    ) -> Response {
        if new_size == 0 {
            return Response::new(seq, Status::InvalidRequest);
        }
        let Some(handle) = self.channel(channel).handles.get(&token) else {
            let status = if self.pool.find(token).is_some() {
                Status::InvalidRequest
            } else {
                Status::NoSuchObject
            };
            return Response::new(seq, status);
        };
        let id = handle.object;
        if self.pool.obj(id).writer != Some(channel) {
            return Response::new(seq, Status::InvalidRequest);
        }
        if !self.pool.resize(id, new_size) {
            return Response::new(seq, Status::OutOfMemory);
        }
        let obj = self.pool.obj(id);
        Response::new(seq, Status::Ok)
            .with_token(token)
            .with_extent(obj.offset, obj.size)
    }

    /// Mint a transferable claim on an object. The voucher holds its own
    /// reference until redeemed, discarded, or expired.
    pub(crate) fn op_create_voucher(
        &mut self,
        channel: ChannelId,
        seq: u64,
        token: Token,
    ) -> Response {
        let id = if let Some(h) = self.channel(channel).handles.get(&token) {
            h.object
        } else if let Some(id) = self.pool.find(token) {
            id
        } else if let Some(target) = self.vouchers.peek_target(token) {
            // Chaining off an existing voucher; the old one stays live.
            target
        } else {
            return Response::new(seq, Status::NoSuchObject);
        };

        let vtok = self.tokens.next_token();
        self.pool.retain(id);
        let now = self.clock.now();
        self.vouchers.enqueue(vtok, id, now);
        trace!(channel = %channel, voucher = %vtok, "voucher created");
        Response::new(seq, Status::Ok).with_token(vtok)
    }

    /// Drop a voucher without opening its target. On an ordinary object
    /// token this is an idempotent no-op answering with the object's own
    /// token.
    pub(crate) fn op_discard_voucher(
        &mut self,
        channel: ChannelId,
        seq: u64,
        token: Token,
    ) -> Response {
        if let Some(voucher) = self.vouchers.remove(token) {
            let target_token = self.pool.obj(voucher.target).token;
            self.pool.release(voucher.target);
            debug!(channel = %channel, voucher = %token, "voucher discarded");
            return Response::new(seq, Status::Ok).with_token(target_token);
        }
        let id = if let Some(h) = self.channel(channel).handles.get(&token) {
            Some(h.object)
        } else {
            self.pool.find(token)
        };
        match id {
            Some(id) => Response::new(seq, Status::Ok).with_token(self.pool.obj(id).token),
            None => Response::new(seq, Status::NoSuchObject),
        }
    }

    /// Full unwind of a disconnecting channel, staged across all of its
    /// handles: drop parked work silently, close out open grants (other
    /// channels' waits resolve normally), then release every remaining
    /// reference.
    pub(crate) fn teardown_channel(&mut self, channel: ChannelId) {
        let keys: Vec<Token> = self.channel(channel).handles.keys().copied().collect();
        debug!(channel = %channel, handles = keys.len(), "channel teardown");

        // First pass: pin every handle and drop all of this channel's
        // parked work. None of its waits may still be live once opens
        // start closing below: a fired wait-unpublish rekeys its handle
        // out from under the collected key list.
        for &token in &keys {
            let handle = self.handle_mut(channel, token);
            let id = handle.object;
            // Pin the handle so the staged unwind can't destroy it mid-pass.
            handle.refs += 1;
            self.pool.retain(id);

            let href = HandleRef { channel, token };
            let parked = self.detach_pending_opens(id, href);
            for _ in 0..parked {
                self.release_handle_ref(channel, token);
            }
            self.detach_sole_wait(id, href);
        }

        // Second pass: close out open grants (other channels' waits
        // resolve normally), then release every remaining reference.
        for token in keys {
            let id = self.handle_mut(channel, token).object;
            while self.handle_mut(channel, token).opens > 0 {
                self.close_one_open(channel, token, id);
            }

            while self.channel(channel).handles.contains_key(&token) {
                self.release_handle_ref(channel, token);
            }
        }
    }

    /// The event half of closing one open grant: decrement both open
    /// counts and resolve whatever that makes resolvable. Returns the key
    /// the closing handle now lives under, which changes when the close
    /// fires that handle's own wait-unpublish.
    fn close_one_open(&mut self, channel: ChannelId, token: Token, id: ObjectId) -> Token {
        let handle = self.handle_mut(channel, token);
        debug_assert!(handle.opens > 0);
        handle.opens -= 1;
        let handle_opens = handle.opens;

        let (writer_abandons, obj_opens) = {
            let obj = self.pool.obj_mut(id);
            assert!(obj.opens > 0, "open count underflow on object {id}");
            obj.opens -= 1;
            let abandons = obj.writer == Some(channel) && handle_opens == 0;
            if abandons {
                obj.writer = None;
            }
            (abandons, obj.opens)
        };

        if writer_abandons {
            // Nobody can publish this object anymore; parked wait-opens
            // can only fail now.
            debug!(id = %id, channel = %channel, "writer abandoned object");
            self.fire_publish_waits(id, false);
        }

        if let Some(waiter) = self.pool.obj(id).sole_waiter {
            if waiter.channel == channel && waiter.token == token && handle_opens == 0 {
                // The waiter dropped its own access; sole ownership can
                // never arrive.
                self.cancel_sole_wait(id);
            } else if obj_opens == 1 {
                // The waiter's open is the only one left.
                let rekeyed = self.fire_sole_wait(id);
                if waiter.channel == channel && waiter.token == token {
                    return rekeyed;
                }
            }
        }
        token
    }

    /// Rebind an object to a fresh token with `href`'s channel as its
    /// exclusive writer, and move that channel's handle entry to the new
    /// key. Shared by the immediate and the parked unpublish paths.
    pub(crate) fn reclaim_for_writer(
        &mut self,
        id: ObjectId,
        href: HandleRef,
        clear: bool,
    ) -> Token {
        let new_token = self.tokens.next_token();
        self.pool.rekey(id, new_token);
        if clear {
            self.pool.clear(id);
        }
        let obj = self.pool.obj_mut(id);
        obj.published = false;
        obj.writer = Some(href.channel);
        debug!(id = %id, channel = %href.channel, new_token = %new_token, "object reclaimed for writing");

        let ch = self.channel_mut(href.channel);
        let Some(handle) = ch.handles.shift_remove(&href.token) else {
            panic!("reclaim without a handle entry");
        };
        let prev = ch.handles.insert(new_token, handle);
        debug_assert!(prev.is_none(), "token key collision");
        new_token
    }

    /// Get-or-create the handle this channel tracks `id` under.
    fn handle_entry(&mut self, channel: ChannelId, key: Token, id: ObjectId) -> &mut Handle {
        let ch = self.channel_mut(channel);
        let handle = ch.handles.entry(key).or_insert_with(|| Handle::new(id));
        debug_assert_eq!(handle.object, id, "token key collision");
        handle
    }
}

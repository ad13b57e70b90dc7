//! The object pool: token-addressed objects carved from one arena.
//!
//! The pool owns every live object's bookkeeping entry and the allocator
//! that positions objects inside the arena segment. It knows nothing about
//! channels or waiting: it counts references, maps tokens to objects, and
//! destroys an object the instant its global refcount reaches zero.

use crate::alloc::Allocator;
use crate::broker::ChannelId;
use crate::handle::HandleRef;
use crate::protocol::SharePolicy;
use crate::segment::Segment;
use crate::token::Token;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Stable internal identity of one pool object.
///
/// Tokens change over an object's lifetime (every unpublish mints a new
/// one); ids never do. Handles and vouchers reference objects by id, so a
/// rekey is a single index update and nothing dangles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ObjectId(u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
impl ObjectId {
    pub(crate) fn test_id(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lifecycle mode, derived from policy and publication state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Unpublished standard object: exclusive to its writer (or to nobody,
    /// if the writer went away before publishing).
    Writing,
    /// Published standard object: open to all, immutable by convention.
    Published,
    /// Share-mutable object: open to all from birth, never published.
    ShareMutable,
}

/// Bookkeeping entry for one object.
///
/// `refs` counts every reason the object must stay alive: handle references
/// across all channels plus live vouchers targeting it. `opens` counts
/// actual access grants and can only be lower.
pub(crate) struct Object {
    /// Current client-visible name.
    pub(crate) token: Token,
    /// Arena byte offset (may move on resize).
    pub(crate) offset: u64,
    /// Size in bytes.
    pub(crate) size: u64,
    /// Sharing discipline, fixed at creation.
    pub(crate) policy: SharePolicy,
    /// Whether a standard object is currently published.
    pub(crate) published: bool,
    /// Global reference count.
    pub(crate) refs: u32,
    /// Global open count.
    pub(crate) opens: u32,
    /// Channel holding exclusive write access; set only while unpublished.
    pub(crate) writer: Option<ChannelId>,
    /// Handles parked in wait-opens, in registration order.
    pub(crate) publish_waiters: SmallVec<[HandleRef; 2]>,
    /// Handle parked in a wait-unpublish, if any.
    pub(crate) sole_waiter: Option<HandleRef>,
}

impl Object {
    pub(crate) fn mode(&self) -> Mode {
        match self.policy {
            SharePolicy::ShareMutable => Mode::ShareMutable,
            SharePolicy::Standard if self.published => Mode::Published,
            SharePolicy::Standard => Mode::Writing,
        }
    }

    /// Whether opens are currently refused (standard policy, unpublished).
    pub(crate) fn is_open_gated(&self) -> bool {
        self.policy.is_gated() && !self.published
    }
}

/// Token-addressed object storage over one arena.
pub(crate) struct Pool {
    segment: Arc<dyn Segment>,
    alloc: Box<dyn Allocator>,
    entries: HashMap<ObjectId, Object>,
    index: HashMap<Token, ObjectId>,
    next_id: u64,
}

impl Pool {
    pub(crate) fn new(segment: Arc<dyn Segment>, alloc: Box<dyn Allocator>) -> Self {
        Self {
            segment,
            alloc,
            entries: HashMap::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.alloc.free_bytes()
    }

    pub(crate) fn segment(&self) -> &Arc<dyn Segment> {
        &self.segment
    }

    /// Look up an object by its current token.
    pub(crate) fn find(&self, token: Token) -> Option<ObjectId> {
        self.index.get(&token).copied()
    }

    pub(crate) fn obj(&self, id: ObjectId) -> &Object {
        match self.entries.get(&id) {
            Some(obj) => obj,
            None => panic!("stale object id {id}"),
        }
    }

    pub(crate) fn obj_mut(&mut self, id: ObjectId) -> &mut Object {
        match self.entries.get_mut(&id) {
            Some(obj) => obj,
            None => panic!("stale object id {id}"),
        }
    }

    /// Allocate arena space and create the object with one birth reference
    /// and no opens. Returns `None` when the arena is exhausted.
    pub(crate) fn create(
        &mut self,
        token: Token,
        size: u64,
        clear: bool,
        policy: SharePolicy,
    ) -> Option<ObjectId> {
        let offset = self.alloc.alloc(size, clear)?;
        let id = ObjectId(self.next_id);
        self.next_id += 1;

        debug_assert!(!self.index.contains_key(&token), "token already bound");
        self.entries.insert(
            id,
            Object {
                token,
                offset,
                size,
                policy,
                published: false,
                refs: 1,
                opens: 0,
                writer: None,
                publish_waiters: SmallVec::new(),
                sole_waiter: None,
            },
        );
        self.index.insert(token, id);

        debug!(id = %id, token = %token, size, offset, policy = %policy, "object created");
        Some(id)
    }

    /// Resize an object in the arena. On success the offset may have moved;
    /// on failure the object is untouched.
    pub(crate) fn resize(&mut self, id: ObjectId, new_size: u64) -> bool {
        let Some(obj) = self.entries.get_mut(&id) else {
            panic!("stale object id {id}");
        };
        match self.alloc.realloc(obj.offset, new_size) {
            Some(new_offset) => {
                debug!(
                    id = %id,
                    old_size = obj.size,
                    new_size,
                    moved = new_offset != obj.offset,
                    "object resized"
                );
                obj.offset = new_offset;
                obj.size = new_size;
                true
            }
            None => false,
        }
    }

    /// Rebind the object under a fresh token.
    pub(crate) fn rekey(&mut self, id: ObjectId, new_token: Token) {
        let Some(obj) = self.entries.get_mut(&id) else {
            panic!("stale object id {id}");
        };
        let old = std::mem::replace(&mut obj.token, new_token);
        let removed = self.index.remove(&old);
        debug_assert_eq!(removed, Some(id));
        self.index.insert(new_token, id);
        debug!(id = %id, old_token = %old, new_token = %new_token, "object rekeyed");
    }

    /// Zero the object's bytes through the segment.
    pub(crate) fn clear(&mut self, id: ObjectId) {
        let obj = self.obj(id);
        let Some(base) = self.segment.as_mut_ptr() else {
            debug_assert!(false, "clearing through a read-only segment");
            return;
        };
        // SAFETY: object ranges come from the allocator and lie inside
        // the segment.
        unsafe { std::ptr::write_bytes(base.add(obj.offset as usize), 0, obj.size as usize) };
    }

    /// Add one global reference.
    pub(crate) fn retain(&mut self, id: ObjectId) {
        let obj = self.obj_mut(id);
        obj.refs += 1;
        trace!(id = %id, refs = obj.refs, "retain");
    }

    /// Drop one global reference; destroy the object at zero.
    ///
    /// Returns true if this release destroyed the object.
    pub(crate) fn release(&mut self, id: ObjectId) -> bool {
        let obj = self.obj_mut(id);
        assert!(obj.refs > 0, "refcount underflow on object {id}");
        obj.refs -= 1;
        trace!(id = %id, refs = obj.refs, "release");
        if obj.refs == 0 {
            self.destroy(id);
            true
        } else {
            false
        }
    }

    fn destroy(&mut self, id: ObjectId) {
        let Some(obj) = self.entries.remove(&id) else {
            panic!("stale object id {id}");
        };
        assert_eq!(obj.refs, 0, "object {id} destroyed with live references");
        assert_eq!(obj.opens, 0, "object {id} destroyed while open");
        assert!(
            obj.publish_waiters.is_empty() && obj.sole_waiter.is_none(),
            "object {id} destroyed with parked waiters"
        );

        let removed = self.index.remove(&obj.token);
        debug_assert_eq!(removed, Some(id));
        self.alloc.free(obj.offset);
        debug!(id = %id, token = %obj.token, "object destroyed");
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ObjectId, &Object)> {
        self.entries.iter().map(|(&id, obj)| (id, obj))
    }
}

//! Transferable vouchers and their expiration queue.
//!
//! A voucher is a claim on an object under a token of its own: it holds one
//! reference on its target so the target outlives the hand-off, and it
//! expires if nobody redeems it. The queue keeps vouchers ordered by
//! expiration in an owned set (no intrusive links) and drives exactly one
//! armed deadline on its [`Timer`]: front expiration plus a batching delay,
//! so a burst of vouchers is swept in one pass instead of one wakeup each.

use crate::clock::{ClockTime, Timer};
use crate::pool::{ObjectId, Pool};
use crate::token::Token;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// One live voucher.
pub(crate) struct Voucher {
    /// Object the voucher holds a reference on.
    pub(crate) target: ObjectId,
    /// Absolute expiration time.
    pub(crate) expires_at: ClockTime,
}

/// Expiration-ordered voucher storage.
pub(crate) struct VoucherQueue {
    entries: HashMap<Token, Voucher>,
    /// Expiration order; `BTreeSet` because (time, token) pairs are unique.
    order: BTreeSet<(ClockTime, Token)>,
    timer: Box<dyn Timer>,
    ttl: ClockTime,
    batch_delay: ClockTime,
    /// Deadline currently armed on the timer, to skip redundant re-arms.
    armed: Option<ClockTime>,
}

impl VoucherQueue {
    pub(crate) fn new(ttl: ClockTime, batch_delay: ClockTime, timer: Box<dyn Timer>) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeSet::new(),
            timer,
            ttl,
            batch_delay,
            armed: None,
        }
    }

    /// Issue a voucher for `target` under `token`, expiring ttl from `now`.
    ///
    /// The caller has already taken the target reference the voucher holds.
    pub(crate) fn enqueue(&mut self, token: Token, target: ObjectId, now: ClockTime) -> ClockTime {
        let expires_at = now.saturating_add(self.ttl);
        let prev = self.entries.insert(token, Voucher { target, expires_at });
        debug_assert!(prev.is_none(), "voucher token reused");
        self.order.insert((expires_at, token));
        debug!(voucher = %token, target = %target, expires = %expires_at, "voucher issued");
        self.rearm();
        expires_at
    }

    /// Target of a voucher, without consuming it.
    pub(crate) fn peek_target(&self, token: Token) -> Option<ObjectId> {
        self.entries.get(&token).map(|v| v.target)
    }

    /// Consume a voucher. The caller takes over its target reference.
    pub(crate) fn remove(&mut self, token: Token) -> Option<Voucher> {
        let voucher = self.entries.remove(&token)?;
        let removed = self.order.remove(&(voucher.expires_at, token));
        debug_assert!(removed, "voucher queue desync");
        trace!(voucher = %token, "voucher consumed");
        self.rearm();
        Some(voucher)
    }

    /// Release every voucher due at or before `now`. Each drops its target
    /// reference (which may destroy the target).
    pub(crate) fn expire_due(&mut self, now: ClockTime, pool: &mut Pool) -> usize {
        let mut expired = 0;
        while let Some(&(expires_at, token)) = self.order.first() {
            if expires_at > now {
                break;
            }
            self.order.pop_first();
            let Some(voucher) = self.entries.remove(&token) else {
                panic!("voucher queue desync at {token}");
            };
            debug!(voucher = %token, target = %voucher.target, "voucher expired");
            pool.release(voucher.target);
            expired += 1;
        }
        if expired > 0 {
            self.rearm();
        }
        expired
    }

    /// Release every voucher regardless of age (shutdown path).
    pub(crate) fn drain_all(&mut self, pool: &mut Pool) -> usize {
        let count = self.entries.len();
        for (token, voucher) in self.entries.drain() {
            trace!(voucher = %token, target = %voucher.target, "voucher force-expired");
            pool.release(voucher.target);
        }
        self.order.clear();
        self.rearm();
        count
    }

    /// When the next sweep is due: front expiration plus the batching
    /// delay. `None` while the queue is empty.
    pub(crate) fn next_deadline(&self) -> Option<ClockTime> {
        self.order
            .first()
            .map(|&(expires_at, _)| expires_at.saturating_add(self.batch_delay))
    }

    /// Swap in a different timer backend; re-arms from scratch.
    pub(crate) fn set_timer(&mut self, timer: Box<dyn Timer>) {
        self.timer = timer;
        self.armed = None;
        self.rearm();
    }

    /// Vouchers currently targeting `id` (audit support).
    pub(crate) fn count_targeting(&self, id: ObjectId) -> u32 {
        self.entries.values().filter(|v| v.target == id).count() as u32
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reconcile the armed deadline with the current front.
    fn rearm(&mut self) {
        let desired = self.next_deadline();
        if desired != self.armed {
            match desired {
                Some(deadline) => self.timer.arm(deadline),
                None => self.timer.disarm(),
            }
            self.armed = desired;
        }
    }
}

impl Drop for VoucherQueue {
    fn drop(&mut self) {
        self.timer.disarm();
    }
}

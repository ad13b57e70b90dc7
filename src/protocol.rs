//! Request and response types for the broker's operation surface.
//!
//! These are in-process types: framing, serialization, and descriptor
//! passing belong to the transport layer the broker is embedded in. The
//! request set is a closed enum on purpose, so adding an operation is a
//! compile-checked change to every dispatch site.

use crate::token::Token;

/// Version tag clients present in [`Request::Hello`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Sharing discipline of an object, fixed at allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SharePolicy {
    /// Single-writer lifecycle: exclusive until published, immutable-by-
    /// convention while published, recyclable via unpublish.
    Standard,
    /// Mutable by all holders from the start; never published, never
    /// write-gated.
    ShareMutable,
}

impl SharePolicy {
    /// Whether objects of this policy go through the publication protocol.
    #[inline]
    pub fn is_gated(self) -> bool {
        matches!(self, SharePolicy::Standard)
    }
}

impl std::fmt::Display for SharePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharePolicy::Standard => write!(f, "standard"),
            SharePolicy::ShareMutable => write!(f, "share-mutable"),
        }
    }
}

/// Outcome code carried by every [`Response`].
///
/// These are the only failures request traffic can produce. Anything else
/// (count underflow, dangling ids) is an internal bug and aborts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation succeeded.
    Ok,
    /// The token resolves to nothing visible to this channel.
    NoSuchObject,
    /// The requested segment index does not exist.
    NoSuchSegment,
    /// The object exists but its current mode forbids the operation.
    ObjectBusy,
    /// The arena cannot satisfy the allocation.
    OutOfMemory,
    /// The request is malformed or not valid in this state.
    InvalidRequest,
}

impl Status {
    /// True for [`Status::Ok`].
    #[inline]
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::NoSuchObject => "no-such-object",
            Status::NoSuchSegment => "no-such-segment",
            Status::ObjectBusy => "object-busy",
            Status::OutOfMemory => "out-of-memory",
            Status::InvalidRequest => "invalid-request",
        };
        f.write_str(s)
    }
}

/// One client request.
///
/// Every request is answered exactly once: immediately, or (for the
/// waitable forms) later through the completion outbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// Handshake; must be the first request on a channel.
    Hello {
        /// Client's protocol version; must equal [`PROTOCOL_VERSION`].
        version: u32,
    },
    /// Query an arena segment. The broker serves a single segment, index 0.
    GetSegment {
        /// Segment index.
        index: u32,
    },
    /// Allocate a fresh object; the caller becomes its exclusive writer
    /// (standard policy) or just its first holder (share-mutable).
    Alloc {
        /// Object size in bytes; must be non-zero.
        size: u64,
        /// Zero the object's memory before returning it.
        clear: bool,
        /// Sharing discipline, fixed for the object's lifetime.
        policy: SharePolicy,
    },
    /// Acquire an object by token (or by voucher token).
    Open {
        /// Token to resolve: an object's current token, the token of a
        /// handle this channel already holds, or a voucher token.
        token: Token,
        /// Expected policy; a mismatch resolves to nothing.
        policy: SharePolicy,
        /// Park the request until publication instead of failing busy.
        wait: bool,
    },
    /// Release one reference (and one open, if any) on a handle.
    Close {
        /// Token naming the handle to close.
        token: Token,
    },
    /// Make an unpublished standard object visible to other channels.
    /// Writer-only.
    Publish {
        /// Token of the object to publish.
        token: Token,
    },
    /// Reclaim a published object for exclusive writing under a fresh
    /// token. Requires sole ownership (or `wait` to park for it).
    Unpublish {
        /// Token of the object to reclaim.
        token: Token,
        /// Zero the object's memory on success.
        clear: bool,
        /// Park until this channel's open is the only one instead of
        /// failing busy.
        wait: bool,
    },
    /// Change the size of an unpublished object. Writer-only; the object
    /// may move within the arena.
    Resize {
        /// Token of the object to resize.
        token: Token,
        /// New size in bytes; must be non-zero.
        new_size: u64,
    },
    /// Mint a transferable claim on an object.
    CreateVoucher {
        /// Token (or voucher token) of the target object.
        token: Token,
    },
    /// Redeem-and-drop a voucher without opening the target.
    DiscardVoucher {
        /// Voucher token (or, idempotently, an ordinary object token).
        token: Token,
    },
}

impl Request {
    /// Short operation name, for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::GetSegment { .. } => "get-segment",
            Request::Alloc { .. } => "alloc",
            Request::Open { .. } => "open",
            Request::Close { .. } => "close",
            Request::Publish { .. } => "publish",
            Request::Unpublish { .. } => "unpublish",
            Request::Resize { .. } => "resize",
            Request::CreateVoucher { .. } => "create-voucher",
            Request::DiscardVoucher { .. } => "discard-voucher",
        }
    }
}

/// Reply to one request, immediate or deferred.
///
/// Which optional fields are present depends on the operation; absent
/// fields are `None` rather than sentinel values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    /// Sequence number of the request this answers.
    pub seq: u64,
    /// Outcome code.
    pub status: Status,
    /// Token result: the handle's token for opens, the fresh token for
    /// unpublish, the voucher token for create-voucher.
    pub token: Option<Token>,
    /// Arena byte offset of the object, when the operation grants access.
    pub offset: Option<u64>,
    /// Object size in bytes, when the operation grants access (also the
    /// arena size for get-segment).
    pub size: Option<u64>,
}

impl Response {
    /// A response with no result fields.
    pub fn new(seq: u64, status: Status) -> Self {
        Self {
            seq,
            status,
            token: None,
            offset: None,
            size: None,
        }
    }

    /// Attach a token result.
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Attach the object's arena placement.
    pub fn with_extent(mut self, offset: u64, size: u64) -> Self {
        self.offset = Some(offset);
        self.size = Some(size);
        self
    }

    /// Attach a size alone, for operations that report no placement.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// True if the status is [`Status::Ok`].
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

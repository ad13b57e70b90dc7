//! # Depot
//!
//! A single-threaded broker for sharing memory objects between local
//! clients through one common arena.
//!
//! Depot carves objects out of a single memory segment and hands clients
//! opaque tokens instead of pointers. Clients map the arena once (memfd +
//! fd passing) and then exchange only tokens and offsets with the broker,
//! so object contents never cross the connection.
//!
//! ## Features
//!
//! - **One arena, many objects**: a pluggable sub-allocator places objects
//!   in a single segment clients map up front
//! - **Single-writer publishing**: standard objects are exclusive to their
//!   writer until published, then immutable and open to all
//! - **Recyclable memory**: unpublish reclaims a published object for
//!   rewriting under a fresh token once the caller is its only user
//! - **Transferable vouchers**: expiring claims that move objects between
//!   clients that share no channel
//! - **Waitable operations**: opens can wait for publication and reclaims
//!   for sole ownership; parked requests complete through a queue
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use depot::prelude::*;
//!
//! let mut broker = Broker::with_memfd(64 << 20, BrokerConfig::default())?;
//! let ch = broker.open_channel();
//! broker.dispatch(ch, 1, Request::Hello { version: PROTOCOL_VERSION });
//!
//! // Allocate, fill (via the mapped arena), publish.
//! let reply = broker
//!     .dispatch(ch, 2, Request::Alloc { size: 4096, clear: true, policy: SharePolicy::Standard })
//!     .into_reply()
//!     .unwrap();
//! let token = reply.token.unwrap();
//! broker.dispatch(ch, 3, Request::Publish { token });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod alloc;
pub mod broker;
pub mod clock;
pub mod error;
pub mod protocol;
pub mod segment;
pub mod token;

mod channel;
mod handle;
mod pool;
mod voucher;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::broker::{Broker, BrokerConfig, ChannelId, Completion, Outcome};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{Request, Response, SharePolicy, Status, PROTOCOL_VERSION};
    pub use crate::segment::{Segment, SegmentDescriptor};
    pub use crate::token::Token;
}

pub use error::{Error, Result};

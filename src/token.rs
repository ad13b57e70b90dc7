//! Object tokens and the sequence that mints them.
//!
//! A [`Token`] is the client-visible name of an object: a non-zero 64-bit
//! value. Zero is reserved as the wire-level "no token" encoding, so the
//! type is built on [`NonZeroU64`] and `Option<Token>` costs nothing.
//!
//! Tokens come from a [`TokenSequence`], a seeded xorshift64 generator that
//! walks every non-zero 64-bit value exactly once before repeating. Each
//! broker owns its own sequence; nothing here is global.

use std::num::NonZeroU64;

/// Fallback xorshift seed when no usable entropy is available.
const FALLBACK_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Client-visible name of one pool object (or of a voucher).
///
/// Tokens are minted fresh for every allocation, publication cycle, and
/// voucher; they are never reused while the previous binding is visible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Token(NonZeroU64);

impl Token {
    /// Build a token from its wire representation.
    ///
    /// Returns `None` for zero, which encodes "no token".
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// The wire representation.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Seeded token generator (xorshift64, shifts 13/7/17).
///
/// The recurrence is a permutation of the non-zero 64-bit values with full
/// period 2^64 - 1, so two live tokens from one sequence never collide.
/// Predictability is not a defect here: the broker trusts its clients and
/// tokens are names, not capabilities.
#[derive(Debug)]
pub struct TokenSequence {
    state: u64,
}

impl TokenSequence {
    /// Create a sequence from an explicit seed (0 falls back to a fixed one).
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { FALLBACK_SEED } else { seed },
        }
    }

    /// Create a sequence seeded from wall-clock time and the process id.
    pub fn from_entropy() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let pid = u64::from(std::process::id());
        Self::new(nanos ^ (pid << 32))
    }

    /// Mint the next token.
    pub fn next_token(&mut self) -> Token {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        match NonZeroU64::new(x) {
            Some(n) => Token(n),
            // Zero is a fixed point of the recurrence and is never entered
            // from a non-zero state.
            None => unreachable!("xorshift64 state became zero"),
        }
    }
}

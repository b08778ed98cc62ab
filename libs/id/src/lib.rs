//! # portshare-id
//!
//! Identifier types shared by the primary and worker sides of the port
//! broker.
//!
//! ## Token Format
//!
//! Correlation ids are short random tokens drawn from an unambiguous
//! alphanumeric alphabet (no `0`, `O`, `1`, `l` or `I`), so they survive
//! being read out of a log line and typed back in:
//!
//! - `Xk4fQ9mT2a`
//! - `hR7pWz3NcE`
//!
//! Ten characters over a 57-symbol alphabet gives roughly 58 bits of
//! randomness, which keeps collisions negligible at any realistic number
//! of concurrently pending requests.
//!
//! Worker ids are small integers assigned by the process group in spawn
//! order.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Symbols a token may contain. Visually ambiguous characters are excluded.
pub const ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Returns true if `b` is a valid token symbol.
pub fn is_token_byte(b: u8) -> bool {
    ALPHABET.contains(&b)
}

/// Re-export rand so the token macro resolves it from any crate.
#[doc(hidden)]
pub use rand;

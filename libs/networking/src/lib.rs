//! Port allocation utilities for the broker.
//!
//! This library provides:
//! - `PortRange`, a validated inclusive range of TCP ports
//! - `PortAllocator`, the candidate-selection policy for ephemeral ports
//! - A bounded allocation loop that turns a saturated range into an
//!   explicit `PoolExhausted` error instead of spinning forever
//!
//! ## Boundary semantics
//!
//! An explicit port is accepted when it lies in the closed interval
//! `[low, high]`. Ephemeral candidates are drawn from the half-open span
//! `[low, high)`, so `high` is never chosen at random; a degenerate range
//! (`low == high`) has the single candidate `low`. Port `0` never belongs
//! to a range: binding it means "any port", which would escape the bounds.

use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of candidates tried before an allocation gives up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 64;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Range bounds are inverted.
    #[error("invalid port range: low {low} exceeds high {high}")]
    InvalidRange { low: u16, high: u16 },

    /// Port `0` asks the OS for any port, so it cannot bound a range.
    #[error("invalid port range: {low}-{high} includes port 0")]
    ZeroPort { low: u16, high: u16 },

    /// Range could not be parsed from text.
    #[error("invalid port range syntax: {0}")]
    InvalidSyntax(String),

    /// Explicit port outside the configured range.
    #[error("port {port} not in range {low}-{high}")]
    OutOfRange { port: u16, low: u16, high: u16 },

    /// No free candidate was found within the attempt budget.
    #[error("port pool exhausted: {range} after {attempts} attempts")]
    PoolExhausted { range: String, attempts: usize },
}

// ============================================================================
// Port Range
// ============================================================================

/// Inclusive range of TCP ports. Invariant: `1 <= low <= high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange")]
pub struct PortRange {
    low: u16,
    high: u16,
}

/// Unvalidated wire form of a range.
#[derive(Deserialize)]
struct RawPortRange {
    low: u16,
    high: u16,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = NetworkError;

    fn try_from(raw: RawPortRange) -> Result<Self, Self::Error> {
        PortRange::new(raw.low, raw.high)
    }
}

impl PortRange {
    /// Create a new range.
    pub fn new(low: u16, high: u16) -> Result<Self, NetworkError> {
        if low > high {
            return Err(NetworkError::InvalidRange { low, high });
        }
        if low == 0 {
            return Err(NetworkError::ZeroPort { low, high });
        }
        Ok(Self { low, high })
    }

    /// Lowest port of the range.
    pub fn low(&self) -> u16 {
        self.low
    }

    /// Highest port of the range.
    pub fn high(&self) -> u16 {
        self.high
    }

    /// Check if an explicit port lies within `[low, high]`.
    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }

    /// Validate an explicitly requested port.
    pub fn validate(&self, port: u16) -> Result<(), NetworkError> {
        if self.contains(port) {
            Ok(())
        } else {
            Err(NetworkError::OutOfRange {
                port,
                low: self.low,
                high: self.high,
            })
        }
    }

    /// Number of distinct ephemeral candidates (`high - low`, at least 1).
    pub fn span(&self) -> usize {
        usize::from(self.high - self.low).max(1)
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

impl FromStr for PortRange {
    type Err = NetworkError;

    /// Parse from `low-high` notation (e.g., "5000-5010").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((low, high)) = s.trim().split_once('-') else {
            return Err(NetworkError::InvalidSyntax(format!(
                "missing '-' in range: {}",
                s
            )));
        };

        let low = low
            .trim()
            .parse::<u16>()
            .map_err(|_| NetworkError::InvalidSyntax(format!("low bound not numeric: {}", low)))?;
        let high = high.trim().parse::<u16>().map_err(|_| {
            NetworkError::InvalidSyntax(format!("high bound not numeric: {}", high))
        })?;

        Self::new(low, high)
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Candidate-selection policy for ephemeral ports.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    /// Maximum number of candidates tried per allocation.
    max_attempts: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl PortAllocator {
    /// Create an allocator with the given attempt budget (at least 1).
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Get the attempt budget.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Pick one candidate uniformly from `[low, high)`.
    pub fn choose_candidate(&self, range: &PortRange) -> u16 {
        Self::choose_with(&mut rand::rng(), range)
    }

    /// Pick one candidate using the given RNG.
    pub fn choose_with<R: Rng + ?Sized>(rng: &mut R, range: &PortRange) -> u16 {
        if range.low == range.high {
            return range.low;
        }
        rng.random_range(range.low..range.high)
    }

    /// Distinct candidates in random order, at most `max_attempts` of them.
    ///
    /// Each draw is uniform over the candidates not yet drawn, so a span no
    /// larger than the budget is tried exhaustively.
    pub fn candidates(&self, range: &PortRange) -> Vec<u16> {
        let span = range.span();
        let amount = span.min(self.max_attempts);
        rand::seq::index::sample(&mut rand::rng(), span, amount)
            .into_iter()
            .map(|offset| range.low + offset as u16)
            .collect()
    }

    /// Run a bounded allocation over the range.
    ///
    /// `try_port` returns `Ok(Some(_))` on success, `Ok(None)` when the
    /// candidate is taken (try the next one) and `Err` to abort.
    pub fn allocate<T, E>(
        &self,
        range: &PortRange,
        mut try_port: impl FnMut(u16) -> Result<Option<T>, E>,
    ) -> Result<T, E>
    where
        E: From<NetworkError>,
    {
        let candidates = self.candidates(range);
        let attempts = candidates.len();

        for port in candidates {
            if let Some(found) = try_port(port)? {
                return Ok(found);
            }
        }

        Err(NetworkError::PoolExhausted {
            range: range.to_string(),
            attempts,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_port_range_rejects_inverted() {
        assert_eq!(
            PortRange::new(6000, 5000),
            Err(NetworkError::InvalidRange {
                low: 6000,
                high: 5000
            })
        );
    }

    #[test]
    fn test_port_range_rejects_port_zero() {
        assert_eq!(
            PortRange::new(0, 0),
            Err(NetworkError::ZeroPort { low: 0, high: 0 })
        );
        assert_eq!(
            PortRange::new(0, 10),
            Err(NetworkError::ZeroPort { low: 0, high: 10 })
        );
        assert!(matches!(
            "0-10".parse::<PortRange>(),
            Err(NetworkError::ZeroPort { .. })
        ));
        assert!(serde_json::from_str::<PortRange>(r#"{"low":0,"high":5}"#).is_err());
        assert!(PortRange::new(1, 1).is_ok());
    }

    #[test]
    fn test_validate_is_two_sided() {
        let range = PortRange::new(5000, 5010).unwrap();
        assert!(range.validate(5000).is_ok());
        assert!(range.validate(5010).is_ok());
        assert!(matches!(
            range.validate(4999),
            Err(NetworkError::OutOfRange { port: 4999, .. })
        ));
        assert!(matches!(
            range.validate(5011),
            Err(NetworkError::OutOfRange { port: 5011, .. })
        ));
    }

    #[test]
    fn test_parse_range() {
        let range: PortRange = "5000-5010".parse().unwrap();
        assert_eq!((range.low(), range.high()), (5000, 5010));
        assert_eq!(range.to_string(), "5000-5010");

        assert!(matches!(
            "5000".parse::<PortRange>(),
            Err(NetworkError::InvalidSyntax(_))
        ));
        assert!(matches!(
            "a-5010".parse::<PortRange>(),
            Err(NetworkError::InvalidSyntax(_))
        ));
        assert!(matches!(
            "5010-5000".parse::<PortRange>(),
            Err(NetworkError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_range_deserialize_validates() {
        let ok: PortRange = serde_json::from_str(r#"{"low":1,"high":2}"#).unwrap();
        assert_eq!(ok.span(), 1);

        assert!(serde_json::from_str::<PortRange>(r#"{"low":3,"high":2}"#).is_err());
        assert!(serde_json::from_str::<PortRange>(r#"{"low":"a","high":2}"#).is_err());
    }

    #[test]
    fn test_degenerate_range_has_one_candidate() {
        let range = PortRange::new(7000, 7000).unwrap();
        let allocator = PortAllocator::default();
        assert_eq!(allocator.choose_candidate(&range), 7000);
        assert_eq!(allocator.candidates(&range), vec![7000]);
    }

    #[test]
    fn test_candidates_cover_small_span() {
        let range = PortRange::new(5000, 5010).unwrap();
        let allocator = PortAllocator::new(64);
        let candidates = allocator.candidates(&range);
        let unique: HashSet<u16> = candidates.iter().copied().collect();
        assert_eq!(candidates.len(), 10);
        assert_eq!(unique, (5000..5010).collect());
    }

    #[test]
    fn test_candidates_bounded_by_budget() {
        let range = PortRange::new(10000, 60000).unwrap();
        let allocator = PortAllocator::new(8);
        assert_eq!(allocator.candidates(&range).len(), 8);
    }

    #[test]
    fn test_allocate_skips_taken_ports() {
        let range = PortRange::new(5000, 5004).unwrap();
        let allocator = PortAllocator::default();
        let taken: HashSet<u16> = [5000, 5001, 5002].into_iter().collect();

        let port: Result<u16, NetworkError> =
            allocator.allocate(&range, |p| Ok((!taken.contains(&p)).then_some(p)));
        assert_eq!(port.unwrap(), 5003);
    }

    #[test]
    fn test_allocate_exhaustion() {
        let range = PortRange::new(5000, 5004).unwrap();
        let allocator = PortAllocator::default();
        let mut tried = 0;

        let result: Result<u16, NetworkError> = allocator.allocate(&range, |_| {
            tried += 1;
            Ok(None)
        });
        assert_eq!(tried, 4);
        assert_eq!(
            result,
            Err(NetworkError::PoolExhausted {
                range: "5000-5004".to_string(),
                attempts: 4
            })
        );
    }

    #[test]
    fn test_allocate_propagates_abort() {
        let range = PortRange::new(5000, 5004).unwrap();
        let allocator = PortAllocator::default();
        let result: Result<u16, NetworkError> = allocator.allocate(&range, |p| {
            Err(NetworkError::InvalidSyntax(format!("boom at {}", p)))
        });
        assert!(matches!(result, Err(NetworkError::InvalidSyntax(_))));
    }

    proptest! {
        #[test]
        fn prop_candidate_within_half_open_span(low in 1u16..=65535, width in 0u16..2000) {
            let high = low.saturating_add(width);
            let range = PortRange::new(low, high).unwrap();
            let port = PortAllocator::default().choose_candidate(&range);
            if low == high {
                prop_assert_eq!(port, low);
            } else {
                prop_assert!(port >= low && port < high);
            }
        }

        #[test]
        fn prop_candidates_distinct_and_in_range(low in 1u16..60000, width in 1u16..300) {
            let range = PortRange::new(low, low + width).unwrap();
            let candidates = PortAllocator::new(64).candidates(&range);
            let unique: HashSet<u16> = candidates.iter().copied().collect();
            prop_assert_eq!(unique.len(), candidates.len());
            prop_assert!(candidates.iter().all(|p| *p >= low && *p < low + width));
        }
    }
}

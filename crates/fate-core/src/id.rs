//! Transaction identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for one FATE transaction.
///
/// Rendered as `FATE:0123456789abcdef`. Ids are dense 64-bit values so they
/// fit a single integer column in durable stores; the generator draws them
/// at random and the store retries `create` on the (vanishingly rare)
/// collision.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FateId(u64);

impl FateId {
    pub const fn from_u64(raw: u64) -> Self {
        FateId(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Parse the canonical `FATE:<16 hex digits>` form.
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.strip_prefix("FATE:")?;
        u64::from_str_radix(hex, 16).ok().map(FateId)
    }
}

impl fmt::Display for FateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FATE:{:016x}", self.0)
    }
}

impl fmt::Debug for FateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FATE:{:016x}", self.0)
    }
}

/// Source of fresh transaction ids.
pub trait FateIdGenerator: Send + Sync {
    fn new_id(&self) -> FateId;
}

/// Default generator: a v4 UUID folded to 64 bits.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidFateIdGenerator;

impl FateIdGenerator for UuidFateIdGenerator {
    fn new_id(&self) -> FateId {
        let (hi, lo) = uuid::Uuid::new_v4().as_u64_pair();
        FateId(hi ^ lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_display_round_trip() {
        let id = FateId::from_u64(0xdead_beef_0000_1234);
        let printed = id.to_string();
        assert_eq!(printed, "FATE:deadbeef00001234");
        assert_eq!(FateId::parse(&printed), Some(id));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(FateId::parse("deadbeef00001234"), None);
        assert_eq!(FateId::parse("FATE:xyz"), None);
    }

    #[test]
    fn test_generator_produces_distinct_ids() {
        let generator = UuidFateIdGenerator;
        let ids: HashSet<_> = (0..10_000).map(|_| generator.new_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }
}

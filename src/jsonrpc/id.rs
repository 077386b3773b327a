//! Correlation identifiers and their cyclic allocator.

use serde_json::Value;

use super::error::{RpcError, RpcResult};
use super::types::integer_value;

/// Reserved upper bound for correlation ids (`2^31 - 1`).
///
/// Ids live in `1..ID_BOUNDARY`; the allocator wraps back to 1 instead of
/// ever handing out this value.
pub const ID_BOUNDARY: u32 = 2_147_483_647;

/// Positive integer tying a request to its result or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u32);

impl CorrelationId {
    pub fn new(raw: u32) -> RpcResult<Self> {
        if raw == 0 || raw >= ID_BOUNDARY {
            return Err(RpcError::InvalidArgument(format!(
                "\"id\" must be in 1..{}, got {}",
                ID_BOUNDARY, raw
            )));
        }
        Ok(Self(raw))
    }

    /// Interpret an inbound `id` member. Anything that is not an integer in
    /// range (strings, negatives, fractions) cannot belong to this session.
    /// `5.0` is the integer 5.
    pub fn from_value(value: &Value) -> Option<Self> {
        let raw = u32::try_from(integer_value(value)?).ok()?;
        Self::new(raw).ok()
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<CorrelationId> for Value {
    fn from(id: CorrelationId) -> Self {
        Value::from(id.0)
    }
}

/// Cyclic source of correlation ids, scoped to one session.
#[derive(Debug)]
pub struct IdAllocator {
    counter: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Start so that the next allocation returns `last + 1`.
    #[cfg(test)]
    fn starting_after(last: u32) -> Self {
        Self { counter: last }
    }

    pub fn next(&mut self) -> CorrelationId {
        self.counter += 1;
        if self.counter >= ID_BOUNDARY {
            self.counter = 1;
        }
        CorrelationId(self.counter)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

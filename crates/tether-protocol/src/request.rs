//! Request identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlates a remote operation with its response frames.
///
/// Every `Request` sent by the broker carries a fresh id; the agent echoes
/// it on the matching `Response` and on any `FileChunk`/`FileDone` frames
/// belonging to the same transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl RequestId {
    /// Create a new request ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Reserved id for unsolicited traffic (registration, heartbeats)
    pub const CONTROL: RequestId = RequestId(0);
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

impl From<u32> for RequestId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_display() {
        let id = RequestId::new(42);
        assert_eq!(format!("{}", id), "req-42");
    }

    #[test]
    fn test_control_id_is_zero() {
        assert_eq!(RequestId::CONTROL.as_u32(), 0);
    }
}

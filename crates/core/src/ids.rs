use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// 128-bit trace identifier split into high and low words, matching the
/// representation the tracing platform hands us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    pub fn parse(input: &str) -> Result<Self> {
        if input.len() != 32 || !input.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(VaultError::InvalidArgument(format!(
                "invalid trace id: {input}"
            )));
        }
        let high = u64::from_str_radix(&input[..16], 16)
            .map_err(|e| VaultError::InvalidArgument(format!("invalid trace id: {e}")))?;
        let low = u64::from_str_radix(&input[16..], 16)
            .map_err(|e| VaultError::InvalidArgument(format!("invalid trace id: {e}")))?;
        Ok(Self { high, low })
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats() {
        let id = TraceId::parse("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
        assert_eq!(id.high, 0x4bf92f3577b34da6);
        assert_eq!(id.low, 0xa3ce929d0e0e4736);
        assert_eq!(id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(TraceId::parse("abc").is_err());
        assert!(TraceId::parse("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_err());
    }
}

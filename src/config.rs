//! Overlay configuration.
//!
//! A node is configured once at construction. Every field has a default, so a
//! JSON file only needs to name what it changes:
//!
//! ```
//! use pastry_overlay::OverlayConfig;
//!
//! let config = OverlayConfig::from_json_str(r#"{ "leaf_set_size": 8 }"#).unwrap();
//! assert_eq!(config.leaf_set_size, 8);
//! assert_eq!(config.base_bit_length, 4);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::id::ID_BITS;

/// Largest leaf set whose capacity fits the u16 on the wire.
pub const MAX_LEAF_SET_SIZE: usize = u16::MAX as usize - 1;

/// Parameters shared by every node of a ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Digit width `b` in bits; the routing table has `160 / b` rows.
    pub base_bit_length: u8,

    /// Total leaf set capacity, split evenly between the two directions.
    pub leaf_set_size: usize,

    /// Candidates kept per routing-table cell.
    pub route_set_max: usize,

    /// Wire version used for outgoing route messages (0 or 1).
    pub route_message_version: u8,

    /// Capacity of the handle-coalescing cache.
    pub handle_cache_capacity: usize,

    /// How long a join attempt waits for an accepted reply.
    pub join_timeout_ms: u64,

    /// Join requests sent before giving up.
    pub join_attempts: u32,

    /// Times a message is re-resolved after a failed send.
    pub max_reroute_attempts: u32,

    /// Routing-table rows walked by nearest-node discovery. `Some(n)` walks
    /// only the `n` highest rows, starting at row `num_rows - n`; `None` walks
    /// every row.
    pub pns_rows_to_use: Option<usize>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            base_bit_length: 4,
            leaf_set_size: 24,
            route_set_max: 1,
            route_message_version: 1,
            handle_cache_capacity: 4096,
            join_timeout_ms: 5000,
            join_attempts: 3,
            max_reroute_attempts: 3,
            pns_rows_to_use: None,
        }
    }
}

impl OverlayConfig {
    /// Check that the parameters describe a usable ring.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = self.base_bit_length as usize;
        if b == 0 || b > 8 || ID_BITS % b != 0 {
            return Err(ConfigError::BaseBitLength(self.base_bit_length));
        }
        if self.leaf_set_size < 2
            || self.leaf_set_size % 2 != 0
            || self.leaf_set_size > MAX_LEAF_SET_SIZE
        {
            return Err(ConfigError::LeafSetSize(self.leaf_set_size));
        }
        if self.route_set_max == 0 {
            return Err(ConfigError::RouteSetMax);
        }
        if self.route_message_version > 1 {
            return Err(ConfigError::RouteMessageVersion(self.route_message_version));
        }
        Ok(())
    }

    /// Number of routing-table rows.
    pub fn num_rows(&self) -> usize {
        ID_BITS / self.base_bit_length.max(1) as usize
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OverlayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_rows(), 40);
        assert_eq!(config.join_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn digit_width_must_divide_identifier_width() {
        let config = OverlayConfig {
            base_bit_length: 3,
            ..OverlayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::BaseBitLength(3)));
    }

    #[test]
    fn odd_leaf_set_is_rejected() {
        let err = OverlayConfig::from_json_str(r#"{ "leaf_set_size": 7 }"#).unwrap_err();
        assert_eq!(err, ConfigError::LeafSetSize(7));
    }

    #[test]
    fn leaf_set_must_fit_the_wire_format() {
        let config = OverlayConfig {
            leaf_set_size: MAX_LEAF_SET_SIZE + 2,
            ..OverlayConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::LeafSetSize(MAX_LEAF_SET_SIZE + 2))
        );
        let config = OverlayConfig {
            leaf_set_size: MAX_LEAF_SET_SIZE,
            ..OverlayConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_round_trip_keeps_every_field() {
        let config = OverlayConfig {
            base_bit_length: 2,
            pns_rows_to_use: Some(3),
            ..OverlayConfig::default()
        };
        let json = config.to_json_string().expect("serializes");
        assert_eq!(OverlayConfig::from_json_str(&json).expect("parses"), config);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            OverlayConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}

//! # Heap Configuration
//!
//! Debug instrumentation knobs and the coalescing policy. Loaded once at
//! startup, usually from a TOML file next to the engine config:
//!
//! ```toml
//! fill_patterns = true
//! uninit_pattern = 0xCD
//! freed_pattern = 0xDD
//! canary = 0xDEADC0DE
//! coalesce = "both"
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{HeapError, HeapResult};

/// How a freed block is merged with its physical neighbours.
///
/// The default, [`CoalesceMode::Both`], is not the legacy free path: that
/// path is [`CoalesceMode::NextThenStop`], which can leave two free blocks
/// side by side. Select it explicitly to reproduce the legacy fragmentation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalesceMode {
    /// Merge with the next neighbour, then with the previous one.
    #[default]
    Both,
    /// Merge with the next neighbour; only try the previous one if that
    /// did not happen. A block between two free neighbours keeps one of
    /// them separate.
    NextThenStop,
}

/// Configuration for a [`crate::Heap`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Fill user regions with `uninit_pattern` on alloc and `freed_pattern`
    /// on free.
    pub fill_patterns: bool,
    /// Byte written over fresh allocations.
    pub uninit_pattern: u8,
    /// Byte written over released allocations.
    pub freed_pattern: u8,
    /// End-of-block sentinel.
    pub canary: u32,
    /// Coalescing policy on free. Defaults to full coalescing, not the
    /// legacy [`CoalesceMode::NextThenStop`].
    pub coalesce: CoalesceMode,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            fill_patterns: true,
            uninit_pattern: 0xCD,
            freed_pattern: 0xDD,
            canary: 0xDEAD_C0DE,
            coalesce: CoalesceMode::Both,
        }
    }
}

impl HeapConfig {
    /// Shipping config: no fill patterns. Canary checks stay on.
    #[must_use]
    pub const fn release() -> Self {
        Self {
            fill_patterns: false,
            uninit_pattern: 0xCD,
            freed_pattern: 0xDD,
            canary: 0xDEAD_C0DE,
            coalesce: CoalesceMode::Both,
        }
    }

    /// Parses and validates a TOML document. Missing keys take their
    /// default value.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] if the document does not parse
    /// or the values are inconsistent.
    pub fn from_toml_str(source: &str) -> HeapResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| HeapError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] when both fill patterns are the
    /// same byte, since use-after-free would then look like use-before-init.
    pub fn validate(&self) -> HeapResult<()> {
        if self.fill_patterns && self.uninit_pattern == self.freed_pattern {
            return Err(HeapError::InvalidConfig(format!(
                "uninit_pattern and freed_pattern are both {:#04x}",
                self.uninit_pattern
            )));
        }
        Ok(())
    }
}

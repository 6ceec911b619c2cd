//! ngramlm-core
//!
//! Reading, storing, scoring and writing statistical N-gram language models.
//!
//! Three file formats are understood: ARPA text (optionally gzipped), the
//! binary DMP dump of trigram models (either byte order, memory-mapped when
//! possible) and a compact bit-packed trie for models of any order. All
//! probabilities are integers in a configurable log base ([`LogMath`]).
//!
//! Public API:
//! - `LanguageModel` - scoring interface shared by single models and sets
//! - `NgramModel` - one model over a classic or trie backend
//! - `ModelSet` - several models, interpolated or switched by name
//! - `LogMath` - integer log arithmetic
//! - `LmConfig` - weights, log base, memory mapping and quantization
pub mod error;
pub use error::{LmError, Result};

pub mod logmath;
pub use logmath::LogMath;

pub mod vocab;
pub use vocab::{Vocabulary, WordId};

pub mod ngram_raw;
pub use ngram_raw::{RawNgram, RawNgramSet};

// Storage building blocks
pub mod bitarr;
pub mod pio;
pub mod sorted_list;
pub mod storage;
pub mod tginfo;
pub use tginfo::CacheStats;

// Backends and file formats
pub mod arpa;
pub mod dmp;
pub mod lm3g;
pub use lm3g::Lm3g;

pub mod quant;
pub use quant::QuantType;

pub mod trie;
pub use trie::TrieLm;

pub mod model;
pub use model::{Backend, FileType, LanguageModel, NgramModel, NgramScore, Weights};

pub mod set;
pub use set::ModelSet;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Settings applied when loading models.
///
/// Missing TOML keys take their defaults.
///
/// # Example
///
/// ```
/// # use ngramlm_core::LmConfig;
/// let config = LmConfig::from_toml_str("lw = 9.5\nwip = 0.7\nquant_bits = 8").unwrap();
/// assert_eq!(config.lw, 9.5);
/// assert_eq!(config.uw, 1.0);
/// assert!(config.mmap);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LmConfig {
    /// Language weight, multiplies every log probability.
    pub lw: f32,
    /// Word insertion penalty, added as `log(wip)` per word.
    pub wip: f32,
    /// Unigram weight; below 1.0 unigrams are mixed with a uniform
    /// distribution.
    pub uw: f32,
    /// Map DMP and trie files instead of reading them when the byte order
    /// allows it.
    pub mmap: bool,

    // Log scale
    pub logbase: f64,
    /// Bytes per entry of the addition table (1, 2 or 4).
    pub log_width: u8,
    pub log_shift: u32,

    /// Bits per quantized trie weight; absent or 0 stores plain floats.
    pub quant_bits: Option<u8>,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            lw: 1.0,
            wip: 1.0,
            uw: 1.0,
            mmap: true,
            logbase: 1.0001,
            log_width: 4,
            log_shift: 0,
            quant_bits: None,
        }
    }
}

impl LmConfig {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| LmError::from(e).with_path(path))?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| LmError::from(e).with_path(path))
    }

    /// Load configuration from TOML string.
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml_string(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Log arithmetic for the configured base, width and shift.
    pub fn log_math(&self) -> Result<Arc<LogMath>> {
        Ok(Arc::new(LogMath::new(self.logbase, self.log_width, self.log_shift)?))
    }

    pub fn quant_type(&self) -> Result<QuantType> {
        QuantType::from_bits(self.quant_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = LmConfig::default();
        config.lw = 7.0;
        config.quant_bits = Some(8);
        let text = config.to_toml_string().unwrap();
        assert_eq!(LmConfig::from_toml_str(&text).unwrap(), config);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lm.toml");
        config.save_toml(&path).unwrap();
        assert_eq!(LmConfig::load_toml(&path).unwrap(), config);
    }

    #[test]
    fn derived_settings() {
        let config = LmConfig::default();
        assert_eq!(config.quant_type().unwrap(), QuantType::None);
        assert_eq!(config.log_math().unwrap().base(), 1.0001);

        let bad = LmConfig {
            logbase: 1.0,
            ..LmConfig::default()
        };
        assert!(bad.log_math().is_err());
        let bad = LmConfig {
            quant_bits: Some(20),
            ..LmConfig::default()
        };
        assert!(bad.quant_type().is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = LmConfig::load_toml("/nonexistent/lm.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lm.toml"));
    }
}

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub(crate) const DEFAULT_INTRO_TITLE: &str = "Introducción";

/// Tunables shared by the parser, the package merger and the live updater.
///
/// Every field has a default so hosts can send a partial JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum distance, in characters, between a section's recorded start
    /// and the structural element that is taken to hold its title.
    pub offset_tolerance: usize,
    /// All-caps lines at or above this length are body text, not titles.
    pub max_caps_title_chars: usize,
    /// Cleaned titles shorter than this never open a section.
    pub min_title_chars: usize,
    /// Title of the implicit order-0 section collecting leading text.
    pub intro_title: String,
    /// Deflate level used when writing merged packages.
    pub compression_level: i64,
    /// `EnvFilter` directive applied when the host asks us to install logging.
    pub log_filter: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            offset_tolerance: 3,
            max_caps_title_chars: 100,
            min_title_chars: 3,
            intro_title: DEFAULT_INTRO_TITLE.to_string(),
            compression_level: 6,
            log_filter: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(trimmed)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(0..=9).contains(&self.compression_level) {
            return Err(EngineError::Config(format!(
                "compressionLevel must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.min_title_chars == 0 {
            return Err(EngineError::Config(
                "minTitleChars must be at least 1".to_string(),
            ));
        }
        if self.max_caps_title_chars <= self.min_title_chars {
            return Err(EngineError::Config(
                "maxCapsTitleChars must exceed minTitleChars".to_string(),
            ));
        }
        if self.intro_title.trim().is_empty() {
            return Err(EngineError::Config("introTitle cannot be empty".to_string()));
        }
        Ok(())
    }
}

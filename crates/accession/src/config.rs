use crate::{Accession, Error, Result};
use std::collections::HashMap;

/// Default number of ids leased per block reservation.
pub const DEFAULT_BLOCK_SIZE: u64 = 1000;

/// Per-category leasing parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CategoryConfig {
    /// Number of ids in each reserved block.
    pub block_size: u64,
    /// Start of the category's first block.
    pub first_value: Accession,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            first_value: 0,
        }
    }
}

/// Exponential backoff applied between reservation attempts that hit a
/// serialization conflict.
///
/// The delay doubles from `initial_delay_ms` after each conflict. Once it
/// would exceed `max_delay_ms` the backoff is exhausted and the generator
/// re-checks its capacity before starting a fresh round.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1,
            max_delay_ms: 64,
        }
    }
}

/// Configuration shared by every generator of a deployment.
///
/// # Example
/// ```
/// use accession::{CategoryConfig, GeneratorConfig};
///
/// let config = GeneratorConfig::default().with_category(
///     "variants",
///     CategoryConfig { block_size: 100, first_value: 1 },
/// );
/// assert_eq!(config.category("variants").unwrap().block_size, 100);
/// assert!(config.category("studies").is_err());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GeneratorConfig {
    pub categories: HashMap<String, CategoryConfig>,
    pub backoff: BackoffConfig,
}

impl GeneratorConfig {
    pub fn with_category(mut self, category: impl Into<String>, config: CategoryConfig) -> Self {
        self.categories.insert(category.into(), config);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Looks up the leasing parameters of `category`.
    ///
    /// # Errors
    /// Returns [`Error::CategoryNotConfigured`] if the category is unknown.
    pub fn category(&self, category: &str) -> Result<&CategoryConfig> {
        self.categories
            .get(category)
            .ok_or_else(|| Error::CategoryNotConfigured {
                category: category.to_owned(),
            })
    }

    /// Checks every value is usable.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for a zero or oversized block size, a
    /// first value whose watermark would underflow or whose first block would
    /// overflow, or an inverted backoff window.
    pub fn validate(&self) -> Result<()> {
        for (name, category) in &self.categories {
            if category.block_size == 0 {
                return Err(Error::InvalidConfig {
                    reason: format!("block_size of category `{name}` must be greater than 0"),
                });
            }
            if category.first_value == Accession::MIN {
                return Err(Error::InvalidConfig {
                    reason: format!("first_value of category `{name}` leaves no room for a watermark"),
                });
            }
            if category.block_size > Accession::MAX as u64 {
                return Err(Error::InvalidConfig {
                    reason: format!(
                        "block_size of category `{name}` must not exceed {}",
                        Accession::MAX
                    ),
                });
            }
            if category
                .first_value
                .checked_add((category.block_size - 1) as Accession)
                .is_none()
            {
                return Err(Error::InvalidConfig {
                    reason: format!("first block of category `{name}` runs past {}", Accession::MAX),
                });
            }
        }
        if self.backoff.initial_delay_ms == 0 {
            return Err(Error::InvalidConfig {
                reason: "initial_delay_ms must be greater than 0".into(),
            });
        }
        if self.backoff.max_delay_ms < self.backoff.initial_delay_ms {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "max_delay_ms ({}) must not be below initial_delay_ms ({})",
                    self.backoff.max_delay_ms, self.backoff.initial_delay_ms
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_block_size() {
        let config = GeneratorConfig::default().with_category(
            "c",
            CategoryConfig {
                block_size: 0,
                first_value: 0,
            },
        );
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn validate_rejects_blocks_that_do_not_fit_the_id_space() {
        for (block_size, first_value) in [
            (u64::MAX, 0),
            (Accession::MAX as u64 + 1, 0),
            (10, Accession::MAX - 5),
        ] {
            let config = GeneratorConfig::default().with_category(
                "c",
                CategoryConfig {
                    block_size,
                    first_value,
                },
            );
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfig { .. })),
                "block_size={block_size} first_value={first_value}"
            );
        }

        let last_block = GeneratorConfig::default().with_category(
            "c",
            CategoryConfig {
                block_size: 10,
                first_value: Accession::MAX - 9,
            },
        );
        last_block.validate().unwrap();
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let config = GeneratorConfig::default().with_backoff(BackoffConfig {
            initial_delay_ms: 10,
            max_delay_ms: 5,
        });
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn unknown_category_is_not_configured() {
        let config = GeneratorConfig::default();
        assert_eq!(
            config.category("missing"),
            Err(Error::CategoryNotConfigured {
                category: "missing".into()
            })
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_partial_json_with_defaults() {
        let config: GeneratorConfig = serde_json::from_str(
            r#"{ "categories": { "variants": { "block_size": 50 } } }"#,
        )
        .unwrap();
        let variants = config.category("variants").unwrap();
        assert_eq!(variants.block_size, 50);
        assert_eq!(variants.first_value, 0);
        assert_eq!(config.backoff, BackoffConfig::default());
        config.validate().unwrap();
    }
}

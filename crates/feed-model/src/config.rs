//! Feed model configuration.

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

/// Upper bound for every page size setting.
pub const MAX_PAGE_SIZE: usize = i32::MAX as usize;

/// Synthetic paging over the first root's children.
///
/// With `initial_page_size` at 0 paging is off and every child is exposed
/// at once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedConfig {
    /// Children exposed before the first synthetic token.
    pub initial_page_size: usize,
    /// Children exposed by each later synthetic token.
    pub page_size: usize,
    /// A page is only split off when at least this many children would follow it.
    pub min_page_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            initial_page_size: 0,
            page_size: 0,
            min_page_size: 0,
        }
    }
}

impl FeedConfig {
    pub fn paged(initial_page_size: usize, page_size: usize, min_page_size: usize) -> Self {
        Self {
            initial_page_size,
            page_size,
            min_page_size,
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|error| FeedError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn paging_enabled(&self) -> bool {
        self.initial_page_size > 0
    }

    fn validate(&self) -> Result<()> {
        if self.paging_enabled() && self.page_size == 0 {
            return Err(FeedError::Config(
                "page_size must be positive when initial_page_size is set".to_string(),
            ));
        }
        let sizes = [
            ("initial_page_size", self.initial_page_size),
            ("page_size", self.page_size),
            ("min_page_size", self.min_page_size),
        ];
        for (name, value) in sizes {
            if value > MAX_PAGE_SIZE {
                return Err(FeedError::Config(format!(
                    "{} must be at most {}, got {}",
                    name, MAX_PAGE_SIZE, value
                )));
            }
        }
        Ok(())
    }
}

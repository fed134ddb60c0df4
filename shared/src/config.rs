use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::selection::DEFAULT_DRAG_THRESHOLD_PX;
use crate::trip_detail::DEFAULT_LOCATION_CACHE_CAPACITY;
use crate::trip_list::TripSort;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/";
pub const DEFAULT_TOAST_DURATION_MS: u32 = 4_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid api_base_url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("drag_threshold_px must be a positive finite number, got {0}")]
    InvalidDragThreshold(String),

    #[error("location_cache_capacity must be > 0")]
    ZeroCacheCapacity,
}

/// Core settings, sent by the shell with `Event::Configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub api_base_url: String,
    pub drag_threshold_px: f64,
    pub location_cache_capacity: usize,
    pub toast_duration_ms: u32,
    pub default_sort: TripSort,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            drag_threshold_px: DEFAULT_DRAG_THRESHOLD_PX,
            location_cache_capacity: DEFAULT_LOCATION_CACHE_CAPACITY,
            toast_duration_ms: DEFAULT_TOAST_DURATION_MS,
            default_sort: TripSort::default(),
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        if !self.drag_threshold_px.is_finite() || self.drag_threshold_px <= 0.0 {
            return Err(ConfigError::InvalidDragThreshold(
                self.drag_threshold_px.to_string(),
            ));
        }
        self.cache_capacity()?;
        Ok(())
    }

    /// Parsed base URL, normalized to end with `/` so relative joins keep
    /// any path prefix.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBaseUrl {
            url: self.api_base_url.clone(),
            reason: reason.to_string(),
        };

        let mut url = Url::parse(self.api_base_url.trim()).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn cache_capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.location_cache_capacity).ok_or(ConfigError::ZeroCacheCapacity)
    }
}

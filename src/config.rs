use std::time::Duration;

use camino::Utf8PathBuf;
use regex::{Regex, RegexBuilder};

use crate::error::PackError;

pub const DEFAULT_GEOSERVER_BASE: &str = "https://geoserver.core-stack.org:8443/geoserver";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 240;
pub const DEFAULT_SLEEP_SECS: f64 = 0.05;
pub const DEFAULT_BACKOFF_SECS: f64 = 2.0;

/// Raw run parameters as collected from the CLI (or a caller), before
/// validation. `resolve` turns this into a [`ResolvedConfig`] with compiled
/// patterns and normalized values.
#[derive(Debug, Clone)]
pub struct PackConfig {
    pub base_url: String,
    pub pack_dir: Utf8PathBuf,
    pub patterns: Vec<String>,
    pub include_rasters: bool,
    pub verify_tls: bool,
    pub discover_only: bool,
    pub force: bool,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub discovery_timeout: Duration,
    pub base_backoff: Duration,
    pub sleep_between: Duration,
    pub concurrency: usize,
}

impl PackConfig {
    pub fn new(base_url: impl Into<String>, pack_dir: Utf8PathBuf, patterns: Vec<String>) -> Self {
        Self {
            base_url: base_url.into(),
            pack_dir,
            patterns,
            include_rasters: false,
            verify_tls: false,
            discover_only: false,
            force: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            discovery_timeout: Duration::from_secs(DEFAULT_DISCOVERY_TIMEOUT_SECS),
            base_backoff: Duration::from_secs_f64(DEFAULT_BACKOFF_SECS),
            sleep_between: Duration::from_secs_f64(DEFAULT_SLEEP_SECS),
            concurrency: 1,
        }
    }

    pub fn resolve(self) -> Result<ResolvedConfig, PackError> {
        let base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(PackError::InvalidBaseUrl("empty URL".to_string()));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(PackError::InvalidBaseUrl(base_url));
        }

        let patterns = if self.patterns.is_empty() {
            default_patterns()
        } else {
            self.patterns
        };
        let compiled = patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| PackError::InvalidPattern {
                        pattern: pattern.clone(),
                        message: err.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, PackError>>()?;

        Ok(ResolvedConfig {
            base_url,
            pack_dir: self.pack_dir,
            raw_patterns: patterns,
            patterns: compiled,
            include_rasters: self.include_rasters,
            verify_tls: self.verify_tls,
            discover_only: self.discover_only,
            force: self.force,
            max_attempts: self.max_attempts.max(1),
            timeout: self.timeout,
            discovery_timeout: self.discovery_timeout,
            base_backoff: self.base_backoff,
            sleep_between: self.sleep_between,
            concurrency: self.concurrency.max(1),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub base_url: String,
    pub pack_dir: Utf8PathBuf,
    pub raw_patterns: Vec<String>,
    pub patterns: Vec<Regex>,
    pub include_rasters: bool,
    pub verify_tls: bool,
    pub discover_only: bool,
    pub force: bool,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub discovery_timeout: Duration,
    pub base_backoff: Duration,
    pub sleep_between: Duration,
    pub concurrency: usize,
}

/// District name prefixes from the original Western Ghats field study; used
/// only when the caller supplies no patterns at all.
pub fn default_patterns() -> Vec<String> {
    vec![
        "dakshina_kannada_".to_string(),
        "chikmagalur_".to_string(),
        "chikkamagaluru_".to_string(),
    ]
}

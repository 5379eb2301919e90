// ABOUTME: Runtime configuration for the sandbox engine
// ABOUTME: Defaults from codebox-config constants, overridable through CODEBOX_* environment variables

use crate::languages::{Language, REGISTRY};
use codebox_config as cfg;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Image for `sandbox_initialize` when the caller names none
    pub default_image: String,
    /// Working directory inside environments and project mount target
    pub work_dir: String,

    // Lifecycle
    pub stop_timeout_secs: u64,
    pub pull_timeout_secs: u64,
    pub progress_interval_ms: u64,

    /// Label namespace applied to every environment this engine creates
    pub label_prefix: String,

    /// Per-language image, overriding the registry
    #[serde(default)]
    pub image_overrides: HashMap<Language, String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            default_image: cfg::DEFAULT_IMAGE.to_string(),
            work_dir: cfg::DEFAULT_WORK_DIR.to_string(),
            stop_timeout_secs: cfg::DEFAULT_STOP_TIMEOUT_SECS,
            pull_timeout_secs: cfg::DEFAULT_PULL_TIMEOUT_SECS,
            progress_interval_ms: cfg::DEFAULT_PROGRESS_INTERVAL_MS,
            label_prefix: cfg::DEFAULT_LABEL_PREFIX.to_string(),
            image_overrides: HashMap::new(),
        }
    }
}

fn parse_or_default<T: FromStr + Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparsable value {:?} for {}", raw, key);
                default
            }
        },
        None => default,
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SandboxSettings {
    /// Read settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let mut image_overrides = HashMap::new();
        for (lang, key) in [
            (Language::Python, cfg::CODEBOX_IMAGE_PYTHON),
            (Language::Go, cfg::CODEBOX_IMAGE_GO),
            (Language::NodeJs, cfg::CODEBOX_IMAGE_NODEJS),
        ] {
            if let Some(image) = non_empty(&lookup, key) {
                image_overrides.insert(lang, image);
            }
        }

        Self {
            default_image: non_empty(&lookup, cfg::CODEBOX_DEFAULT_IMAGE)
                .unwrap_or(defaults.default_image),
            work_dir: non_empty(&lookup, cfg::CODEBOX_WORK_DIR).unwrap_or(defaults.work_dir),
            stop_timeout_secs: parse_or_default(
                &lookup,
                cfg::CODEBOX_STOP_TIMEOUT_SECS,
                defaults.stop_timeout_secs,
            ),
            pull_timeout_secs: parse_or_default(
                &lookup,
                cfg::CODEBOX_PULL_TIMEOUT_SECS,
                defaults.pull_timeout_secs,
            ),
            progress_interval_ms: parse_or_default(
                &lookup,
                cfg::CODEBOX_PROGRESS_INTERVAL_MS,
                defaults.progress_interval_ms,
            )
            .max(1),
            label_prefix: non_empty(&lookup, cfg::CODEBOX_LABEL_PREFIX)
                .unwrap_or(defaults.label_prefix),
            image_overrides,
        }
    }

    /// Image for a language: override first, then the registry
    pub fn image_for(&self, language: Language) -> crate::error::Result<String> {
        if let Some(image) = self.image_overrides.get(&language) {
            return Ok(image.clone());
        }
        Ok(REGISTRY.profile(language)?.image.clone())
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    /// Tick period; never zero since a zero period cannot drive an interval
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    /// Label that marks an environment as ours
    pub fn managed_label(&self) -> String {
        format!("{}.managed", self.label_prefix)
    }

    /// `key=value` filter for listing managed environments
    pub fn managed_filter(&self) -> String {
        format!("{}=true", self.managed_label())
    }

    /// Resolve a sandbox-side path against the working directory
    pub fn sandbox_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.work_dir.trim_end_matches('/'), path)
        }
    }
}

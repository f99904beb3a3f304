//! Dispatcher configuration loaded from environment variables.

use std::time::Duration;

use fleet_core::error::CoreError;

/// Dispatcher and endpoint-pool settings.
///
/// All fields have defaults suitable for a single local GPU. Override via
/// environment variables (see [`DispatchConfig::from_env`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Number of ComfyUI endpoints, one per GPU.
    pub gpu_count: usize,
    /// Host every ComfyUI instance listens on.
    pub host: String,
    /// Port of endpoint 0; endpoint `i` listens on `base_port + i`.
    pub base_port: u16,
    /// Concurrent in-flight previews admitted per endpoint.
    pub max_previews_per_endpoint: usize,
    /// When `false`, every preview is discarded without being counted.
    pub previews_enabled: bool,
    /// Time after which an admitted preview's slot is released if the
    /// consumer never reports it fetched.
    pub preview_release_timeout: Duration,
    /// Whole-job watchdog, armed on assignment.
    pub job_watchdog: Duration,
    /// Buffer size of the normalized event channel.
    pub event_channel_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            gpu_count: 1,
            host: "127.0.0.1".to_string(),
            base_port: 8188,
            max_previews_per_endpoint: 2,
            previews_enabled: true,
            preview_release_timeout: Duration::from_millis(1500),
            job_watchdog: Duration::from_secs(600),
            event_channel_capacity: fleet_events::bus::DEFAULT_CAPACITY,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default     |
    /// |------------------------------|-------------|
    /// | `COMFYUI_GPU_COUNT`          | `1`         |
    /// | `COMFYUI_HOST`               | `127.0.0.1` |
    /// | `COMFYUI_BASE_PORT`          | `8188`      |
    /// | `MAX_PREVIEWS_PER_ENDPOINT`  | `2`         |
    /// | `PREVIEWS_ENABLED`           | `true`      |
    /// | `PREVIEW_RELEASE_TIMEOUT_MS` | `1500`      |
    /// | `JOB_WATCHDOG_SECS`          | `600`       |
    /// | `EVENT_CHANNEL_CAPACITY`     | `1024`      |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let config = Self {
            gpu_count: parse_var(&lookup, "COMFYUI_GPU_COUNT", defaults.gpu_count)?,
            host: lookup("COMFYUI_HOST")
                .map(|h| h.trim().to_string())
                .unwrap_or(defaults.host),
            base_port: parse_var(&lookup, "COMFYUI_BASE_PORT", defaults.base_port)?,
            max_previews_per_endpoint: parse_var(
                &lookup,
                "MAX_PREVIEWS_PER_ENDPOINT",
                defaults.max_previews_per_endpoint,
            )?,
            previews_enabled: parse_bool(&lookup, "PREVIEWS_ENABLED", defaults.previews_enabled)?,
            preview_release_timeout: Duration::from_millis(parse_var(
                &lookup,
                "PREVIEW_RELEASE_TIMEOUT_MS",
                1500u64,
            )?),
            job_watchdog: Duration::from_secs(parse_var(&lookup, "JOB_WATCHDOG_SECS", 600u64)?),
            event_channel_capacity: parse_var(
                &lookup,
                "EVENT_CHANNEL_CAPACITY",
                defaults.event_channel_capacity,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.gpu_count == 0 {
            return Err(CoreError::Validation(
                "COMFYUI_GPU_COUNT must be at least 1".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(CoreError::Validation("COMFYUI_HOST must not be empty".to_string()));
        }
        let last_port = usize::from(self.base_port).checked_add(self.gpu_count - 1);
        if last_port.map_or(true, |port| port > usize::from(u16::MAX)) {
            return Err(CoreError::Validation(format!(
                "COMFYUI_BASE_PORT {} leaves no room for {} endpoints",
                self.base_port, self.gpu_count
            )));
        }
        if self.max_previews_per_endpoint == 0 {
            return Err(CoreError::Validation(
                "MAX_PREVIEWS_PER_ENDPOINT must be at least 1 (use PREVIEWS_ENABLED=false to disable)"
                    .to_string(),
            ));
        }
        if self.job_watchdog.is_zero() {
            return Err(CoreError::Validation(
                "JOB_WATCHDOG_SECS must be at least 1".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(CoreError::Validation(
                "EVENT_CHANNEL_CAPACITY must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Port of every endpoint, indexed by endpoint id.
    pub fn endpoint_ports(&self) -> Vec<u16> {
        (0..self.gpu_count)
            .filter_map(|i| u16::try_from(usize::from(self.base_port) + i).ok())
            .collect()
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} has an invalid value: {raw:?}"))),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, CoreError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(CoreError::Validation(format!(
                "{key} must be a boolean, got {raw:?}"
            ))),
        },
    }
}

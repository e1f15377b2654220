//! Migration configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! environment variables (a `.env` file in the working directory is loaded
//! first). Later layers win.
//!
//! ```yaml
//! mixpanel:
//!   api_url: "https://data-eu.mixpanel.com/api/2.0"
//!   project_id: "123456"
//!   username: "svc-account"
//!   password: "secret"
//! posthog:
//!   endpoint: "https://eu.posthog.com"
//!   project_key: "phc_..."
//!   batch_size: 100
//! pacing:
//!   event_spacing_ms: 1
//!   user_spacing_ms: 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::MpphError;

pub const DEFAULT_MIXPANEL_API_URL: &str = "https://data.mixpanel.com/api/2.0";

/// Environment variable → configuration key
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("MIXPANEL_API_URL", "mixpanel.api_url"),
    ("MIXPANEL_PROJECT_ID", "mixpanel.project_id"),
    ("MIXPANEL_USERNAME", "mixpanel.username"),
    ("MIXPANEL_PASSWORD", "mixpanel.password"),
    ("POSTHOG_ENDPOINT", "posthog.endpoint"),
    ("POSTHOG_PROJECT_KEY", "posthog.project_key"),
    ("POSTHOG_API_KEY", "posthog.personal_api_key"),
];

/// Complete migration configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSpec {
    pub mixpanel: MixpanelSpec,
    pub posthog: PostHogSpec,
    pub pacing: PacingSpec,
}

/// Credentials and location of the Mixpanel raw export API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixpanelSpec {
    /// Base API URL; EU projects use the EU-specific host
    pub api_url: String,
    pub project_id: String,
    /// Service account username
    pub username: String,
    /// Service account secret
    pub password: String,
}

impl Default for MixpanelSpec {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_MIXPANEL_API_URL.to_string(),
            project_id: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Destination PostHog project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostHogSpec {
    /// Instance base URL, e.g. `https://app.posthog.com`
    pub endpoint: String,

    /// Project API key used by the capture endpoint
    pub project_key: String,

    /// Personal API key. Not needed for ingestion, accepted so existing
    /// `.env` files keep working.
    pub personal_api_key: Option<String>,

    /// Messages buffered per `/batch/` request
    pub batch_size: usize,
}

impl Default for PostHogSpec {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            project_key: String::new(),
            personal_api_key: None,
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

/// Minimum spacing between two sends to the destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSpec {
    pub event_spacing_ms: u64,
    pub user_spacing_ms: u64,
}

impl Default for PacingSpec {
    fn default() -> Self {
        Self {
            event_spacing_ms: 1,
            user_spacing_ms: 5,
        }
    }
}

impl PacingSpec {
    pub fn event_spacing(&self) -> Duration {
        Duration::from_millis(self.event_spacing_ms)
    }

    pub fn user_spacing(&self) -> Duration {
        Duration::from_millis(self.user_spacing_ms)
    }
}

impl MigrationSpec {
    /// Load configuration from defaults, `path` and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, MpphError> {
        // Load .env file if it exists (for local runs)
        dotenv::dotenv().ok();
        Self::load_with_env(path, |var| std::env::var(var).ok())
    }

    /// Same as [`MigrationSpec::load`] with an explicit environment lookup.
    pub fn load_with_env<F>(path: Option<&Path>, env: F) -> Result<Self, MpphError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        for (var, key) in ENV_OVERRIDES {
            let value = env(var).filter(|v| !v.is_empty());
            builder = builder.set_override_option(*key, value)?;
        }

        let spec: MigrationSpec = builder.build()?.try_deserialize()?;
        Ok(spec)
    }

    /// Check everything needed to pull the raw export.
    pub fn validate_export(&self) -> Result<(), MpphError> {
        let mp = &self.mixpanel;
        if mp.api_url.is_empty() {
            return Err(MpphError::Config("Mixpanel API URL cannot be empty".into()));
        }
        if !mp.api_url.starts_with("http://") && !mp.api_url.starts_with("https://") {
            return Err(MpphError::Config(format!(
                "Mixpanel API URL must be http(s): {}",
                mp.api_url
            )));
        }
        if mp.project_id.is_empty() {
            return Err(MpphError::Config("MIXPANEL_PROJECT_ID is required".into()));
        }
        if mp.username.is_empty() || mp.password.is_empty() {
            return Err(MpphError::Config(
                "MIXPANEL_USERNAME and MIXPANEL_PASSWORD are required".into(),
            ));
        }
        Ok(())
    }

    /// Check everything needed to write into PostHog.
    pub fn validate_ingest(&self) -> Result<(), MpphError> {
        let ph = &self.posthog;
        if ph.endpoint.is_empty() {
            return Err(MpphError::Config("POSTHOG_ENDPOINT is required".into()));
        }
        if ph.project_key.is_empty() {
            return Err(MpphError::Config("POSTHOG_PROJECT_KEY is required".into()));
        }
        if ph.batch_size == 0 {
            return Err(MpphError::Config("PostHog batch size must be at least 1".into()));
        }
        Ok(())
    }

    /// Log configuration (with secrets masked)
    pub fn log_config(&self) {
        info!(
            mixpanel_api_url = %self.mixpanel.api_url,
            mixpanel_project_id = %self.mixpanel.project_id,
            mixpanel_username = %self.mixpanel.username,
            mixpanel_password = mask(&self.mixpanel.password),
            posthog_endpoint = %self.posthog.endpoint,
            posthog_project_key = mask(&self.posthog.project_key),
            posthog_batch_size = self.posthog.batch_size,
            event_spacing_ms = self.pacing.event_spacing_ms,
            user_spacing_ms = self.pacing.user_spacing_ms,
            "Loaded migration configuration"
        );
    }
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "********"
    }
}

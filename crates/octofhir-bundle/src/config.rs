use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub transaction: TransactionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

impl EngineConfig {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(format!(
                "logging.level `{}` is not one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }
        match self.transaction.base_url.as_deref() {
            Some(base) if !["http://", "https://"].iter().any(|s| base.starts_with(s)) => {
                Err(format!("transaction.base_url `{base}` is not an absolute http(s) URL"))
            }
            _ => Ok(()),
        }
    }
}

/// Behaviour switches for transaction and batch processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSettings {
    /// A conditional delete matching several resources deletes all of them
    /// instead of failing.
    #[serde(default)]
    pub allow_multiple_delete: bool,
    /// `PUT Type/id` creates the resource when it does not exist yet.
    #[serde(default = "default_allow_update_create")]
    pub allow_update_create: bool,
    /// Process `Bundle.type = collection` as a batch.
    #[serde(default = "default_collection_as_batch")]
    pub collection_as_batch: bool,
    /// Upper bound on entries per bundle; `0` disables the limit.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Server base, used for absolute `fullUrl`s in responses.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Default `Prefer: return=` when the caller does not send one.
    #[serde(default)]
    pub prefer_return: PreferReturn,
}
fn default_allow_update_create() -> bool {
    true
}
fn default_collection_as_batch() -> bool {
    true
}
fn default_max_entries() -> usize {
    10_000
}
impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            allow_multiple_delete: false,
            allow_update_create: default_allow_update_create(),
            collection_as_batch: default_collection_as_batch(),
            max_entries: default_max_entries(),
            base_url: None,
            prefer_return: PreferReturn::default(),
        }
    }
}

/// `Prefer: return=` preference for response entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreferReturn {
    /// Status, location and etag only
    #[serde(rename = "minimal")]
    Minimal,
    /// The stored resource in `entry.resource`
    #[default]
    #[serde(rename = "representation")]
    Representation,
    /// An OperationOutcome in `entry.response.outcome`
    #[serde(rename = "OperationOutcome", alias = "operationoutcome", alias = "operation-outcome")]
    OperationOutcome,
}

impl PreferReturn {
    /// Parses a `Prefer` header value such as `return=minimal`.
    pub fn from_header(value: &str) -> Option<Self> {
        value
            .split([';', ','])
            .filter_map(|part| part.trim().strip_prefix("return="))
            .find_map(|v| match v.trim().trim_matches('"') {
                "minimal" => Some(Self::Minimal),
                "representation" => Some(Self::Representation),
                "OperationOutcome" => Some(Self::OperationOutcome),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use std::path::Path;

    use config::{Config, Environment, File};

    use super::EngineConfig;

    const DEFAULT_FILE: &str = "octofhir.toml";

    /// Reads `path` (or `octofhir.toml` when `None`) if it exists, then
    /// applies `OCTOFHIR__SECTION__KEY` environment overrides.
    pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<EngineConfig, String> {
        let file = match &path {
            Some(p) => p.as_ref(),
            None => Path::new(DEFAULT_FILE),
        };
        let sources = Config::builder()
            .add_source(File::from(file).required(false))
            .add_source(
                Environment::with_prefix("OCTOFHIR")
                    .separator("__")
                    .try_parsing(true),
            );

        let merged: EngineConfig = sources
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| format!("failed to load {}: {e}", file.display()))?;
        merged.validate()?;
        tracing::debug!(file = %file.display(), "engine configuration loaded");
        Ok(merged)
    }
}

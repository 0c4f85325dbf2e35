//! Configuration for the connector.
//!
//! Supports loading from TOML file with CLI argument overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use elk_common::ElasticsearchConfig;
use serde::Deserialize;

/// Default destination index for metric documents.
pub const DEFAULT_INDEX: &str = "appmetrics";

/// Default Kibana index holding index-patterns, charts and dashboards.
pub const DEFAULT_KIBANA_INDEX: &str = ".kibana";

/// Default period between bulk flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Top-level configuration for the connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Destination index for metric documents.
    pub index: String,
    /// Label stamped on every document; defaults to the process invocation name.
    pub app_name: Option<String>,
    /// Kibana index for saved objects.
    pub kibana_index: String,
    /// Root of the `mappings/`, `indexes/`, `charts/` and `dashboards/` fixtures.
    /// `None` uses the fixtures built into the binary.
    pub fixtures_dir: Option<PathBuf>,
    /// Period between bulk flushes.
    pub flush_interval: Duration,
    pub log_level: String,
    pub elasticsearch: ElasticsearchConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            index: DEFAULT_INDEX.to_string(),
            app_name: None,
            kibana_index: DEFAULT_KIBANA_INDEX.to_string(),
            fixtures_dir: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            log_level: "info".to_string(),
            elasticsearch: ElasticsearchConfig::default(),
        }
    }
}

impl ConnectorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(
        &mut self,
        index: Option<String>,
        app_name: Option<String>,
        elasticsearch_url: Option<String>,
    ) {
        if let Some(index) = index.filter(|i| !i.is_empty()) {
            self.index = index;
        }
        if let Some(app) = app_name {
            self.app_name = Some(app);
        }
        if let Some(url) = elasticsearch_url {
            self.elasticsearch.url = url;
        }
    }
}

/// TOML file structure for deserialization.
#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    elasticsearch: ElasticsearchToml,
    #[serde(default)]
    publisher: PublisherToml,
    #[serde(default)]
    kibana: KibanaToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    index: String,
    app: Option<String>,
    fixtures_dir: Option<PathBuf>,
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            index: DEFAULT_INDEX.to_string(),
            app: None,
            fixtures_dir: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ElasticsearchToml {
    url: String,
    user: Option<String>,
    password: Option<String>,
    request_timeout_secs: u64,
}

impl Default for ElasticsearchToml {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            user: None,
            password: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PublisherToml {
    flush_interval_ms: u64,
}

impl Default for PublisherToml {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct KibanaToml {
    index: String,
}

impl Default for KibanaToml {
    fn default() -> Self {
        Self {
            index: DEFAULT_KIBANA_INDEX.to_string(),
        }
    }
}

impl From<TomlConfig> for ConnectorConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            index: toml.general.index,
            app_name: toml.general.app,
            kibana_index: toml.kibana.index,
            fixtures_dir: toml.general.fixtures_dir,
            // A zero period would make the flush timer panic
            flush_interval: Duration::from_millis(toml.publisher.flush_interval_ms.max(1)),
            log_level: toml.general.log_level,
            elasticsearch: ElasticsearchConfig {
                url: toml.elasticsearch.url,
                user: toml.elasticsearch.user,
                password: toml.elasticsearch.password,
                request_timeout: Duration::from_secs(toml.elasticsearch.request_timeout_secs),
            },
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown country code '{code}' (configured: {known})")]
    UnknownCountry { code: String, known: String },

    #[error("proxy pool is empty; add endpoints under [proxies] servers")]
    EmptyProxyPool,

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub proxies: ProxyConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_countries")]
    pub countries: BTreeMap<String, CountryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            crawl: CrawlConfig::default(),
            proxies: ProxyConfig::default(),
            browser: BrowserConfig::default(),
            llm: LlmConfig::default(),
            output: OutputConfig::default(),
            pool: PoolConfig::default(),
            countries: default_countries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Requests served by one identity before a new one is drawn.
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval: u64,
    #[serde(default = "default_request_delay_secs")]
    pub request_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            rotation_interval: default_rotation_interval(),
            request_delay_secs: default_request_delay_secs(),
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            max_pages: default_max_pages(),
        }
    }
}

impl CrawlConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_secs(self.request_delay_secs)
    }

    /// Pause between two attempts at the same URL.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.request_delay_secs * 2)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_rotation_interval() -> u64 {
    10
}
fn default_request_delay_secs() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_pages() -> usize {
    3
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    /// Replaces the built-in user-agent set when non-empty.
    #[serde(default)]
    pub user_agents: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    Firefox,
    Chrome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default = "default_browser_kind")]
    pub kind: BrowserKind,
    #[serde(default = "default_headless")]
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            kind: default_browser_kind(),
            headless: default_headless(),
        }
    }
}

fn default_webdriver_url() -> String {
    "http://localhost:4444".to_string()
}
fn default_browser_kind() -> BrowserKind {
    BrowserKind::Firefox
}
fn default_headless() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Flush the warehouse after this many loaded jobs; 0 flushes only at the end.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            flush_every: default_flush_every(),
        }
    }
}

pub const MAX_WORKERS: usize = 4;

impl PoolConfig {
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }
}

fn default_workers() -> usize {
    2
}
fn default_flush_every() -> usize {
    25
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryConfig {
    pub base_url: String,
    pub location: String,
    pub geo_id: String,
    #[serde(default)]
    pub filters: String,
}

fn default_countries() -> BTreeMap<String, CountryConfig> {
    let mut countries = BTreeMap::new();
    countries.insert(
        "PE".to_string(),
        CountryConfig {
            base_url: "https://pe.linkedin.com/jobs/search".to_string(),
            location: "Peru".to_string(),
            geo_id: "102927786".to_string(),
            filters: "&f_TPR=r604800&position=1&pageNum=0".to_string(),
        },
    );
    countries.insert(
        "US".to_string(),
        CountryConfig {
            base_url: "https://www.linkedin.com/jobs/search".to_string(),
            location: "United%20States".to_string(),
            geo_id: "103644278".to_string(),
            filters: "&f_TPR=r604800&position=1&pageNum=0".to_string(),
        },
    );
    countries
}

impl Config {
    /// Load from an explicit path, else the per-user config file, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let config = match path {
            Some(path) => {
                debug!(path = %path.display(), "loading config");
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml(&text).map_err(|source| ConfigError::Parse { path, source })?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "jobcrawl")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crawl.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "crawl.max_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.crawl.rotation_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "crawl.rotation_interval",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.crawl.max_pages == 0 {
            return Err(ConfigError::Invalid {
                field: "crawl.max_pages",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.countries.is_empty() {
            return Err(ConfigError::Invalid {
                field: "countries",
                reason: "no countries configured".to_string(),
            });
        }
        Ok(())
    }

    pub fn country(&self, code: &str) -> Result<&CountryConfig, ConfigError> {
        self.countries
            .get(&code.trim().to_uppercase())
            .ok_or_else(|| ConfigError::UnknownCountry {
                code: code.to_string(),
                known: self.countries.keys().cloned().collect::<Vec<_>>().join(", "),
            })
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

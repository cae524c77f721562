use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{IndexError, Result};

pub const DEFAULT_PORT: u16 = 7080;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;

fn default_bool_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bool_true")]
    pub graphql: bool,
    /// Accept event batches over `POST /events`.
    #[serde(default = "default_bool_true")]
    pub rest: bool,
}

impl ApiConfig {
    pub fn any_enabled(&self) -> bool {
        self.graphql || self.rest
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            graphql: true,
            rest: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiConfigUpdate {
    pub graphql: Option<bool>,
    pub rest: Option<bool>,
}

impl ApiConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.graphql.is_none() && self.rest.is_none()
    }
}

/// Another chainlog instance queried through its GraphQL endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub endpoint: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    #[serde(default)]
    pub halt_on_integrity_fault: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            port: DEFAULT_PORT,
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            list_page_size: default_list_page_size(),
            page_limit: default_page_limit(),
            halt_on_integrity_fault: false,
            api: ApiConfig::default(),
            remotes: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub bind_addr: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub list_page_size: Option<usize>,
    pub page_limit: Option<usize>,
    pub halt_on_integrity_fault: Option<bool>,
    pub api: Option<ApiConfigUpdate>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = default_config_root()?;
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        let path = default_config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.validate()?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(bind_addr) = update.bind_addr {
            self.bind_addr = bind_addr;
        }
        if let Some(dir) = update.data_dir {
            self.data_dir = dir;
        }
        if let Some(list_page_size) = update.list_page_size {
            self.list_page_size = list_page_size;
        }
        if let Some(page_limit) = update.page_limit {
            self.page_limit = page_limit;
        }
        if let Some(halt) = update.halt_on_integrity_fault {
            self.halt_on_integrity_fault = halt;
        }
        if let Some(api) = update.api {
            if let Some(graphql) = api.graphql {
                self.api.graphql = graphql;
            }
            if let Some(rest) = api.rest {
                self.api.rest = rest;
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_limit == 0 {
            return Err(IndexError::Config("page_limit must be at least 1".into()));
        }
        if self.list_page_size == 0 || self.list_page_size > self.page_limit {
            return Err(IndexError::Config(format!(
                "list_page_size must be between 1 and page_limit ({})",
                self.page_limit
            )));
        }
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn index_store_path(&self) -> PathBuf {
        self.data_dir.join("index_store")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Local HTTP base URL of the configured server. A wildcard bind
    /// address is reached through loopback.
    pub fn base_url(&self) -> String {
        let host = match self.bind_addr.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{host}:{}", self.port)
    }
}

fn default_config_root() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        Ok(home.join(".chainlog"))
    } else {
        env::current_dir()
            .map(|dir| dir.join(".chainlog"))
            .map_err(|err| IndexError::Config(err.to_string()))
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_data_dir() -> PathBuf {
    default_config_root().unwrap_or_else(|_| PathBuf::from(".chainlog"))
}

fn default_list_page_size() -> usize {
    10
}

fn default_page_limit() -> usize {
    1000
}

fn default_remote_timeout_secs() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_SECS
}

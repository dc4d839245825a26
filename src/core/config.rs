//! Configuration - CLI flags plus the sectioned adapter config file

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::core::{Error, Result};

/// Command-line options. Flags override the config file.
#[derive(Debug, Clone, Parser)]
#[command(name = "meridian", about = "electronic trading platform core")]
pub struct Opts {
    /// Adapter/config file path
    #[arg(long, default_value = "meridian.toml")]
    pub config_file: PathBuf,

    /// Optional file holding a tracing filter directive (e.g. "meridian=debug")
    #[arg(long)]
    pub log_config_file: Option<PathBuf>,

    /// Reference store location (directory with reference.toml and the
    /// position log)
    #[arg(long)]
    pub db_url: Option<String>,

    /// Create an empty reference store skeleton if missing
    #[arg(long, default_value_t = false)]
    pub db_create_tables: bool,

    /// Reserved: store connection pool size
    #[arg(long, default_value_t = 4)]
    pub db_pool_size: u16,

    /// Client port listen port
    #[arg(long, default_value_t = 9111)]
    pub port: u16,

    /// Client port io threads
    #[arg(long, default_value_t = 1)]
    pub io_threads: usize,

    /// Algo runner shards
    #[arg(long, default_value_t = 1)]
    pub algo_threads: usize,

    /// Disable pre-trade risk checks (permission checks still apply)
    #[arg(long, default_value_t = false)]
    pub disable_rms: bool,
}

/// One `[md_*]` / `[ec_*]` section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterConfig {
    /// Adapter implementation name resolved by the factory ("sim", ...)
    pub adapter: String,
    /// Market-data source tag, at most 4 ascii bytes
    #[serde(default)]
    pub src: String,
    /// Comma/semicolon-separated exchange names this adapter covers
    #[serde(default)]
    pub markets: String,
    /// Free-form adapter parameters
    #[serde(flatten)]
    pub params: HashMap<String, toml::Value>,
}

impl AdapterConfig {
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_str())
    }

    pub fn param_i64(&self, name: &str) -> Option<i64> {
        self.params.get(name).and_then(|v| v.as_integer())
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        let v = self.params.get(name)?;
        v.as_float().or_else(|| v.as_integer().map(|n| n as f64))
    }
}

/// Parsed config file: adapter sections keyed by section name. Section
/// names select the adapter kind: `md_*` market data, `ec_*` execution.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub sections: Vec<(String, AdapterConfig)>,
}

impl ConfigFile {
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let table: toml::Table = content
            .parse()
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        let mut sections = vec![];
        for (name, value) in table {
            let section = value
                .try_into::<AdapterConfig>()
                .map_err(|e| Error::Config(format!("bad section [{}]: {}", name, e)))?;
            sections.push((name, section));
        }
        Ok(Self { sections })
    }

    pub fn market_data_sections(&self) -> impl Iterator<Item = &(String, AdapterConfig)> {
        self.sections.iter().filter(|(n, _)| n.starts_with("md_"))
    }

    pub fn execution_sections(&self) -> impl Iterator<Item = &(String, AdapterConfig)> {
        self.sections.iter().filter(|(n, _)| n.starts_with("ec_"))
    }
}

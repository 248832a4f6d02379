//! Run configuration: the command line, the validated harvest knobs and the
//! region/category selection.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

pub const DEFAULT_FLUSH_THRESHOLD: usize = 300;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Tunables handed to the harvest loop at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestConfig {
    /// Ceiling on detail fetches in flight.
    pub concurrency: usize,
    /// New records between two saves.
    pub flush_threshold: usize,
    pub fetch_timeout: Duration,
    /// Attempts per listing page before it counts as empty.
    pub list_attempts: u32,
    pub list_retry_delay: Duration,
    /// Attempts per save while the output file is locked.
    pub save_attempts: u32,
    pub save_backoff: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        HarvestConfig {
            concurrency: 20,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            list_attempts: 2,
            list_retry_delay: Duration::from_secs(5),
            save_attempts: 3,
            save_backoff: Duration::from_secs(5),
        }
    }
}

impl HarvestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.flush_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "flush-threshold",
                reason: "must be at least 1".into(),
            });
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timeout-secs",
                reason: "must be at least 1 second".into(),
            });
        }
        Ok(())
    }
}

/// An explicit list of keys, or every key of the site's enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    All,
    Named(Vec<String>),
}

impl Choice {
    /// `all`, `全部` or an empty string select everything; otherwise a comma separated list.
    pub fn parse(raw: &str) -> Choice {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") || raw == "全部" {
            return Choice::All;
        }
        let names = raw
            .split(|c| c == ',' || c == '，')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Choice::Named(names)
    }

    /// Resolves the choice against the fixed enumeration. `All` keeps the
    /// enumeration order; named keys keep the order given and must all exist.
    pub fn expand<F>(&self, universe: &[&str], unknown: F) -> Result<Vec<String>, ConfigError>
    where
        F: Fn(String) -> ConfigError,
    {
        match self {
            Choice::All => Ok(universe.iter().map(|s| s.to_string()).collect()),
            Choice::Named(names) => {
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    if !universe.contains(&name.as_str()) {
                        return Err(unknown(name.clone()));
                    }
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
                Ok(out)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub regions: Choice,
    pub categories: Choice,
}

impl Selection {
    pub fn all() -> Self {
        Selection {
            regions: Choice::All,
            categories: Choice::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Beijing,
    Shanghai,
    Shandong,
    Ningbo,
}

impl Site {
    pub fn name(self) -> &'static str {
        match self {
            Site::Beijing => "beijing",
            Site::Shanghai => "shanghai",
            Site::Shandong => "shandong",
            Site::Ningbo => "ningbo",
        }
    }

    /// How much parallel load each source tolerates.
    pub fn default_concurrency(self) -> usize {
        match self {
            Site::Beijing => 20,
            Site::Shanghai => 200,
            Site::Shandong => 20,
            // Each detail is a browser tab.
            Site::Ningbo => 4,
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Site {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "beijing" | "北京" | "chinatax" => Ok(Site::Beijing),
            "shanghai" | "上海" => Ok(Site::Shanghai),
            "shandong" | "山东" => Ok(Site::Shandong),
            "ningbo" | "宁波" => Ok(Site::Ningbo),
            other => Err(ConfigError::UnknownSite(other.to_string())),
        }
    }
}

/// Command line of the `tax-harvest` binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "tax-harvest", about = "Resumable harvester for tax-bureau policy documents")]
pub struct Cli {
    /// Source to harvest: beijing (national knowledge base), shanghai, shandong or ningbo
    #[arg(long, env = "TAX_HARVEST_SITE", default_value = "beijing")]
    pub site: Site,

    /// Regions to harvest, comma separated, or "all"
    #[arg(long, env = "TAX_HARVEST_REGIONS", default_value = "all")]
    pub regions: String,

    /// Categories/sections to harvest, comma separated, or "all"
    #[arg(long, env = "TAX_HARVEST_CATEGORIES", default_value = "all")]
    pub categories: String,

    /// Output spreadsheet (.xlsx) or directory of CSV files
    #[arg(long, short, env = "TAX_HARVEST_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Detail fetches in flight (defaults per site)
    #[arg(long, env = "TAX_HARVEST_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// New records between two saves
    #[arg(long, env = "TAX_HARVEST_FLUSH_THRESHOLD", default_value_t = DEFAULT_FLUSH_THRESHOLD)]
    pub flush_threshold: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "TAX_HARVEST_TIMEOUT_SECS", default_value_t = 15)]
    pub timeout_secs: u64,

    /// Save attempts while the output file is locked
    #[arg(long, default_value_t = 3)]
    pub save_attempts: u32,

    /// Seconds between save attempts
    #[arg(long, default_value_t = 5)]
    pub save_backoff_secs: u64,
}

impl Cli {
    pub fn output_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.output {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => Err(ConfigError::MissingOutput),
        }
    }

    pub fn selection(&self) -> Selection {
        Selection {
            regions: Choice::parse(&self.regions),
            categories: Choice::parse(&self.categories),
        }
    }

    pub fn harvest_config(&self) -> Result<HarvestConfig, ConfigError> {
        let config = HarvestConfig {
            concurrency: self.concurrency.unwrap_or_else(|| self.site.default_concurrency()),
            flush_threshold: self.flush_threshold,
            fetch_timeout: Duration::from_secs(self.timeout_secs),
            save_attempts: self.save_attempts,
            save_backoff: Duration::from_secs(self.save_backoff_secs),
            ..HarvestConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_expands_in_enumeration_order() {
        let universe = ["北京", "上海", "山东"];
        let keys = Choice::parse("全部")
            .expand(&universe, |n| ConfigError::UnknownSite(n))
            .unwrap();
        assert_eq!(keys, vec!["北京", "上海", "山东"]);
    }

    #[test]
    fn named_keys_are_validated() {
        let universe = ["北京", "上海"];
        let keys = Choice::parse("上海，北京, 上海")
            .expand(&universe, |n| ConfigError::UnknownSite(n))
            .unwrap();
        assert_eq!(keys, vec!["上海", "北京"]);

        let err = Choice::parse("火星")
            .expand(&universe, |n| ConfigError::UnknownSite(n))
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownSite("火星".into()));
    }

    #[test]
    fn cli_requires_an_output() {
        let cli = Cli::parse_from(["tax-harvest", "--site", "shanghai"]);
        assert_eq!(cli.site, Site::Shanghai);
        assert_eq!(cli.output_path(), Err(ConfigError::MissingOutput));
    }

    #[test]
    fn cli_builds_config_with_site_default_concurrency() {
        let cli = Cli::parse_from(["tax-harvest", "--site", "山东", "-o", "out.xlsx", "--flush-threshold", "50"]);
        let config = cli.harvest_config().unwrap();
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.flush_threshold, 50);
        assert_eq!(cli.selection(), Selection::all());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cli = Cli::parse_from(["tax-harvest", "-o", "out.xlsx", "--concurrency", "0"]);
        assert!(matches!(cli.harvest_config(), Err(ConfigError::InvalidValue { field: "concurrency", .. })));
    }

    #[test]
    fn unknown_site_is_rejected() {
        assert_eq!("hangzhou".parse::<Site>(), Err(ConfigError::UnknownSite("hangzhou".into())));
        assert_eq!("宁波".parse::<Site>(), Ok(Site::Ningbo));
    }
}

//! Engine configuration: the recognized key table, defaults, TOML loading,
//! and `-s NAME=VALUE` overrides.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::utils::error::{ProxyError, ProxyResult};

pub type SharedConfig = Arc<RwLock<Config>>;

/// Recognized configuration keys, with the defaults from §6. `backup_size`
/// is derived (`10 * queue_size`) rather than independently configurable,
/// matching the spec's "derived" annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub block_time: u64,
    pub max_fail_times: u32,
    pub checker: String,
    pub checker_timeout: u64,
    pub checker_clients: usize,
    /// Only consulted when `checker` selects `ResponseMatchValidator`.
    pub checker_target_url: String,
    pub checker_status_pattern: String,
    pub check_interval: u64,
    pub scrap_interval: u64,
    pub spider_timeout: u64,
    pub spider_sleep_time: u64,
    pub spider_headers: HashMap<String, String>,
    pub queue_size: usize,
    pub min_anonymity: u8,
    pub proxy_pages: HashMap<String, Vec<String>>,

    pub log_level: String,
    pub log_file: Option<String>,
    pub log_format: String,
    pub log_dateformat: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:6256".to_string(),
            block_time: 7200,
            max_fail_times: 2,
            checker: "freehp.checker.HttpbinChecker".to_string(),
            checker_timeout: 10,
            checker_clients: 100,
            checker_target_url: String::new(),
            checker_status_pattern: "200".to_string(),
            check_interval: 300,
            scrap_interval: 300,
            spider_timeout: 30,
            spider_sleep_time: 5,
            spider_headers: crate::utils::http::default_scraper_headers()
                .into_iter()
                .collect(),
            queue_size: 500,
            min_anonymity: 0,
            proxy_pages: HashMap::new(),
            log_level: "warn".to_string(),
            log_file: None,
            log_format: "%(asctime)s %(name)s [%(levelname)s] %(message)s".to_string(),
            log_dateformat: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }
}

impl Config {
    pub fn backup_size(&self) -> usize {
        self.queue_size * 10
    }

    pub fn from_toml(content: &str) -> ProxyResult<Self> {
        toml::from_str(content).map_err(|e| ProxyError::Config(format!("invalid config file: {}", e)))
    }

    /// Apply a single `-s NAME=VALUE` override, matching the CLI contract
    /// from §6. Unknown keys are a config error, not a silent no-op.
    pub fn apply_override(&mut self, pair: &str) -> ProxyResult<()> {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| ProxyError::Config(format!("malformed override '{}', expected NAME=VALUE", pair)))?;

        match name {
            "bind" => self.bind = value.to_string(),
            "blockTime" | "block_time" => self.block_time = parse_num(name, value)?,
            "maxFailTimes" | "max_fail_times" => self.max_fail_times = parse_num(name, value)?,
            "checker" => self.checker = value.to_string(),
            "checkerTimeout" | "checker_timeout" => self.checker_timeout = parse_num(name, value)?,
            "checkerClients" | "checker_clients" => self.checker_clients = parse_num(name, value)?,
            "checkerTargetUrl" | "checker_target_url" => self.checker_target_url = value.to_string(),
            "checkerStatusPattern" | "checker_status_pattern" => self.checker_status_pattern = value.to_string(),
            "checkInterval" | "check_interval" => self.check_interval = parse_num(name, value)?,
            "scrapInterval" | "scrap_interval" => self.scrap_interval = parse_num(name, value)?,
            "spiderTimeout" | "spider_timeout" => self.spider_timeout = parse_num(name, value)?,
            "spiderSleepTime" | "spider_sleep_time" => self.spider_sleep_time = parse_num(name, value)?,
            "queueSize" | "queue_size" => self.queue_size = parse_num(name, value)?,
            "minAnonymity" | "min_anonymity" => self.min_anonymity = parse_num(name, value)?,
            "logLevel" | "log_level" => self.log_level = value.to_string(),
            "logFile" | "log_file" => self.log_file = Some(value.to_string()),
            "logFormat" | "log_format" => self.log_format = value.to_string(),
            "logDateformat" | "log_dateformat" => self.log_dateformat = value.to_string(),
            other => {
                return Err(ProxyError::Config(format!("unknown configuration key '{}'", other)))
            }
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> ProxyResult<T> {
    value
        .parse::<T>()
        .map_err(|_| ProxyError::Config(format!("invalid value for '{}': '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let c = Config::default();
        assert_eq!(c.bind, "0.0.0.0:6256");
        assert_eq!(c.block_time, 7200);
        assert_eq!(c.max_fail_times, 2);
        assert_eq!(c.queue_size, 500);
        assert_eq!(c.backup_size(), 5000);
        assert_eq!(c.min_anonymity, 0);
    }

    #[test]
    fn override_updates_named_key() {
        let mut c = Config::default();
        c.apply_override("queueSize=50").unwrap();
        assert_eq!(c.queue_size, 50);
        assert_eq!(c.backup_size(), 500);
    }

    #[test]
    fn override_rejects_unknown_key() {
        let mut c = Config::default();
        assert!(c.apply_override("bogusKey=1").is_err());
    }

    #[test]
    fn override_rejects_malformed_pair() {
        let mut c = Config::default();
        assert!(c.apply_override("no-equals-sign").is_err());
    }
}

//! Run configuration consumed by the engine core.
//!
//! The CLI (or any embedder) populates this; the core only validates and
//! obeys it. The struct crosses the worker IPC boundary, so everything here
//! is serde-serializable.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Shard selection. Stored 0-based; the conventional `"1/4"` CLI syntax is
/// 1-based and goes through [`Shard::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub current: u32,
    pub total: u32,
}

impl Shard {
    /// Parse an external `current/total` pair (1-based current).
    pub fn parse(s: &str) -> Result<Self> {
        let (current, total) = s
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("invalid shard '{s}', expected current/total")))?;
        let current: u32 = current
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid shard index in '{s}'")))?;
        let total: u32 = total
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid shard total in '{s}'")))?;
        if current == 0 || total == 0 || current > total {
            return Err(Error::Config(format!(
                "shard '{s}' out of range, expected 1 <= current <= total"
            )));
        }
        Ok(Shard {
            current: current - 1,
            total,
        })
    }
}

/// Snapshot update behavior, passed through to the snapshot matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateSnapshots {
    All,
    #[default]
    None,
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Maximum number of concurrent worker processes.
    pub workers: usize,
    /// Per-test deadline in milliseconds; 0 means no deadline.
    pub timeout_ms: u64,
    /// Whole-run deadline in milliseconds; 0 means no deadline.
    pub global_timeout_ms: u64,
    /// Maximum attempts per test = retries + 1.
    pub retries: u32,
    /// Each generated test is materialized this many times.
    pub repeat_each: u32,
    /// Stop scheduling after this many unexpected results; 0 means never.
    pub max_failures: usize,
    /// Fail generation if any focused (`only`) suite or test remains.
    pub forbid_only: bool,
    pub shard: Option<Shard>,
    /// Regex applied to full test titles.
    pub grep: Option<String>,
    pub update_snapshots: UpdateSnapshots,
    /// Root directory for per-test artifacts.
    pub output_dir: PathBuf,
    /// Grace window granted to workers on stop before they are killed.
    pub stop_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            timeout_ms: 30_000,
            global_timeout_ms: 0,
            retries: 0,
            repeat_each: 1,
            max_failures: 0,
            forbid_only: false,
            shard: None,
            grep: None,
            update_snapshots: UpdateSnapshots::default(),
            output_dir: PathBuf::from("test-results"),
            stop_grace_ms: 30_000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be >= 1".to_string()));
        }
        if self.repeat_each == 0 {
            return Err(Error::Config("repeatEach must be >= 1".to_string()));
        }
        if let Some(shard) = &self.shard {
            if shard.total == 0 || shard.current >= shard.total {
                return Err(Error::Config(format!(
                    "shard {}/{} out of range",
                    shard.current, shard.total
                )));
            }
        }
        if let Some(grep) = &self.grep {
            regex::Regex::new(grep)
                .map_err(|e| Error::Config(format!("invalid grep pattern: {e}")))?;
        }
        Ok(())
    }

    pub fn grep_regex(&self) -> Result<Option<regex::Regex>> {
        match &self.grep {
            None => Ok(None),
            Some(src) => regex::Regex::new(src)
                .map(Some)
                .map_err(|e| Error::Config(format!("invalid grep pattern: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.workers >= 1);
        assert_eq!(config.retries, 0);
        assert_eq!(config.repeat_each, 1);
    }

    #[test]
    fn shard_parse_is_one_based() {
        let shard = Shard::parse("1/4").unwrap();
        assert_eq!(shard, Shard { current: 0, total: 4 });
        let shard = Shard::parse("4/4").unwrap();
        assert_eq!(shard, Shard { current: 3, total: 4 });
    }

    #[test]
    fn shard_parse_rejects_out_of_range() {
        assert!(Shard::parse("0/4").is_err());
        assert!(Shard::parse("5/4").is_err());
        assert!(Shard::parse("nope").is_err());
    }

    #[test]
    fn validate_rejects_bad_grep() {
        let config = Config {
            grep: Some("(unclosed".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config {
            retries: 2,
            shard: Some(Shard { current: 1, total: 3 }),
            grep: Some("smoke".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.retries, 2);
        assert_eq!(back.shard, config.shard);
        assert_eq!(back.grep, config.grep);
    }
}

//! Service configuration from environment variables.
//!
//! Every setting except the API token and the storage path has a default.
//! Parsing collects every problem instead of stopping at the first one, so a
//! misconfigured deployment is fixed in one round.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

use crate::persistence::checkpoint::DEFAULT_LOOKBACK_DAYS;
use crate::persistence::parse_process_after;
use crate::poller::{DEFAULT_OVERLAP_SECS, DEFAULT_POLL_INTERVAL_SECS, PollerConfig};
use crate::processor::{FilterConfig, NamingStrategy};
use crate::source::{DEFAULT_BASE_URL, StatusPolicy};
use crate::spool::SpoolConfig;
use crate::worker::{
    DEFAULT_RECLAIM_INTERVAL_SECS, DEFAULT_VISIBILITY_TIMEOUT_SECS, DEFAULT_WORKER_COUNT,
    WorkerConfig,
};

const DEFAULT_SPOOL_DIR: &str = "data/spool";
const DEFAULT_CHECKPOINT_DIR: &str = "data/checkpoints";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Longest accepted `DEFAULT_LOOKBACK_DAYS`, about a century.
const MAX_LOOKBACK_DAYS: u32 = 36_500;

/// A single configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigProblem {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Every problem found while reading the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {}", ProblemList(.problems))]
pub struct ConfigError {
    pub problems: Vec<ConfigProblem>,
}

struct ProblemList<'a>(&'a [ConfigProblem]);

impl fmt::Display for ProblemList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, problem) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{problem}")?;
        }
        Ok(())
    }
}

/// Complete service configuration.
#[derive(Clone)]
pub struct Config {
    pub api_token: String,
    pub api_base_url: String,
    pub request_timeout: Duration,
    pub status_policy: StatusPolicy,

    /// Root of the `YYYY-MM` attachment folders. Always absolute.
    pub storage_path: PathBuf,
    pub naming: NamingStrategy,
    pub filter: FilterConfig,

    pub spool_dir: PathBuf,
    pub spool: SpoolConfig,

    pub checkpoint_dir: PathBuf,
    pub default_lookback: chrono::Duration,
    pub process_after: Option<NaiveDate>,

    pub poller: PollerConfig,
    pub worker: WorkerConfig,

    /// Address of the status endpoint; disabled when unset.
    pub status_addr: Option<SocketAddr>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_token", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("request_timeout", &self.request_timeout)
            .field("status_policy", &self.status_policy)
            .field("storage_path", &self.storage_path)
            .field("naming", &self.naming)
            .field("filter", &self.filter)
            .field("spool_dir", &self.spool_dir)
            .field("spool", &self.spool)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("default_lookback", &self.default_lookback)
            .field("process_after", &self.process_after)
            .field("poller", &self.poller)
            .field("worker", &self.worker)
            .field("status_addr", &self.status_addr)
            .finish()
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut env = Reader {
            lookup: |var: &str| lookup(var).filter(|v| !v.trim().is_empty()),
            problems: Vec::new(),
        };

        let api_token = env.required("MISSIVE_API_TOKEN").unwrap_or_default();
        let api_base_url = env
            .string("MISSIVE_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let request_timeout = env.secs("REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS);
        let status_policy = env.status_policy("PERMANENT_STATUS_CODES");

        let storage_path = env.absolute_path("ATTACHMENT_STORAGE_PATH");
        let naming = env.parsed("NAMING_STRATEGY", NamingStrategy::default());
        let filter = FilterConfig {
            min_image_size: env.parsed("SKIP_IMAGE_MIN_SIZE", FilterConfig::DEFAULT.min_image_size),
            min_image_dimension: env.parsed(
                "SKIP_IMAGE_MIN_DIMENSION",
                FilterConfig::DEFAULT.min_image_dimension,
            ),
        };

        let spool_dir = env
            .string("SPOOL_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_SPOOL_DIR), PathBuf::from);
        let spool = SpoolConfig {
            max_retries: env.parsed("MAX_RETRIES", SpoolConfig::DEFAULT.max_retries),
            retry_backoff: env.secs(
                "SPOOL_RETRY_SECONDS",
                SpoolConfig::DEFAULT.retry_backoff.as_secs(),
            ),
            max_backoff: env.secs(
                "SPOOL_MAX_BACKOFF_SECONDS",
                SpoolConfig::DEFAULT.max_backoff.as_secs(),
            ),
        };
        if spool.max_retries == 0 {
            env.invalid("MAX_RETRIES", "0", "must be at least 1");
        }
        if spool.retry_backoff.is_zero() {
            env.invalid("SPOOL_RETRY_SECONDS", "0", "must be at least 1");
        }

        let checkpoint_dir = env
            .string("CHECKPOINT_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_DIR), PathBuf::from);
        let lookback_days: u32 = env.parsed("DEFAULT_LOOKBACK_DAYS", DEFAULT_LOOKBACK_DAYS as u32);
        if lookback_days > MAX_LOOKBACK_DAYS {
            env.invalid(
                "DEFAULT_LOOKBACK_DAYS",
                &lookback_days.to_string(),
                format!("must be at most {MAX_LOOKBACK_DAYS}"),
            );
        }
        let process_after = env.process_after("MISSIVE_PROCESS_AFTER");

        let poller = PollerConfig {
            poll_interval: env.secs("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS),
            overlap: env.secs("BACKFILL_OVERLAP_SECONDS", DEFAULT_OVERLAP_SECS),
        };
        let worker = WorkerConfig {
            concurrency: env.parsed("WORKER_COUNT", DEFAULT_WORKER_COUNT),
            visibility_timeout: env.secs(
                "VISIBILITY_TIMEOUT_SECS",
                DEFAULT_VISIBILITY_TIMEOUT_SECS,
            ),
            reclaim_interval: env.secs("RECLAIM_INTERVAL_SECS", DEFAULT_RECLAIM_INTERVAL_SECS),
            ..WorkerConfig::new()
        };
        if worker.concurrency == 0 {
            env.invalid("WORKER_COUNT", "0", "must be at least 1");
        }
        if worker.visibility_timeout.is_zero() {
            env.invalid("VISIBILITY_TIMEOUT_SECS", "0", "must be at least 1");
        }

        let status_addr = env.optional_parsed("STATUS_ADDR");

        if !env.problems.is_empty() {
            return Err(ConfigError {
                problems: env.problems,
            });
        }

        Ok(Config {
            api_token,
            api_base_url,
            request_timeout,
            status_policy,
            storage_path: storage_path.unwrap_or_default(),
            naming,
            filter,
            spool_dir,
            spool,
            checkpoint_dir,
            default_lookback: chrono::Duration::days(i64::from(lookback_days)),
            process_after,
            poller,
            worker,
            status_addr,
        })
    }
}

/// Reads variables and accumulates problems.
struct Reader<F> {
    lookup: F,
    problems: Vec<ConfigProblem>,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn string(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var).map(|v| v.trim().to_string())
    }

    fn required(&mut self, var: &'static str) -> Option<String> {
        let value = self.string(var);
        if value.is_none() {
            self.problems.push(ConfigProblem::Missing(var));
        }
        value
    }

    fn invalid(&mut self, var: &'static str, value: &str, reason: impl Into<String>) {
        self.problems.push(ConfigProblem::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        });
    }

    fn parsed<T>(&mut self, var: &'static str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.optional_parsed(var).unwrap_or(default)
    }

    fn optional_parsed<T>(&mut self, var: &'static str) -> Option<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let value = self.string(var)?;
        match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                self.invalid(var, &value, e.to_string());
                None
            }
        }
    }

    fn secs(&mut self, var: &'static str, default: u64) -> Duration {
        Duration::from_secs(self.parsed(var, default))
    }

    fn absolute_path(&mut self, var: &'static str) -> Option<PathBuf> {
        let value = self.required(var)?;
        let path = PathBuf::from(&value);
        if path.is_absolute() {
            Some(path)
        } else {
            self.invalid(var, &value, "must be an absolute path");
            None
        }
    }

    fn process_after(&mut self, var: &'static str) -> Option<NaiveDate> {
        let value = self.string(var)?;
        let date = parse_process_after(&value);
        if date.is_none() {
            self.invalid(var, &value, "expected DD.MM.YYYY");
        }
        date
    }

    fn status_policy(&mut self, var: &'static str) -> StatusPolicy {
        let Some(value) = self.string(var) else {
            return StatusPolicy::default();
        };
        let mut codes = Vec::new();
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.parse::<u16>() {
                Ok(code) if (400..600).contains(&code) => codes.push(code),
                _ => {
                    self.invalid(var, &value, format!("'{part}' is not an HTTP error status"));
                    return StatusPolicy::default();
                }
            }
        }
        StatusPolicy::new(codes)
    }
}

#![forbid(unsafe_code)]

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use counter_contracts::counter::{CounterCodec, CounterFormat, PrefixMap};
use counter_contracts::ContractViolation;
use counter_engines::hashing::SubjectHasher;
use counter_engines::year::CutoverYearProvider;
use thiserror::Error;

pub const ENV_DATABASE_PATH: &str = "COUNTER_DATABASE_PATH";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_PII_HASH_SALT: &str = "PII_HASH_SALT";
pub const ENV_METRICS_BIND: &str = "COUNTER_METRICS_BIND";
pub const ENV_DEPLOY_ENV: &str = "COUNTER_ENV";
pub const ENV_SEQUENCE_WIDTH: &str = "COUNTER_SEQUENCE_WIDTH";
pub const ENV_MAX_SEQUENCE: &str = "COUNTER_MAX_SEQUENCE";
pub const ENV_CONFLICT_RETRIES: &str = "COUNTER_CONFLICT_RETRIES";
pub const ENV_YEAR_CUTOVER: &str = "COUNTER_YEAR_CUTOVER";
pub const ENV_UTC_OFFSET_MINUTES: &str = "COUNTER_UTC_OFFSET_MINUTES";

const DEFAULT_METRICS_BIND: &str = "127.0.0.1:8000";
const DEFAULT_CONFLICT_RETRIES: u32 = 3;
const MAX_CONFLICT_RETRIES: u32 = 10;
const DEFAULT_UTC_OFFSET_MINUTES: i32 = 210;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployEnv {
    Dev,
    Stage,
    Prod,
}

impl DeployEnv {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployEnv::Dev => "dev",
            DeployEnv::Stage => "stage",
            DeployEnv::Prod => "prod",
        }
    }
}

impl std::str::FromStr for DeployEnv {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(DeployEnv::Dev),
            "stage" => Ok(DeployEnv::Stage),
            "prod" => Ok(DeployEnv::Prod),
            _ => Err(()),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct CounterConfig {
    pub database_path: PathBuf,
    pub pii_hash_salt: String,
    pub metrics_bind: SocketAddr,
    pub deploy_env: DeployEnv,
    pub sequence_width: u8,
    pub max_sequence: u32,
    pub conflict_retries: u32,
    pub cutover_month: u32,
    pub cutover_day: u32,
    pub utc_offset_minutes: i32,
}

impl std::fmt::Debug for CounterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterConfig")
            .field("database_path", &self.database_path)
            .field("pii_hash_salt", &"<redacted>")
            .field("metrics_bind", &self.metrics_bind)
            .field("deploy_env", &self.deploy_env)
            .field("sequence_width", &self.sequence_width)
            .field("max_sequence", &self.max_sequence)
            .field("conflict_retries", &self.conflict_retries)
            .field("cutover_month", &self.cutover_month)
            .field("cutover_day", &self.cutover_day)
            .field("utc_offset_minutes", &self.utc_offset_minutes)
            .finish()
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    reason: &'static str,
) -> Result<Option<T>, ConfigError> {
    match non_empty(lookup, var) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value, reason }),
    }
}

fn parse_cutover(value: &str) -> Option<(u32, u32)> {
    let (month, day) = value.split_once('-')?;
    Some((month.parse().ok()?, day.parse().ok()?))
}

impl CounterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds the config from any key lookup. Callers layer flag overrides
    /// on top of the process environment by wrapping `env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_path = non_empty(&lookup, ENV_DATABASE_PATH)
            .or_else(|| {
                non_empty(&lookup, ENV_DATABASE_URL).map(|url| {
                    url.strip_prefix("sqlite://")
                        .map(str::to_string)
                        .unwrap_or(url)
                })
            })
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing(ENV_DATABASE_PATH))?;

        let pii_hash_salt =
            non_empty(&lookup, ENV_PII_HASH_SALT).ok_or(ConfigError::Missing(ENV_PII_HASH_SALT))?;

        let metrics_bind = parsed::<SocketAddr>(&lookup, ENV_METRICS_BIND, "expected host:port")?
            .map(Ok)
            .unwrap_or_else(|| {
                DEFAULT_METRICS_BIND
                    .parse()
                    .map_err(|_| ConfigError::Invalid {
                        var: ENV_METRICS_BIND,
                        value: DEFAULT_METRICS_BIND.to_string(),
                        reason: "expected host:port",
                    })
            })?;

        let deploy_env = match non_empty(&lookup, ENV_DEPLOY_ENV) {
            None => DeployEnv::Dev,
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: ENV_DEPLOY_ENV,
                value,
                reason: "expected dev, stage or prod",
            })?,
        };

        let sequence_width = parsed::<u8>(&lookup, ENV_SEQUENCE_WIDTH, "expected 1..=9")?
            .unwrap_or(counter_contracts::counter::DEFAULT_SEQUENCE_WIDTH);
        let default_format = CounterFormat::with_width(sequence_width)?;
        let max_sequence = parsed::<u32>(&lookup, ENV_MAX_SEQUENCE, "expected a positive integer")?
            .unwrap_or(default_format.max_sequence);
        CounterFormat::new(sequence_width, max_sequence)?;

        let conflict_retries = match parsed::<u32>(&lookup, ENV_CONFLICT_RETRIES, "expected 1..=10")? {
            None => DEFAULT_CONFLICT_RETRIES,
            Some(n) if (1..=MAX_CONFLICT_RETRIES).contains(&n) => n,
            Some(n) => {
                return Err(ConfigError::Invalid {
                    var: ENV_CONFLICT_RETRIES,
                    value: n.to_string(),
                    reason: "expected 1..=10",
                })
            }
        };

        let (cutover_month, cutover_day) = match non_empty(&lookup, ENV_YEAR_CUTOVER) {
            None => (9, 23),
            Some(value) => parse_cutover(&value).ok_or(ConfigError::Invalid {
                var: ENV_YEAR_CUTOVER,
                value,
                reason: "expected MM-DD",
            })?,
        };
        let utc_offset_minutes =
            parsed::<i32>(&lookup, ENV_UTC_OFFSET_MINUTES, "expected minutes east of UTC")?
                .unwrap_or(DEFAULT_UTC_OFFSET_MINUTES);

        let config = Self {
            database_path,
            pii_hash_salt,
            metrics_bind,
            deploy_env,
            sequence_width,
            max_sequence,
            conflict_retries,
            cutover_month,
            cutover_day,
            utc_offset_minutes,
        };
        config.year_provider()?;
        Ok(config)
    }

    pub fn codec(&self) -> Result<CounterCodec, ContractViolation> {
        CounterCodec::new(
            PrefixMap::mvp_v1(),
            CounterFormat::new(self.sequence_width, self.max_sequence)?,
        )
    }

    pub fn year_provider(&self) -> Result<CutoverYearProvider, ContractViolation> {
        CutoverYearProvider::new(
            self.cutover_month,
            self.cutover_day,
            self.utc_offset_minutes,
        )
    }

    pub fn hasher(&self) -> Result<SubjectHasher, ContractViolation> {
        SubjectHasher::new(self.pii_hash_salt.clone())
    }
}

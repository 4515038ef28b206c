//! Process configuration.
//!
//! Layers, lowest precedence first:
//! 1. built-in defaults
//! 2. YAML file passed with `--config`
//! 3. `BALANCE_INTEREST_*` environment variables (`__` separates nesting,
//!    e.g. `BALANCE_INTEREST_LOGGING__LEVEL=debug`)
//! 4. the deployment variables `CONSUL_SERVER`, `REDIS_SERVICE_NAME` and
//!    `CONSUL_HTTP_TOKEN`; an empty value leaves the lower layers in effect

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use mesh_connect::{SecretString, resolve_registry_address};
use serde::{Deserialize, Serialize};

use crate::accounts::{AccountId, DEFAULT_ACCOUNTS};
use crate::interest::InterestPolicy;
use crate::job::JobSettings;

const ENV_PREFIX: &str = "BALANCE_INTEREST_";
const CONSUL_SERVER_VAR: &str = "CONSUL_SERVER";
const REDIS_SERVICE_VAR: &str = "REDIS_SERVICE_NAME";
const CONSUL_TOKEN_VAR: &str = "CONSUL_HTTP_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Registry host; empty means `localhost`. The port is always 8500.
    pub consul_server: String,

    /// ACL token sent to the registry agent.
    #[serde(skip_serializing)]
    pub consul_token: Option<SecretString>,

    /// Mesh service name of the store.
    pub redis_service_name: String,

    /// Mesh identity this job registers as.
    pub service_name: String,

    pub account_ids: Vec<AccountId>,

    /// Exclusive upper bound of the per-account increment.
    pub max_interest_increase: u32,

    /// Upper bound on discovery, connect and handshake together.
    #[serde(with = "crate::humantime_serde")]
    pub dial_timeout: Duration,

    /// Per-request timeout for registry calls.
    #[serde(with = "crate::humantime_serde")]
    pub registry_timeout: Duration,

    pub exit_policy: ExitPolicy,

    pub logging: LoggingConfig,
}

fn default_redis_service_name() -> String {
    "redis".to_owned()
}

fn default_service_name() -> String {
    "balance-interest-lambda".to_owned()
}

fn default_max_interest_increase() -> u32 {
    40
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_registry_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            consul_server: String::new(),
            consul_token: None,
            redis_service_name: default_redis_service_name(),
            service_name: default_service_name(),
            account_ids: DEFAULT_ACCOUNTS.to_vec(),
            max_interest_increase: default_max_interest_increase(),
            dial_timeout: default_dial_timeout(),
            registry_timeout: default_registry_timeout(),
            exit_policy: ExitPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// What the interactive entry point does with a failed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// Print the error and exit successfully.
    #[default]
    ReportOnly,
    /// Print the error and exit with status 1.
    FailProcess,
}

impl ExitPolicy {
    /// Process exit status for a failed run.
    #[must_use]
    pub fn failure_exit_code(self) -> u8 {
        match self {
            Self::ReportOnly => 0,
            Self::FailProcess => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// JSON when hosted by the Lambda runtime, text otherwise.
    #[default]
    Auto,
    Text,
    Json,
}

impl AppConfig {
    /// Load and validate the configuration. The environment is read once.
    ///
    /// # Errors
    /// Fails if the file is missing or malformed, an override does not
    /// deserialize, or validation rejects the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.is_file() {
                bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .context("failed to load configuration")?;
        config.apply_deployment_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_deployment_env(&mut self) {
        if let Some(host) = non_empty_var(CONSUL_SERVER_VAR) {
            self.consul_server = host;
        }
        if let Some(name) = non_empty_var(REDIS_SERVICE_VAR) {
            self.redis_service_name = name;
        }
        if let Some(token) = non_empty_var(CONSUL_TOKEN_VAR) {
            self.consul_token = Some(SecretString::new(token));
        }
    }

    /// # Errors
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.account_ids.is_empty() {
            bail!("account_ids must not be empty");
        }
        if self.max_interest_increase == 0 {
            bail!("max_interest_increase must be greater than zero");
        }
        if self.service_name.trim().is_empty() {
            bail!("service_name must not be empty");
        }
        if self.redis_service_name.trim().is_empty() {
            bail!("redis_service_name must not be empty");
        }
        if self.dial_timeout.is_zero() {
            bail!("dial_timeout must be greater than zero");
        }
        if self.registry_timeout.is_zero() {
            bail!("registry_timeout must be greater than zero");
        }
        Ok(())
    }

    /// `host:port` of the registry agent.
    #[must_use]
    pub fn registry_address(&self) -> String {
        resolve_registry_address(&self.consul_server)
    }

    /// Settings for one run of the job.
    ///
    /// # Errors
    /// Fails if the interest ceiling is zero.
    pub fn job_settings(&self) -> Result<JobSettings> {
        let policy = InterestPolicy::new(self.max_interest_increase)
            .context("max_interest_increase must be greater than zero")?;
        Ok(JobSettings {
            registry_address: self.registry_address(),
            registry_token: self.consul_token.clone(),
            registry_timeout: self.registry_timeout,
            service_name: self.service_name.clone(),
            target_service: self.redis_service_name.clone(),
            accounts: self.account_ids.clone(),
            policy,
            dial_timeout: self.dial_timeout,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

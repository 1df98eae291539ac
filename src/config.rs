use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::model::Role;

#[derive(Parser, Debug)]
#[command(name = "borrowd")]
#[command(about = "Runs the borrowing service", long_about = None)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config_path: Option<String>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".borrowd")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct App {
    database: String,
    port: u16,
    #[serde(default)]
    pub turso_url: Option<String>,
    #[serde(default)]
    pub turso_auth_token: Option<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
}

fn default_sync_interval() -> u64 {
    60
}

impl App {
    pub fn get_db(&self) -> &str {
        &self.database
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }
}

/// Longest loan the policy accepts, ten years.
pub const MAX_LOAN_PERIOD_DAYS: i64 = 3650;

/// Lending policy applied by the borrow engine.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BorrowPolicy {
    #[serde(default = "default_loan_period_days")]
    pub loan_period_days: i64,
    /// Roles allowed to open a borrow request for themselves.
    #[serde(default = "default_eligible_roles")]
    pub eligible_roles: Vec<Role>,
}

fn default_loan_period_days() -> i64 {
    7
}

fn default_eligible_roles() -> Vec<Role> {
    vec![Role::User]
}

impl Default for BorrowPolicy {
    fn default() -> Self {
        BorrowPolicy {
            loan_period_days: default_loan_period_days(),
            eligible_roles: default_eligible_roles(),
        }
    }
}

impl BorrowPolicy {
    /// `None` when the configured day count does not fit a duration.
    pub fn loan_period(&self) -> Option<chrono::Duration> {
        chrono::Duration::try_days(self.loan_period_days)
    }

    pub fn may_borrow(&self, role: Role) -> bool {
        self.eligible_roles.contains(&role)
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub borrow: BorrowPolicy,
}

impl Config {
    pub fn new(path: &str) -> Result<Self> {
        let cfg = Config::load_config(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn load_config(path: &str) -> Result<Config> {
        let yaml_str = fs::read_to_string(path)?;
        Config::from_yaml(&yaml_str)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Config> {
        let yaml_with_env = Config::substitute_env_vars(yaml_str)?;
        let config: Config = serde_yaml::from_str(&yaml_with_env)?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let days = self.borrow.loan_period_days;
        if days <= 0 {
            anyhow::bail!("borrow.loan_period_days must be positive, got {days}");
        }
        if days > MAX_LOAN_PERIOD_DAYS || self.borrow.loan_period().is_none() {
            anyhow::bail!("borrow.loan_period_days must be at most {MAX_LOAN_PERIOD_DAYS}, got {days}");
        }
        if self.borrow.eligible_roles.is_empty() {
            tracing::warn!("borrow.eligible_roles is empty, nobody will be able to open borrow requests");
        }
        Ok(())
    }

    fn substitute_env_vars(yaml_str: &str) -> Result<String> {
        let mut result = yaml_str.to_string();
        let mut offset = 0;

        while let Some(start) = result[offset..].find("${") {
            let actual_start = offset + start;
            if let Some(end) = result[actual_start..].find('}') {
                let var_name = &result[actual_start + 2..actual_start + end];

                // ${VAR:-default}
                let env_value = if let Some(default_start) = var_name.find(":-") {
                    let actual_var = &var_name[..default_start];
                    let default_val = &var_name[default_start + 2..];
                    env::var(actual_var).unwrap_or_else(|_| default_val.to_string())
                } else {
                    env::var(var_name).unwrap_or_else(|_| {
                        tracing::warn!(var = var_name, "environment variable not found");
                        String::new()
                    })
                };

                result.replace_range(actual_start..actual_start + end + 1, &env_value);
                offset = actual_start + env_value.len();
            } else {
                break;
            }
        }

        Ok(result)
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use medload_storage::{validate_identifier, CollectionName};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DryRun,
    #[default]
    Upsert,
    InsertOnly,
}

/// How a non-dry run persists rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Upsert,
    InsertOnly,
}

impl RunMode {
    pub fn write_mode(self) -> Option<WriteMode> {
        match self {
            RunMode::DryRun => None,
            RunMode::Upsert => Some(WriteMode::Upsert),
            RunMode::InsertOnly => Some(WriteMode::InsertOnly),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::DryRun => "dry-run",
            RunMode::Upsert => "upsert",
            RunMode::InsertOnly => "insert-only",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "dry-run" | "dryrun" => Ok(RunMode::DryRun),
            "upsert" => Ok(RunMode::Upsert),
            "insert-only" | "insert" | "no-upsert" => Ok(RunMode::InsertOnly),
            _ => Err(ConfigError::InvalidValue {
                key: "LOAD_MODE",
                value: s.to_string(),
                reason: "expected dry-run, upsert or insert-only".to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("an input CSV path is required (--csv or CSV_PATH)")]
    MissingCsvPath,
    #[error("a store endpoint is required unless running in dry-run mode (--database-url or DATABASE_URL)")]
    MissingDatabaseUrl,
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfig {
    pub csv_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database: String,
    pub collection: String,
    pub mode: RunMode,
    pub create_indexes: bool,
    pub chunk_size: usize,
    pub log_level: String,
    pub report_log: PathBuf,
    pub preview_limit: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            csv_path: None,
            database_url: None,
            database: "healthcare".to_string(),
            collection: "patients".to_string(),
            mode: RunMode::Upsert,
            create_indexes: false,
            chunk_size: 5000,
            log_level: "info".to_string(),
            report_log: PathBuf::from("reports/ingest_runs.log"),
            preview_limit: 5,
        }
    }
}

/// Values given directly on the command line; each one beats the environment.
#[derive(Debug, Clone, Default)]
pub struct LoadOverrides {
    pub csv_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database: Option<String>,
    pub collection: Option<String>,
    pub mode: Option<RunMode>,
    pub create_indexes: Option<bool>,
    pub chunk_size: Option<usize>,
    pub log_level: Option<String>,
    pub report_log: Option<PathBuf>,
    pub preview_limit: Option<usize>,
}

impl LoadConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source using the environment variable names.
    /// Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            csv_path: get("CSV_PATH").map(PathBuf::from),
            database_url: get("DATABASE_URL"),
            database: get("DB_NAME").unwrap_or(defaults.database),
            collection: get("DB_COLLECTION").unwrap_or(defaults.collection),
            mode: get("LOAD_MODE")
                .map(|v| v.parse::<RunMode>())
                .transpose()?
                .unwrap_or(defaults.mode),
            create_indexes: get("CREATE_INDEXES")
                .map(|v| parse_bool("CREATE_INDEXES", &v))
                .transpose()?
                .unwrap_or(defaults.create_indexes),
            chunk_size: get("CHUNK_SIZE")
                .map(|v| parse_count("CHUNK_SIZE", &v))
                .transpose()?
                .unwrap_or(defaults.chunk_size),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            report_log: get("REPORT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.report_log),
            preview_limit: get("PREVIEW_LIMIT")
                .map(|v| parse_count("PREVIEW_LIMIT", &v))
                .transpose()?
                .unwrap_or(defaults.preview_limit),
        })
    }

    /// Environment (plus `.env`, if the caller loaded it) overlaid with
    /// command-line values.
    pub fn resolve(overrides: LoadOverrides) -> Result<Self, ConfigError> {
        Ok(Self::from_env()?.with_overrides(overrides))
    }

    pub fn with_overrides(mut self, overrides: LoadOverrides) -> Self {
        if let Some(v) = overrides.csv_path {
            self.csv_path = Some(v);
        }
        if let Some(v) = overrides.database_url {
            self.database_url = Some(v);
        }
        if let Some(v) = overrides.database {
            self.database = v;
        }
        if let Some(v) = overrides.collection {
            self.collection = v;
        }
        if let Some(v) = overrides.mode {
            self.mode = v;
        }
        if let Some(v) = overrides.create_indexes {
            self.create_indexes = v;
        }
        if let Some(v) = overrides.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = overrides.log_level {
            self.log_level = v;
        }
        if let Some(v) = overrides.report_log {
            self.report_log = v;
        }
        if let Some(v) = overrides.preview_limit {
            self.preview_limit = v;
        }
        self
    }

    /// Checks everything a load needs before any row is read.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.csv_path()?;
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHUNK_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.mode.write_mode().is_some() {
            self.store_target()?;
        } else {
            self.collection_name()?;
        }
        Ok(())
    }

    pub fn csv_path(&self) -> Result<&Path, ConfigError> {
        self.csv_path.as_deref().ok_or(ConfigError::MissingCsvPath)
    }

    pub fn collection_name(&self) -> Result<CollectionName, ConfigError> {
        for (key, value) in [("DB_NAME", &self.database), ("DB_COLLECTION", &self.collection)] {
            validate_identifier(value).map_err(|err| ConfigError::InvalidValue {
                key,
                value: value.clone(),
                reason: err.to_string(),
            })?;
        }
        CollectionName::new(self.database.clone(), self.collection.clone()).map_err(|err| {
            ConfigError::InvalidValue {
                key: "DB_COLLECTION",
                value: self.collection.clone(),
                reason: err.to_string(),
            }
        })
    }

    /// Filter directive for the log subscriber. Level names are matched
    /// case-insensitively (`WARNING` reads as `warn`); full directives such as
    /// `medload_sync=debug` pass through; anything else falls back to `info`.
    pub fn log_filter(&self) -> String {
        log_filter_for(&self.log_level)
    }

    /// Endpoint and collection for runs that touch the store.
    pub fn store_target(&self) -> Result<(&str, CollectionName), ConfigError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        Ok((url, self.collection_name()?))
    }
}

fn log_filter_for(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let name = match level.to_ascii_lowercase().as_str() {
        "trace" | "notset" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" | "critical" | "fatal" => "error",
        "off" => "off",
        _ => "info",
    };
    name.to_string()
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_count(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|err: std::num::ParseIntError| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

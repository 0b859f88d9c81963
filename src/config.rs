use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::HeaderValue;

use crate::errors::ConfigError;
use crate::worker_config::{StagesSection, WorkerToml};

pub const STORE_URL_ENV: &str = "RUN_STORE_URL";
pub const STORE_KEY_ENV: &str = "RUN_STORE_SERVICE_KEY";

/// Connection settings for the remote run store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub rest_path: String,
    pub runs_table: String,
    pub events_table: String,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let section = crate::worker_config::StoreSection::default();
        Self {
            base_url: String::new(),
            service_key: String::new(),
            rest_path: section.rest_path,
            runs_table: section.runs_table,
            events_table: section.events_table,
            request_timeout_secs: section.request_timeout_secs,
        }
    }
}

/// Values given on the command line. `None` leaves the file/default value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub worker_id: Option<String>,
    pub limit: Option<usize>,
    pub timeout_sec: Option<u64>,
    pub stale_minutes: Option<i64>,
    pub interval_sec: Option<u64>,
}

/// Runtime configuration for the worker.
///
/// Built once at startup from `runclaim.toml`, the environment, and CLI flags
/// (later layers win), then passed by reference to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub worker_id: String,
    pub limit: usize,
    pub stale_minutes: i64,
    pub max_fail_count: u32,
    pub stage_timeout: Duration,
    pub poll_interval: Duration,
    pub runs_root: PathBuf,
    pub store: StoreConfig,
    pub stages: StagesSection,
    pub transient_patterns: Vec<String>,
}

impl Config {
    /// Assemble the configuration from the process environment.
    ///
    /// An explicit `config_path` must exist; otherwise `runclaim.toml` in the
    /// current directory is used when present.
    pub fn load(config_path: Option<&Path>, overrides: &CliOverrides) -> Result<Self, ConfigError> {
        let file = match config_path {
            Some(path) => WorkerToml::load(path)?,
            None => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                WorkerToml::load_or_default(&cwd)?
            }
        };
        Self::from_parts(file, |name| std::env::var(name).ok(), overrides)
    }

    /// Assemble the configuration from already-loaded layers.
    pub fn from_parts<F>(
        file: WorkerToml,
        env: F,
        overrides: &CliOverrides,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = required_env(&env, STORE_URL_ENV)?;
        let service_key = required_env(&env, STORE_KEY_ENV)?;

        let mut file = file;
        if let Some(worker_id) = &overrides.worker_id {
            file.worker.worker_id = worker_id.clone();
        }
        if let Some(limit) = overrides.limit {
            file.worker.limit = limit;
        }
        if let Some(timeout) = overrides.timeout_sec {
            file.worker.stage_timeout_secs = timeout;
        }
        if let Some(stale) = overrides.stale_minutes {
            file.worker.stale_minutes = stale;
        }
        if let Some(interval) = overrides.interval_sec {
            file.worker.poll_interval_secs = interval;
        }
        file.validate()?;

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: STORE_URL_ENV.to_string(),
                message: format!("expected an http(s) URL, got '{}'", base_url),
            });
        }

        // The key is sent as both `apikey` and `Authorization: Bearer <key>`.
        if let Err(e) = HeaderValue::from_str(&format!("Bearer {}", service_key)) {
            return Err(ConfigError::InvalidValue {
                field: STORE_KEY_ENV.to_string(),
                message: format!("not usable as an HTTP header value: {}", e),
            });
        }

        Ok(Self {
            worker_id: file.worker.worker_id,
            limit: file.worker.limit,
            stale_minutes: file.worker.stale_minutes,
            max_fail_count: file.worker.max_fail_count,
            stage_timeout: Duration::from_secs(file.worker.stage_timeout_secs),
            poll_interval: Duration::from_secs(file.worker.poll_interval_secs),
            runs_root: file.paths.runs_root,
            store: StoreConfig {
                base_url,
                service_key,
                rest_path: file.store.rest_path,
                runs_table: file.store.runs_table,
                events_table: file.store.events_table,
                request_timeout_secs: file.store.request_timeout_secs,
            },
            stages: file.stages,
            transient_patterns: file.classifier.transient_patterns,
        })
    }
}

fn required_env<F>(env: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    env(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingEnv { name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_with(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn full_env() -> impl Fn(&str) -> Option<String> {
        env_with(&[
            (STORE_URL_ENV, "https://store.example.com"),
            (STORE_KEY_ENV, "service-key"),
        ])
    }

    #[test]
    fn test_missing_store_url_is_config_error() {
        let env = env_with(&[(STORE_KEY_ENV, "k")]);
        let err = Config::from_parts(WorkerToml::default(), env, &CliOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv { name } if name == STORE_URL_ENV));
    }

    #[test]
    fn test_blank_service_key_counts_as_missing() {
        let env = env_with(&[(STORE_URL_ENV, "https://s"), (STORE_KEY_ENV, "  ")]);
        let err = Config::from_parts(WorkerToml::default(), env, &CliOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv { name } if name == STORE_KEY_ENV));
    }

    #[test]
    fn test_defaults_match_cli_contract() {
        let config =
            Config::from_parts(WorkerToml::default(), full_env(), &CliOverrides::default())
                .unwrap();
        assert_eq!(config.limit, 20);
        assert_eq!(config.worker_id, "runclaim-worker");
        assert_eq!(config.stage_timeout, Duration::from_secs(900));
        assert_eq!(config.stale_minutes, 30);
        assert_eq!(config.max_fail_count, 3);
        assert_eq!(config.store.base_url, "https://store.example.com");
        assert_eq!(config.store.request_timeout_secs, 20);
    }

    #[test]
    fn test_cli_overrides_win_over_file() {
        let mut file = WorkerToml::default();
        file.worker.worker_id = "from-file".into();
        file.worker.limit = 5;

        let overrides = CliOverrides {
            worker_id: Some("from-cli".into()),
            timeout_sec: Some(60),
            ..Default::default()
        };
        let config = Config::from_parts(file, full_env(), &overrides).unwrap();
        assert_eq!(config.worker_id, "from-cli");
        assert_eq!(config.limit, 5);
        assert_eq!(config.stage_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let overrides = CliOverrides {
            limit: Some(0),
            ..Default::default()
        };
        let err = Config::from_parts(WorkerToml::default(), full_env(), &overrides).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_non_http_store_url_is_rejected() {
        let env = env_with(&[(STORE_URL_ENV, "store.example.com"), (STORE_KEY_ENV, "k")]);
        let err = Config::from_parts(WorkerToml::default(), env, &CliOverrides::default())
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, STORE_URL_ENV),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_service_key_with_control_characters_is_rejected() {
        let env = env_with(&[
            (STORE_URL_ENV, "https://store.example.com"),
            (STORE_KEY_ENV, "line-one\nline-two"),
        ]);
        let err = Config::from_parts(WorkerToml::default(), env, &CliOverrides::default())
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, STORE_KEY_ENV),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_load_with_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = Config::load(Some(&missing), &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}

//! Process settings, read once at startup from `AGENTSPAN_*` environment
//! variables (a `.env` file is honored).

use agentspan_convert::GuardrailParent;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(String),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Inconsistent settings: {0}")]
    Inconsistent(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

pub const ENV_PREFIX: &str = "AGENTSPAN_";

#[derive(Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub url: String,
    pub public_key: String,
    pub secret_key: String,
    /// Per-request timeout for span export.
    pub timeout: Duration,
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSettings")
            .field("url", &self.url)
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    pub batch_size: usize,
    /// Attempts per batch, the first one included.
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub workers: usize,
    /// Visibility timeout of a pulled job.
    pub lease: Duration,
    /// How long one queue pull blocks.
    pub poll_timeout: Duration,
    /// Ceiling on conversion plus export for one job.
    pub job_timeout: Duration,
    /// Deliveries after which a job is failed instead of retried.
    pub max_deliveries: u32,
    pub guardrail_parent: GuardrailParent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub environment: String,
    pub service_name: String,
    /// Terminal jobs older than this are purged.
    pub retention: Duration,
    pub backend: BackendSettings,
    pub export: ExportSettings,
    pub worker: WorkerSettings,
}

impl Settings {
    /// Loads `.env` if present, then reads and validates the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring unreadable .env"),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, which receives full variable names
    /// (`AGENTSPAN_BACKEND_URL`, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let settings = Self {
            bind_addr: env.parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            database_path: PathBuf::from(env.string_or("DATABASE_PATH", "data/agentspan.db")),
            environment: env.string_or("ENVIRONMENT", "development"),
            service_name: env.string_or("SERVICE_NAME", "agentspan"),
            retention: Duration::from_secs(env.parse_or::<u64>("RETENTION_HOURS", 24)? * 3600),
            backend: BackendSettings {
                url: env.required("BACKEND_URL")?,
                public_key: env.required("PUBLIC_KEY")?,
                secret_key: env.required("SECRET_KEY")?,
                timeout: Duration::from_secs(env.parse_or("EXPORT_TIMEOUT_SECS", 30)?),
            },
            export: ExportSettings {
                batch_size: env.parse_or("EXPORT_BATCH_SIZE", 64)?,
                max_attempts: env.parse_or("EXPORT_MAX_ATTEMPTS", 4)?,
                backoff_initial: Duration::from_millis(env.parse_or("BACKOFF_INITIAL_MS", 200)?),
                backoff_max: Duration::from_millis(env.parse_or("BACKOFF_MAX_MS", 10_000)?),
            },
            worker: WorkerSettings {
                workers: env.parse_or("WORKERS", 4)?,
                lease: Duration::from_secs(env.parse_or("LEASE_SECS", 120)?),
                poll_timeout: Duration::from_millis(env.parse_or("POLL_TIMEOUT_MS", 1000)?),
                job_timeout: Duration::from_secs(env.parse_or("JOB_TIMEOUT_SECS", 60)?),
                max_deliveries: env.parse_or("MAX_DELIVERIES", 5)?,
                guardrail_parent: env.guardrail_parent()?,
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backend.url.starts_with("http://") && !self.backend.url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: format!("{ENV_PREFIX}BACKEND_URL"),
                value: self.backend.url.clone(),
                reason: "expected an http(s) URL".into(),
            });
        }
        if self.worker.workers == 0 {
            return Err(ConfigError::Inconsistent("at least one worker is required".into()));
        }
        if self.export.batch_size == 0 {
            return Err(ConfigError::Inconsistent("export batch size must be positive".into()));
        }
        if self.export.max_attempts == 0 {
            return Err(ConfigError::Inconsistent("export attempts must be positive".into()));
        }
        if self.worker.max_deliveries == 0 {
            return Err(ConfigError::Inconsistent("max deliveries must be positive".into()));
        }
        if self.export.backoff_initial > self.export.backoff_max {
            return Err(ConfigError::Inconsistent(
                "initial backoff exceeds maximum backoff".into(),
            ));
        }
        if self.worker.lease <= self.worker.job_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "lease ({:?}) must exceed the job timeout ({:?})",
                self.worker.lease, self.worker.job_timeout
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lookup helpers
// ─────────────────────────────────────────────────────────────────────────────

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<(String, String)> {
        let name = format!("{ENV_PREFIX}{key}");
        let value = (self.lookup)(&name)?;
        let value = value.trim().to_string();
        (!value.is_empty()).then_some((name, value))
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .map(|(_, value)| value)
            .ok_or_else(|| ConfigError::Missing(format!("{ENV_PREFIX}{key}")))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key)
            .map(|(_, value)| value)
            .unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some((name, value)) = self.get(key) else {
            return Ok(default);
        };
        value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: name,
            value: value.clone(),
            reason: e.to_string(),
        })
    }

    fn guardrail_parent(&self) -> Result<GuardrailParent, ConfigError> {
        let Some((name, value)) = self.get("GUARDRAIL_PARENT") else {
            return Ok(GuardrailParent::default());
        };
        GuardrailParent::parse(&value).ok_or(ConfigError::Invalid {
            key: name,
            value,
            reason: "expected `orchestration` or `root`".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut vars: HashMap<String, String> = [
            ("AGENTSPAN_BACKEND_URL", "https://cloud.example.com"),
            ("AGENTSPAN_PUBLIC_KEY", "pk-1"),
            ("AGENTSPAN_SECRET_KEY", "sk-1"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            vars.insert(k.to_string(), v.to_string());
        }
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();

        assert_eq!(settings.bind_addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(settings.database_path, PathBuf::from("data/agentspan.db"));
        assert_eq!(settings.worker.workers, 4);
        assert_eq!(settings.worker.lease, Duration::from_secs(120));
        assert_eq!(settings.worker.job_timeout, Duration::from_secs(60));
        assert_eq!(settings.worker.max_deliveries, 5);
        assert_eq!(settings.worker.guardrail_parent, GuardrailParent::OpenOrchestration);
        assert_eq!(settings.export.batch_size, 64);
        assert_eq!(settings.export.max_attempts, 4);
        assert_eq!(settings.retention, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("AGENTSPAN_WORKERS", "8"),
            ("AGENTSPAN_GUARDRAIL_PARENT", "root"),
            ("AGENTSPAN_EXPORT_BATCH_SIZE", " 16 "),
            ("AGENTSPAN_BIND_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap();

        assert_eq!(settings.worker.workers, 8);
        assert_eq!(settings.worker.guardrail_parent, GuardrailParent::Root);
        assert_eq!(settings.export.batch_size, 16);
        assert_eq!(settings.bind_addr.port(), 9000);
    }

    #[test]
    fn test_missing_credentials() {
        let err = Settings::from_lookup(|key: &str| {
            (key == "AGENTSPAN_BACKEND_URL").then(|| "https://cloud.example.com".to_string())
        })
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing("AGENTSPAN_PUBLIC_KEY".into()));
    }

    #[test]
    fn test_invalid_values() {
        let err = Settings::from_lookup(lookup(&[("AGENTSPAN_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "AGENTSPAN_WORKERS"));

        let err =
            Settings::from_lookup(lookup(&[("AGENTSPAN_GUARDRAIL_PARENT", "leaf")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = Settings::from_lookup(lookup(&[("AGENTSPAN_BACKEND_URL", "ftp://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_lease_must_exceed_job_timeout() {
        let err = Settings::from_lookup(lookup(&[
            ("AGENTSPAN_LEASE_SECS", "30"),
            ("AGENTSPAN_JOB_TIMEOUT_SECS", "30"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let err = Settings::from_lookup(lookup(&[("AGENTSPAN_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        let debug = format!("{settings:?}");
        assert!(!debug.contains("sk-1"));
        assert!(debug.contains("pk-1"));
    }
}

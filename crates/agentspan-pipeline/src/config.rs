//! Per-job pipeline settings.

use agentspan_config::Settings;
use agentspan_convert::GuardrailParent;
use agentspan_export::{BackoffConfig, ExportPolicy};
use std::time::Duration;

/// Settings a worker captures when it picks up a job. Changing the pool's
/// config never affects a job already in hand.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub lease: Duration,
    pub poll_timeout: Duration,
    /// Ceiling on conversion plus export.
    pub job_timeout: Duration,
    /// Pause after an infrastructure error before pulling again.
    pub error_backoff: Duration,
    pub max_deliveries: u32,
    pub guardrail_parent: GuardrailParent,
    pub export: ExportPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(120),
            poll_timeout: Duration::from_secs(1),
            job_timeout: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
            max_deliveries: 5,
            guardrail_parent: GuardrailParent::default(),
            export: ExportPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let worker = &settings.worker;
        let export = &settings.export;
        Self {
            lease: worker.lease,
            poll_timeout: worker.poll_timeout,
            job_timeout: worker.job_timeout,
            max_deliveries: worker.max_deliveries,
            guardrail_parent: worker.guardrail_parent,
            export: ExportPolicy {
                batch_size: export.batch_size,
                backoff: BackoffConfig {
                    initial_delay: export.backoff_initial,
                    max_delay: export.backoff_max,
                    max_attempts: export.max_attempts,
                    ..BackoffConfig::default()
                },
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let settings = Settings::from_lookup(|key| match key {
            "AGENTSPAN_BACKEND_URL" => Some("http://localhost:3000".into()),
            "AGENTSPAN_PUBLIC_KEY" => Some("pk".into()),
            "AGENTSPAN_SECRET_KEY" => Some("sk".into()),
            "AGENTSPAN_EXPORT_MAX_ATTEMPTS" => Some("6".into()),
            "AGENTSPAN_GUARDRAIL_PARENT" => Some("root".into()),
            _ => None,
        })
        .unwrap();

        let config = PipelineConfig::from_settings(&settings);
        assert_eq!(config.export.backoff.max_attempts, 6);
        assert_eq!(config.export.batch_size, 64);
        assert_eq!(config.guardrail_parent, GuardrailParent::Root);
        assert_eq!(config.lease, Duration::from_secs(120));
        assert!(config.lease > config.job_timeout);
    }
}

use crate::types::SyncDirection;
use serde::Deserialize;
use serde_with::serde_as;
use std::time;
use url::Url;

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    pub mailerlite: MailerliteSettings,
    #[serde(default)]
    pub backfill: BackfillSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default = "default_snapshot_interval")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub rate_limit_snapshot_interval: time::Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MailerliteSettings {
    #[serde(default = "default_api_url")]
    pub api_url: Url,
    pub api_token: String,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub request_timeout: time::Duration,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackfillSettings {
    /// Chunk size for the crosswalk-building phases.
    #[serde(default = "default_record_chunk_size")]
    pub record_chunk_size: u64,
    /// Chunk size for the shadow-creation phase.
    #[serde(default = "default_pair_chunk_size")]
    pub pair_chunk_size: u64,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            record_chunk_size: default_record_chunk_size(),
            pair_chunk_size: default_pair_chunk_size(),
        }
    }
}

/// The long-lived reconciliation loop that replaces one-shot invocations
/// when enabled.
#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkerSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_worker_interval")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub interval: time::Duration,
    #[serde(default = "default_worker_direction")]
    pub direction: SyncDirection,
    #[serde(default = "default_worker_max_records")]
    pub max_records: u64,
    /// Per-iteration wall-clock budget.
    #[serde(default = "default_worker_max_duration")]
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub max_duration: time::Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_worker_interval(),
            direction: default_worker_direction(),
            max_records: default_worker_max_records(),
            max_duration: default_worker_max_duration(),
        }
    }
}

fn default_api_url() -> Url {
    Url::parse("https://connect.mailerlite.com/").expect("should be valid url")
}

fn default_request_timeout() -> time::Duration {
    time::Duration::from_secs(30)
}

fn default_requests_per_minute() -> u32 {
    crate::rate_limiter::MAILERLITE_REQUESTS_PER_MINUTE
}

fn default_snapshot_interval() -> time::Duration {
    time::Duration::from_secs(5)
}

fn default_record_chunk_size() -> u64 {
    100
}

fn default_pair_chunk_size() -> u64 {
    500
}

fn default_worker_interval() -> time::Duration {
    time::Duration::from_secs(300)
}

fn default_worker_direction() -> SyncDirection {
    SyncDirection::Both
}

fn default_worker_max_records() -> u64 {
    500
}

fn default_worker_max_duration() -> time::Duration {
    time::Duration::from_secs(120)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let settings: SyncSettings = serde_json::from_value(serde_json::json!({
            "mailerlite": {"api_token": "token"}
        }))
        .expect("valid settings");

        assert_eq!(
            settings.mailerlite.api_url.as_str(),
            "https://connect.mailerlite.com/"
        );
        assert_eq!(settings.mailerlite.requests_per_minute, 120);
        assert_eq!(
            settings.mailerlite.request_timeout,
            time::Duration::from_secs(30)
        );
        assert_eq!(settings.backfill.record_chunk_size, 100);
        assert_eq!(settings.backfill.pair_chunk_size, 500);
        assert!(!settings.worker.enabled);
        assert_eq!(settings.worker.direction, SyncDirection::Both);
    }

    #[test]
    fn durations_deserialize_from_seconds() {
        let settings: SyncSettings = serde_json::from_value(serde_json::json!({
            "mailerlite": {"api_token": "token", "request_timeout": 10},
            "worker": {"enabled": true, "interval": 60, "max_duration": 45},
            "rate_limit_snapshot_interval": 2
        }))
        .expect("valid settings");

        assert_eq!(
            settings.mailerlite.request_timeout,
            time::Duration::from_secs(10)
        );
        assert_eq!(settings.worker.interval, time::Duration::from_secs(60));
        assert_eq!(settings.worker.max_duration, time::Duration::from_secs(45));
        assert_eq!(
            settings.rate_limit_snapshot_interval,
            time::Duration::from_secs(2)
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_value::<SyncSettings>(serde_json::json!({
            "mailerlite": {"api_token": "token"},
            "unknown": true
        }));
        assert!(result.is_err());
    }
}

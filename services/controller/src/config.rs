use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use appctl_reconcile::{
    BackoffPolicy, SubordinatePolicy, DEFAULT_DELETE_POLL_INTERVAL, DEFAULT_MAX_CONFLICT_RETRIES,
    DEFAULT_REDIS_IMAGE, DEFAULT_RESYNC_INTERVAL, DEFAULT_RETRY_WINDOW,
};

use crate::reconciler::ReconcilerSettings;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub resync_interval: Duration,
    pub delete_poll_interval: Duration,
    pub reconcile_timeout: Duration,
    pub max_concurrent_reconciles: usize,
    pub max_conflict_retries: u32,
    pub redis_image: String,
    pub redis_policy: SubordinatePolicy,
    /// JSON array of declarations loaded at startup.
    pub seed_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("APPCTL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let resync_interval = secs(&lookup, "APPCTL_RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_INTERVAL)?;
        let delete_poll_interval = secs(
            &lookup,
            "APPCTL_DELETE_POLL_INTERVAL_SECS",
            DEFAULT_DELETE_POLL_INTERVAL,
        )?;
        let reconcile_timeout = secs(&lookup, "APPCTL_RECONCILE_TIMEOUT_SECS", Duration::from_secs(120))?;

        let max_concurrent_reconciles: usize = parse(&lookup, "APPCTL_MAX_CONCURRENT_RECONCILES", 4)?;
        if max_concurrent_reconciles == 0 {
            anyhow::bail!("APPCTL_MAX_CONCURRENT_RECONCILES must be at least 1");
        }
        let max_conflict_retries = parse(
            &lookup,
            "APPCTL_MAX_CONFLICT_RETRIES",
            DEFAULT_MAX_CONFLICT_RETRIES,
        )?;

        let redis_image = lookup("APPCTL_REDIS_IMAGE").unwrap_or_else(|| DEFAULT_REDIS_IMAGE.to_string());

        let redis_policy = match lookup("APPCTL_REDIS_POLICY") {
            Some(value) => value
                .parse::<SubordinatePolicy>()
                .map_err(anyhow::Error::msg)
                .context("invalid APPCTL_REDIS_POLICY")?,
            None => SubordinatePolicy::default(),
        };

        let seed_file = lookup("APPCTL_SEED_FILE").map(PathBuf::from);

        Ok(Self {
            log_level,
            resync_interval,
            delete_poll_interval,
            reconcile_timeout,
            max_concurrent_reconciles,
            max_conflict_retries,
            redis_image,
            redis_policy,
            seed_file,
        })
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            redis_image: self.redis_image.clone(),
            subordinate_policy: self.redis_policy,
            max_conflict_retries: self.max_conflict_retries,
            unconfirmed_requeue: self.delete_poll_interval,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            resync_interval: self.resync_interval,
            reconcile_timeout: self.reconcile_timeout,
            max_concurrent: self.max_concurrent_reconciles,
            backoff: BackoffPolicy::default(),
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {value:?}")),
        None => Ok(default),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Result<Duration> {
    let secs = parse(lookup, name, default.as_secs())?;
    if secs == 0 {
        anyhow::bail!("{name} must be at least 1 second");
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.delete_poll_interval, Duration::from_secs(5));
        assert_eq!(config.reconcile_timeout, Duration::from_secs(120));
        assert_eq!(config.max_concurrent_reconciles, 4);
        assert_eq!(config.max_conflict_retries, 3);
        assert_eq!(config.redis_image, "redis:latest");
        assert_eq!(config.redis_policy, SubordinatePolicy::CreateOnly);
        assert!(config.seed_file.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("APPCTL_RESYNC_INTERVAL_SECS", "60"),
            ("APPCTL_REDIS_POLICY", "sync-replicas"),
            ("APPCTL_REDIS_IMAGE", "redis:7"),
            ("APPCTL_SEED_FILE", "/etc/appctl/apps.json"),
        ])
        .unwrap();
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(config.redis_policy, SubordinatePolicy::SyncReplicas);
        assert_eq!(config.reconciler_settings().redis_image, "redis:7");
        assert_eq!(config.seed_file, Some(PathBuf::from("/etc/appctl/apps.json")));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(config(&[("APPCTL_RESYNC_INTERVAL_SECS", "soon")]).is_err());
        assert!(config(&[("APPCTL_DELETE_POLL_INTERVAL_SECS", "0")]).is_err());
        assert!(config(&[("APPCTL_MAX_CONCURRENT_RECONCILES", "0")]).is_err());
        assert!(config(&[("APPCTL_REDIS_POLICY", "always")]).is_err());
    }
}

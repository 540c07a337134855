//! Controller configuration from environment variables

use crate::error::ControllerError;
use crds::parse_duration;
use results::{RetentionPolicy, DEFAULT_RESULTS_NAMESPACE};
use std::time::Duration;

/// Results kept per project/target when `RESULTS_KEEP_COUNT` is unset
pub const DEFAULT_RESULTS_KEEP_COUNT: usize = 5;

/// Concurrent reconciles when `CONTROLLER_CONCURRENCY` is unset
pub const DEFAULT_CONCURRENCY: u16 = 4;

/// Default engine executable used by the process pipeline
pub const DEFAULT_PIPELINE_COMMAND: &str = "kluctl-engine";

/// Runtime configuration of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Only watch this namespace; all namespaces when unset
    pub watch_namespace: Option<String>,
    /// Namespace holding result Secrets
    pub results_namespace: String,
    pub retention: RetentionPolicy,
    /// Executable speaking the pipeline protocol
    pub pipeline_command: String,
    /// Upper bound of concurrent reconciles
    pub concurrency: u16,
    /// Delay between cluster accessor initialization attempts
    pub cluster_retry_interval: Duration,
}

impl Config {
    /// Reads the configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let keep_count = match get("RESULTS_KEEP_COUNT") {
            Some(v) => v.parse::<usize>().map_err(|e| {
                ControllerError::InvalidConfig(format!("RESULTS_KEEP_COUNT {:?} is not a number: {}", v, e))
            })?,
            None => DEFAULT_RESULTS_KEEP_COUNT,
        };
        let keep_age = get("RESULTS_KEEP_AGE")
            .map(|v| parse_env_duration("RESULTS_KEEP_AGE", &v))
            .transpose()?;

        let concurrency = match get("CONTROLLER_CONCURRENCY") {
            Some(v) => match v.parse::<u16>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ControllerError::InvalidConfig(format!(
                        "CONTROLLER_CONCURRENCY {:?} must be a positive number",
                        v
                    )));
                }
            },
            None => DEFAULT_CONCURRENCY,
        };

        let cluster_retry_interval = match get("CLUSTER_RETRY_INTERVAL") {
            Some(v) => parse_env_duration("CLUSTER_RETRY_INTERVAL", &v)?,
            None => cluster_accessor::DEFAULT_RETRY_INTERVAL,
        };

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            results_namespace: get("RESULTS_NAMESPACE").unwrap_or_else(|| DEFAULT_RESULTS_NAMESPACE.to_string()),
            retention: RetentionPolicy::new(keep_count, keep_age),
            pipeline_command: get("PIPELINE_COMMAND").unwrap_or_else(|| DEFAULT_PIPELINE_COMMAND.to_string()),
            concurrency,
            cluster_retry_interval,
        })
    }
}

fn parse_env_duration(name: &str, value: &str) -> Result<Duration, ControllerError> {
    parse_duration(value).map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ControllerError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.watch_namespace, None);
        assert_eq!(c.results_namespace, DEFAULT_RESULTS_NAMESPACE);
        assert_eq!(c.retention, RetentionPolicy::new(DEFAULT_RESULTS_KEEP_COUNT, None));
        assert_eq!(c.pipeline_command, DEFAULT_PIPELINE_COMMAND);
        assert_eq!(c.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(c.cluster_retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("WATCH_NAMESPACE", "apps"),
            ("RESULTS_NAMESPACE", "results"),
            ("RESULTS_KEEP_COUNT", "0"),
            ("RESULTS_KEEP_AGE", "24h"),
            ("PIPELINE_COMMAND", "/usr/local/bin/engine"),
            ("CONTROLLER_CONCURRENCY", "8"),
            ("CLUSTER_RETRY_INTERVAL", "10s"),
        ])
        .unwrap();
        assert_eq!(c.watch_namespace.as_deref(), Some("apps"));
        assert_eq!(c.results_namespace, "results");
        assert_eq!(c.retention, RetentionPolicy::new(0, Some(Duration::from_secs(86400))));
        assert_eq!(c.pipeline_command, "/usr/local/bin/engine");
        assert_eq!(c.concurrency, 8);
        assert_eq!(c.cluster_retry_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let c = config(&[("WATCH_NAMESPACE", ""), ("RESULTS_NAMESPACE", " ")]).unwrap();
        assert_eq!(c.watch_namespace, None);
        assert_eq!(c.results_namespace, DEFAULT_RESULTS_NAMESPACE);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(config(&[("RESULTS_KEEP_COUNT", "many")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(config(&[("RESULTS_KEEP_AGE", "forever")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(config(&[("CONTROLLER_CONCURRENCY", "0")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(config(&[("CLUSTER_RETRY_INTERVAL", "x")]), Err(ControllerError::InvalidConfig(_))));
    }
}

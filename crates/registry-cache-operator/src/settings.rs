//! Operator settings
//!
//! Read once at start-up from the environment and handed to every component
//! behind an `Arc`. Nothing reads the environment after start-up.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;
use tracing::warn;

use crate::quantity::{parse_storage_quantity, QuantityError};

/// Default cache volume size
pub const DEFAULT_CACHE_SIZE: &str = "10Gi";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{var} must not be empty")]
    Empty { var: &'static str },
    #[error("invalid default cache size: {0}")]
    DefaultSize(#[from] QuantityError),
    #[error("discovery poll interval must be greater than zero")]
    ZeroInterval,
}

/// Fixed-interval, bounded polling used by endpoint discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    /// Pause between two attempts
    pub poll_interval: Duration,
    /// Number of list attempts before giving up (at least 1)
    pub max_attempts: u32,
}

impl DiscoveryPolicy {
    /// Derive the attempt bound from an overall timeout
    pub fn from_timeout(poll_interval: Duration, timeout: Duration) -> Self {
        let attempts = match poll_interval.as_nanos() {
            0 => 1,
            interval => (timeout.as_nanos() / interval).max(1),
        };
        Self {
            poll_interval,
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }
    }
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self::from_timeout(Duration::from_secs(5), Duration::from_secs(60))
    }
}

/// Read-only configuration shared by all components
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    /// Image of the pull-through cache server
    pub cache_image: String,
    /// Image of the node agent
    pub agent_image: String,
    /// Namespace holding cache workloads and the node agent
    pub cache_namespace: String,
    /// Volume size used when a cache declares none
    pub default_cache_size: Quantity,
    /// Endpoint discovery polling
    pub discovery: DiscoveryPolicy,
    /// Bound for waiting on bundle deletion
    pub delete_timeout: Duration,
    /// Poll interval while waiting on bundle deletion
    pub delete_poll_interval: Duration,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
    /// Health probe port
    pub health_port: u16,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            cache_image: "registry:2".to_string(),
            agent_image: "registry-cache-agent:latest".to_string(),
            cache_namespace: "registry-cache".to_string(),
            default_cache_size: Quantity(DEFAULT_CACHE_SIZE.to_string()),
            discovery: DiscoveryPolicy::default(),
            delete_timeout: Duration::from_secs(120),
            delete_poll_interval: Duration::from_secs(2),
            resync_interval: Duration::from_secs(300),
            health_port: crate::health::DEFAULT_HEALTH_PORT,
        }
    }
}

impl OperatorSettings {
    /// Load settings from environment variables.
    ///
    /// Environment variables:
    /// - `REGISTRY_CACHE_IMAGE`: cache server image (default: `registry:2`)
    /// - `REGISTRY_CACHE_AGENT_IMAGE`: node agent image
    /// - `REGISTRY_CACHE_NAMESPACE`: workload namespace (default: `registry-cache`)
    /// - `REGISTRY_CACHE_DEFAULT_SIZE`: default volume size (default: `10Gi`)
    /// - `DISCOVERY_POLL_INTERVAL_SECS`: discovery poll interval (default: 5)
    /// - `DISCOVERY_TIMEOUT_SECS`: discovery bound (default: 60)
    /// - `BUNDLE_DELETE_TIMEOUT_SECS`: deletion wait bound (default: 120)
    /// - `RESYNC_INTERVAL_SECS`: periodic requeue (default: 300)
    /// - `HEALTH_PORT`: health probe port (default: 8081)
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cache_image = string_var(&lookup, "REGISTRY_CACHE_IMAGE", defaults.cache_image)?;
        let agent_image = string_var(&lookup, "REGISTRY_CACHE_AGENT_IMAGE", defaults.agent_image)?;
        let cache_namespace =
            string_var(&lookup, "REGISTRY_CACHE_NAMESPACE", defaults.cache_namespace)?;

        let default_cache_size = match lookup("REGISTRY_CACHE_DEFAULT_SIZE") {
            Some(raw) => parse_storage_quantity(&raw)?,
            None => defaults.default_cache_size,
        };

        let poll_interval = secs_var(
            &lookup,
            "DISCOVERY_POLL_INTERVAL_SECS",
            defaults.discovery.poll_interval,
        );
        if poll_interval.is_zero() {
            return Err(SettingsError::ZeroInterval);
        }
        let discovery_timeout = secs_var(&lookup, "DISCOVERY_TIMEOUT_SECS", Duration::from_secs(60));

        Ok(Self {
            cache_image,
            agent_image,
            cache_namespace,
            default_cache_size,
            discovery: DiscoveryPolicy::from_timeout(poll_interval, discovery_timeout),
            delete_timeout: secs_var(&lookup, "BUNDLE_DELETE_TIMEOUT_SECS", defaults.delete_timeout),
            delete_poll_interval: defaults.delete_poll_interval,
            resync_interval: secs_var(&lookup, "RESYNC_INTERVAL_SECS", defaults.resync_interval),
            health_port: port_var(&lookup, "HEALTH_PORT", defaults.health_port),
        })
    }
}

fn string_var<F>(lookup: &F, var: &'static str, default: String) -> Result<String, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(v) if v.trim().is_empty() => Err(SettingsError::Empty { var }),
        Some(v) => Ok(v.trim().to_string()),
        None => Ok(default),
    }
}

fn secs_var<F>(lookup: &F, var: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(v) => match v.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(e) => {
                warn!(
                    env_var = var,
                    value = %v,
                    error = %e,
                    default_secs = default.as_secs(),
                    "Failed to parse duration env var, using default"
                );
                default
            }
        },
        None => default,
    }
}

fn port_var<F>(lookup: &F, var: &str, default: u16) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(v) => v.trim().parse::<u16>().unwrap_or_else(|e| {
            warn!(env_var = var, value = %v, error = %e, "Failed to parse port env var, using default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = OperatorSettings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(settings.cache_namespace, "registry-cache");
        assert_eq!(settings.default_cache_size.0, "10Gi");
        assert_eq!(settings.discovery.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.discovery.max_attempts, 12);
        assert_eq!(settings.delete_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_overrides() {
        let settings = OperatorSettings::from_lookup(lookup_from(&[
            ("REGISTRY_CACHE_IMAGE", "example.com/registry:2.8.3"),
            ("REGISTRY_CACHE_NAMESPACE", "caches"),
            ("REGISTRY_CACHE_DEFAULT_SIZE", "2Gi"),
            ("DISCOVERY_POLL_INTERVAL_SECS", "2"),
            ("DISCOVERY_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(settings.cache_image, "example.com/registry:2.8.3");
        assert_eq!(settings.cache_namespace, "caches");
        assert_eq!(settings.default_cache_size.0, "2Gi");
        assert_eq!(settings.discovery.max_attempts, 15);
    }

    #[test]
    fn test_unparseable_duration_falls_back() {
        let settings =
            OperatorSettings::from_lookup(lookup_from(&[("BUNDLE_DELETE_TIMEOUT_SECS", "soon")]))
                .unwrap();
        assert_eq!(settings.delete_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_default_size_is_an_error() {
        let result =
            OperatorSettings::from_lookup(lookup_from(&[("REGISTRY_CACHE_DEFAULT_SIZE", "lots")]));
        assert!(matches!(result, Err(SettingsError::DefaultSize(_))));
    }

    #[test]
    fn test_empty_image_is_an_error() {
        let result = OperatorSettings::from_lookup(lookup_from(&[("REGISTRY_CACHE_IMAGE", " ")]));
        assert!(matches!(result, Err(SettingsError::Empty { .. })));
    }

    #[test]
    fn test_zero_interval_is_an_error() {
        let result =
            OperatorSettings::from_lookup(lookup_from(&[("DISCOVERY_POLL_INTERVAL_SECS", "0")]));
        assert!(matches!(result, Err(SettingsError::ZeroInterval)));
    }

    #[test]
    fn test_policy_with_sub_millisecond_interval() {
        let policy =
            DiscoveryPolicy::from_timeout(Duration::from_micros(500), Duration::from_millis(2));
        assert_eq!(policy.max_attempts, 4);

        let policy = DiscoveryPolicy::from_timeout(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn test_policy_has_at_least_one_attempt() {
        let policy = DiscoveryPolicy::from_timeout(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }
}

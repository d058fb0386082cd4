//! Operator configuration read from the process environment

use std::time::Duration;

use tracing::warn;

/// Default upper bound on one publication mutation
pub const DEFAULT_PUBLICATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Default recheck interval while old logins are draining
pub const DEFAULT_DRAIN_RECHECK: Duration = Duration::from_secs(30);
/// Default requeue while a dependency is not ready yet
pub const DEFAULT_NOT_READY_REQUEUE: Duration = Duration::from_secs(10);

/// Runtime settings of the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Restrict all watches to one namespace (`None` = cluster-wide)
    pub watch_namespace: Option<String>,
    pub publication_timeout: Duration,
    pub drain_recheck: Duration,
    pub not_ready_requeue: Duration,
    /// Leader-election identity
    pub pod_name: String,
    /// Namespace holding the leader-election lease
    pub pod_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            publication_timeout: DEFAULT_PUBLICATION_TIMEOUT,
            drain_recheck: DEFAULT_DRAIN_RECHECK,
            not_ready_requeue: DEFAULT_NOT_READY_REQUEUE,
            pod_name: "postgres-provisioner".to_string(),
            pod_namespace: "default".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            publication_timeout: seconds(
                "PUBLICATION_TIMEOUT_SECS",
                non_empty("PUBLICATION_TIMEOUT_SECS"),
                defaults.publication_timeout,
            ),
            drain_recheck: seconds(
                "DRAIN_RECHECK_SECS",
                non_empty("DRAIN_RECHECK_SECS"),
                defaults.drain_recheck,
            ),
            not_ready_requeue: seconds(
                "NOT_READY_REQUEUE_SECS",
                non_empty("NOT_READY_REQUEUE_SECS"),
                defaults.not_ready_requeue,
            ),
            pod_name: non_empty("POD_NAME")
                .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
                .unwrap_or(defaults.pod_name),
            pod_namespace: non_empty("POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
        }
    }
}

fn seconds(key: &str, raw: Option<String>, default: Duration) -> Duration {
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                warn!(variable = key, value = %raw, default = ?default, "Ignoring invalid duration");
                default
            }
        },
    }
}

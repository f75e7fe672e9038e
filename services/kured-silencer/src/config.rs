//! Configuration for kured-silencer.
//!
//! Every setting is a command-line flag with an environment variable
//! fallback, so the same binary works from a shell and from a pod spec.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;
use thiserror::Error;

use crate::alertmanager::{Matcher, SilenceTemplate};
use crate::handler::HandlerConfig;
use crate::leader::ElectionConfig;
use crate::reconciler::ReconcilerConfig;
use kured_reconcile::BackoffPolicy;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid alertmanager endpoint {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid scheme {0:?}: expected http or https")]
    InvalidScheme(String),

    #[error("missing host")]
    MissingHost,

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{longer} must be greater than {shorter}")]
    Ordering {
        longer: &'static str,
        shorter: &'static str,
    },

    #[error("leader election needs a pod identity: set POD_NAME or --pod-name")]
    MissingPodName,

    #[error("leader election needs a namespace: set POD_NAMESPACE or --pod-namespace")]
    MissingPodNamespace,
}

/// Validate the Alertmanager endpoint: http(s) scheme and a non-empty host.
pub fn validate_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::EmptyHost) => return Err(ConfigError::MissingHost),
        Err(source) => {
            return Err(ConfigError::InvalidUrl {
                url: raw.to_string(),
                source,
            })
        }
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidScheme(url.scheme().to_string()));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::MissingHost);
    }

    Ok(url)
}

/// Silences Alertmanager alerts while nodes carry the kured reboot label.
#[derive(Debug, Clone, Parser)]
#[command(name = "kured-silencer")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to a kubeconfig file, used when not running in a cluster.
    ///
    /// Setting it also disables leader election.
    #[arg(long, env = "KUBECONFIG_PATH")]
    pub kubeconfig_path: Option<PathBuf>,

    /// Label selector identifying nodes that are about to reboot.
    #[arg(long, env = "KURED_LABEL")]
    pub kured_label: String,

    /// Alertmanager base URL (example: http://alertmanager:9093).
    #[arg(long, env = "ALERTMANAGER_ENDPOINT")]
    pub alertmanager_endpoint: String,

    /// Silence duration in minutes.
    #[arg(long = "silence-duration", env = "SILENCE_DURATION", default_value_t = 15)]
    pub silence_duration_mins: u64,

    /// Seconds to wait after the label is removed before lifting silences.
    #[arg(long = "removal-buffer", env = "REMOVAL_BUFFER", default_value_t = 60)]
    pub removal_buffer_secs: u64,

    /// Severities to silence; one silence is created per severity.
    #[arg(
        long,
        env = "SILENCE_SEVERITIES",
        value_delimiter = ',',
        default_values_t = ["warning".to_string(), "critical".to_string()]
    )]
    pub severities: Vec<String>,

    /// Extra matcher added to every silence (name=value, name!=value,
    /// name=~regex, name!~regex). Repeatable.
    #[arg(long = "silence-matcher", env = "SILENCE_MATCHER")]
    pub silence_matchers: Vec<Matcher>,

    /// Seconds without events before the node watch is reopened.
    #[arg(long = "watch-refresh", env = "WATCH_REFRESH", default_value_t = 120)]
    pub watch_refresh_secs: u64,

    /// Server-side timeout in seconds for each node watch.
    #[arg(long = "watch-timeout", env = "WATCH_TIMEOUT", default_value_t = 290)]
    pub watch_timeout_secs: u64,

    /// Timeout in seconds for each Alertmanager request.
    #[arg(long = "request-timeout", env = "REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Name of the Lease used for leader election.
    #[arg(long, env = "LEASE_NAME", default_value = "kured-silencer")]
    pub lease_name: String,

    /// Identity of this replica in the election.
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace holding the election Lease.
    #[arg(long, env = "POD_NAMESPACE")]
    pub pod_namespace: Option<String>,

    /// Lease validity in seconds.
    #[arg(long = "lease-duration", env = "LEASE_DURATION", default_value_t = 15)]
    pub lease_duration_secs: u64,

    /// Seconds a leader keeps trying to renew before stepping down.
    #[arg(long = "renew-deadline", env = "RENEW_DEADLINE", default_value_t = 10)]
    pub renew_deadline_secs: u64,

    /// Seconds between election attempts.
    #[arg(long = "retry-period", env = "RETRY_PERIOD", default_value_t = 2)]
    pub retry_period_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Lease location and election timing.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub namespace: String,
    pub name: String,
    pub election: ElectionConfig,
}

impl Config {
    /// Check everything that can be checked without talking to a cluster.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let endpoint = validate_endpoint(&self.alertmanager_endpoint)?;

        if self.kured_label.trim().is_empty() {
            return Err(ConfigError::Empty("kured-label"));
        }
        if self.severities.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::Empty("severities"));
        }
        if self.silence_duration_mins == 0 {
            return Err(ConfigError::Zero("silence-duration"));
        }
        if self.watch_refresh_secs == 0 {
            return Err(ConfigError::Zero("watch-refresh"));
        }
        if self.retry_period_secs == 0 {
            return Err(ConfigError::Zero("retry-period"));
        }
        if self.lease_duration_secs <= self.renew_deadline_secs {
            return Err(ConfigError::Ordering {
                longer: "lease-duration",
                shorter: "renew-deadline",
            });
        }
        if self.renew_deadline_secs <= self.retry_period_secs {
            return Err(ConfigError::Ordering {
                longer: "renew-deadline",
                shorter: "retry-period",
            });
        }

        Ok(endpoint)
    }

    /// Leader election is used unless running from a local kubeconfig.
    pub fn leader_election_enabled(&self) -> bool {
        self.kubeconfig_path.is_none()
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_secs(self.silence_duration_mins * 60)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn silence_template(&self) -> SilenceTemplate {
        SilenceTemplate {
            severities: self
                .severities
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            matchers: self.silence_matchers.clone(),
            ..SilenceTemplate::default()
        }
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            silence_duration: self.silence_duration(),
            removal_buffer: Duration::from_secs(self.removal_buffer_secs),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        let watch_refresh = Duration::from_secs(self.watch_refresh_secs);
        ReconcilerConfig {
            watch_refresh,
            backoff: BackoffPolicy::capped(watch_refresh),
        }
    }

    pub fn lease_settings(&self) -> Result<LeaseSettings, ConfigError> {
        let identity = self
            .pod_name
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingPodName)?;
        let namespace = self
            .pod_namespace
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingPodNamespace)?;

        Ok(LeaseSettings {
            namespace,
            name: self.lease_name.clone(),
            election: ElectionConfig {
                lease_duration: Duration::from_secs(self.lease_duration_secs),
                renew_deadline: Duration::from_secs(self.renew_deadline_secs),
                retry_period: Duration::from_secs(self.retry_period_secs),
                ..ElectionConfig::new(identity)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec![
            "kured-silencer",
            "--kured-label",
            "weave.works/kured-node-reboot-in-progress",
            "--alertmanager-endpoint",
            "http://localhost:9093",
        ];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[rstest]
    #[case::valid_http("http://localhost:9093")]
    #[case::valid_https("https://localhost:9093")]
    #[case::with_path("https://monitoring.example.com/alertmanager")]
    fn test_validate_endpoint_ok(#[case] raw: &str) {
        assert!(validate_endpoint(raw).is_ok());
    }

    #[rstest]
    #[case::invalid_scheme("ftp://localhost:9093")]
    #[case::unix_scheme("unix:/var/run/am.sock")]
    fn test_validate_endpoint_invalid_scheme(#[case] raw: &str) {
        assert!(matches!(
            validate_endpoint(raw),
            Err(ConfigError::InvalidScheme(_))
        ));
    }

    #[test]
    fn test_validate_endpoint_missing_host() {
        assert!(matches!(
            validate_endpoint("http://"),
            Err(ConfigError::MissingHost)
        ));
    }

    #[test]
    fn test_validate_endpoint_garbage() {
        assert!(matches!(
            validate_endpoint("localhost:9093 with spaces"),
            Err(ConfigError::InvalidUrl { .. }) | Err(ConfigError::InvalidScheme(_))
        ));
        assert!(matches!(
            validate_endpoint(""),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert!(config.validate().is_ok());
        assert!(config.leader_election_enabled());
        assert_eq!(config.silence_duration(), Duration::from_secs(15 * 60));
        assert_eq!(config.handler_config().removal_buffer, Duration::from_secs(60));
        assert_eq!(
            config.reconciler_config().watch_refresh,
            Duration::from_secs(120)
        );
        assert_eq!(
            config.silence_template().severities,
            vec!["warning".to_string(), "critical".to_string()]
        );
        assert_eq!(config.lease_name, "kured-silencer");
    }

    #[test]
    fn test_matchers_and_severities() {
        let config = parse(&[
            "--severities",
            "critical,page",
            "--silence-matcher",
            "cluster=prod",
            "--silence-matcher",
            "alertname!~Watchdog",
        ]);
        let template = config.silence_template();
        assert_eq!(template.severities, vec!["critical", "page"]);
        assert_eq!(template.matchers.len(), 2);
        assert_eq!(template.matchers[0], Matcher::equal("cluster", "prod"));
        assert!(template.matchers[1].is_regex);
    }

    #[test]
    fn test_bad_matcher_rejected() {
        let result = Config::try_parse_from([
            "kured-silencer",
            "--kured-label",
            "a=b",
            "--alertmanager-endpoint",
            "http://localhost:9093",
            "--silence-matcher",
            "nonsense",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_kubeconfig_disables_election() {
        let config = parse(&["--kubeconfig-path", "/tmp/kubeconfig"]);
        assert!(!config.leader_election_enabled());
    }

    #[test]
    fn test_timing_validation() {
        let config = parse(&["--lease-duration", "10", "--renew-deadline", "10"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Ordering { longer: "lease-duration", .. })
        ));

        let config = parse(&["--retry-period", "10"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Ordering { longer: "renew-deadline", .. })
        ));

        let config = parse(&["--silence-duration", "0"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("silence-duration"))
        ));
    }

    #[test]
    fn test_lease_settings() {
        let config = parse(&["--pod-name", "silencer-0", "--pod-namespace", "kube-system"]);
        let settings = config.lease_settings().unwrap();
        assert_eq!(settings.namespace, "kube-system");
        assert_eq!(settings.name, "kured-silencer");
        assert_eq!(settings.election.identity, "silencer-0");
        assert_eq!(settings.election.lease_duration, Duration::from_secs(15));
    }

    #[test]
    fn test_lease_settings_need_identity() {
        let config = parse(&["--pod-namespace", "kube-system"]);
        if config.pod_name.is_none() {
            assert!(matches!(
                config.lease_settings(),
                Err(ConfigError::MissingPodName)
            ));
        }
    }
}

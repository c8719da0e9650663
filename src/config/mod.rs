use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::rr::Name;
use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

pub mod duration;

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    pub forward: Forward,

    #[validate(nested)]
    pub etcd: Etcd,

    pub prometheus: Option<Prometheus>,
    pub status: Option<Status>,
    pub sentry: Option<Sentry>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config =
            serde_yaml::from_str(conf_str).or_err(ReadError, "Unable to parse yaml conf")?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err(FileReadError, "Conf file valid failed")?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

/// Address a DNS listener binds, both UDP and TCP.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Listener {
    pub address: SocketAddr,
}

/// The forwarding block: which endpoint groups to follow and how to talk to them.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "Forward::validate_transport"))]
pub struct Forward {
    #[validate(length(min = 1))]
    pub namespace: String,
    #[validate(length(min = 1))]
    pub service_name: String,
    #[validate(length(min = 1))]
    pub port_name: String,

    #[serde(with = "duration", default = "Forward::default_expire")]
    pub expire: Duration,
    #[serde(with = "duration", default = "Forward::default_health_check")]
    pub health_check: Duration,
    #[serde(with = "duration", default)]
    pub slow_threshold: Duration,
    #[serde(default)]
    pub slow_log: bool,

    #[serde(default)]
    pub force_tcp: bool,
    #[serde(default)]
    pub prefer_udp: bool,
    #[serde(default = "Forward::default_health_check_domain")]
    #[validate(custom(function = "Forward::validate_health_check_domain"))]
    pub health_check_domain: String,
    #[serde(default = "Forward::default_health_check_recursion")]
    pub health_check_recursion: bool,

    #[serde(default)]
    pub nxdomain_tracking: bool,
}

impl Default for Forward {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            service_name: String::new(),
            port_name: String::new(),
            expire: Self::default_expire(),
            health_check: Self::default_health_check(),
            slow_threshold: Duration::ZERO,
            slow_log: false,
            force_tcp: false,
            prefer_udp: false,
            health_check_domain: Self::default_health_check_domain(),
            health_check_recursion: Self::default_health_check_recursion(),
            nxdomain_tracking: false,
        }
    }
}

impl Forward {
    fn default_expire() -> Duration {
        Duration::from_secs(30 * 60)
    }

    fn default_health_check() -> Duration {
        Duration::from_secs(10)
    }

    fn default_health_check_domain() -> String {
        ".".to_string()
    }

    fn default_health_check_recursion() -> bool {
        true
    }

    fn validate_transport(&self) -> Result<(), ValidationError> {
        if self.force_tcp && self.prefer_udp {
            Err(ValidationError::new("force_tcp_conflicts_with_prefer_udp"))
        } else {
            Ok(())
        }
    }

    fn validate_health_check_domain(domain: &str) -> Result<(), ValidationError> {
        if let Err(e) = Name::from_ascii(domain) {
            let mut err = ValidationError::new("invalid_health_check_domain");
            err.add_param("domain".into(), &domain.to_string());
            err.add_param("reason".into(), &e.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Slow-request tracking threshold, `None` when disabled.
    pub fn slow_threshold(&self) -> Option<Duration> {
        (!self.slow_threshold.is_zero()).then_some(self.slow_threshold)
    }
}

/// etcd connection used as the endpoint-group watch source.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Etcd {
    #[validate(length(min = 1))]
    pub host: Vec<String>,
    #[serde(default = "Etcd::default_prefix")]
    pub prefix: String,
    pub timeout: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for Etcd {
    fn default() -> Self {
        Self {
            host: vec!["http://127.0.0.1:2379".to_string()],
            prefix: Self::default_prefix(),
            timeout: None,
            connect_timeout: None,
            user: None,
            password: None,
        }
    }
}

impl Etcd {
    fn default_prefix() -> String {
        "/registry/endpointslices".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sentry {
    pub dsn: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn load_err(conf_str: &str) -> String {
        match Config::from_yaml(conf_str) {
            Ok(_) => panic!("Expected error, but got a valid config"),
            Err(e) => {
                eprintln!("Error: {e}");
                e.to_string()
            }
        }
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1
  threads: 2

listeners:
  - address: 0.0.0.0:53
  - address: "[::1]:5353"

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns
  expire: 10m
  health_check: 5s
  slow_threshold: 100ms
  slow_log: true
  nxdomain_tracking: true

etcd:
  host:
    - http://127.0.0.1:2379
  prefix: /slices

prometheus:
  address: 0.0.0.0:9153

status:
  address: 0.0.0.0:8080
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(1, conf.pingora.version);
        assert_eq!(2, conf.listeners.len());
        assert_eq!("kube-system", conf.forward.namespace);
        assert_eq!("d8-kube-dns", conf.forward.service_name);
        assert_eq!("dns", conf.forward.port_name);
        assert_eq!(Duration::from_secs(600), conf.forward.expire);
        assert_eq!(Duration::from_secs(5), conf.forward.health_check);
        assert_eq!(
            Some(Duration::from_millis(100)),
            conf.forward.slow_threshold()
        );
        assert!(conf.forward.slow_log);
        assert!(conf.forward.nxdomain_tracking);
        assert_eq!("/slices", conf.etcd.prefix);
        assert!(conf.prometheus.is_some());
        assert!(conf.status.is_some());
        print!("{}", conf.to_yaml());
    }

    #[test]
    fn test_minimal_config_defaults() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns

etcd:
  host: ["http://127.0.0.1:2379"]
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(Duration::from_secs(30 * 60), conf.forward.expire);
        assert_eq!(Duration::from_secs(10), conf.forward.health_check);
        assert_eq!(None, conf.forward.slow_threshold());
        assert!(!conf.forward.slow_log);
        assert!(!conf.forward.force_tcp);
        assert!(!conf.forward.prefer_udp);
        assert_eq!(".", conf.forward.health_check_domain);
        assert!(conf.forward.health_check_recursion);
        assert!(!conf.forward.nxdomain_tracking);
        assert_eq!("/registry/endpointslices", conf.etcd.prefix);
    }

    #[test]
    fn test_missing_service_name() {
        init_log();
        let err = load_err(
            r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: kube-system
  port_name: dns

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
        );
        assert!(err.contains("missing field `service_name`"), "{err}");
    }

    #[test]
    fn test_empty_namespace() {
        init_log();
        let err = load_err(
            r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: ""
  service_name: d8-kube-dns
  port_name: dns

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
        );
        assert!(err.contains("namespace"), "{err}");
    }

    #[test]
    fn test_unknown_option() {
        init_log();
        let err = load_err(
            r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns
  max_fails: 3

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
        );
        assert!(err.contains("unknown field `max_fails`"), "{err}");
    }

    #[test]
    fn test_invalid_expire() {
        init_log();
        let err = load_err(
            r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns
  expire: not-a-duration

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
        );
        assert!(err.contains("invalid duration"), "{err}");
    }

    #[test]
    fn test_missing_health_check_value() {
        init_log();
        load_err(
            r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns
  health_check:

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
        );
    }

    #[test]
    fn test_force_tcp_conflicts_with_prefer_udp() {
        init_log();
        let err = load_err(
            r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns
  force_tcp: true
  prefer_udp: true

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
        );
        assert!(err.contains("force_tcp_conflicts_with_prefer_udp"), "{err}");
    }

    #[test]
    fn test_valid_listeners_length() {
        init_log();
        load_err(
            r#"
---
listeners: []

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
        );
    }

    #[test]
    fn test_invalid_health_check_domain() {
        init_log();
        let err = load_err(&format!(
            r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns
  health_check_domain: {}.com.

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
            "a".repeat(64)
        ));
        assert!(err.contains("invalid_health_check_domain"), "{err}");
    }

    #[test]
    fn test_health_check_domain_accepted() {
        init_log();
        let conf = Config::from_yaml(
            r#"
---
listeners:
  - address: 0.0.0.0:53

forward:
  namespace: kube-system
  service_name: d8-kube-dns
  port_name: dns
  health_check_domain: cluster.local.

etcd:
  host: ["http://127.0.0.1:2379"]
        "#,
        )
        .unwrap();
        assert_eq!("cluster.local.", conf.forward.health_check_domain);
    }
}

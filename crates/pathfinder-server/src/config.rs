//! Server configuration.
//!
//! A server hosts one or more domains, each an independent catalogue with
//! its own listen addresses and resource limits. Configuration comes from
//! a TOML file:
//!
//! ```toml
//! [[domain]]
//! name = "main"
//! addrs = ["tcp:127.0.0.1:4711", "ux:/run/pathfinder/main.sock"]
//! max-filter-nodes = 128
//! idle-timeout-secs = 30
//! same-generation-policy = "reject"
//!
//! [domain.limits.user]
//! clients = 16
//! services = 256
//! subscriptions = 256
//! filter-nodes = 4096
//!
//! [domain.limits.total]
//! clients = 1024
//! ```
//!
//! or, for a single domain, from repeated `--addr` flags on the command
//! line. Absent limits are unlimited.

use std::path::Path;
use std::time::Duration;

use pathfinder_core::domain::{DomainConfig, SameGenerationPolicy};
use pathfinder_core::resources::ResourceLimits;
use serde::Deserialize;
use thiserror::Error;

use crate::transport::{AddrParseError, ListenAddr};

/// Error loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("cannot parse config: {0}")]
    Toml(#[from] toml::de::Error),

    /// A listen address did not parse.
    #[error(transparent)]
    Addr(#[from] AddrParseError),

    /// No domain was configured.
    #[error("configuration defines no domain")]
    NoDomains,

    /// A domain has no listen address.
    #[error("domain {name:?} has no listen address")]
    NoAddrs {
        /// The offending domain.
        name: String,
    },
}

/// Full server configuration: one entry per domain.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The hosted domains.
    pub domains: Vec<DomainSpec>,
}

impl ServerConfig {
    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Parses and validates TOML config text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        if raw.domains.is_empty() {
            return Err(ConfigError::NoDomains);
        }

        let mut domains = Vec::with_capacity(raw.domains.len());
        for (index, raw_domain) in raw.domains.into_iter().enumerate() {
            let name = raw_domain
                .name
                .unwrap_or_else(|| format!("domain-{index}"));
            if raw_domain.addrs.is_empty() {
                return Err(ConfigError::NoAddrs { name });
            }
            let addrs = raw_domain
                .addrs
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<ListenAddr>, _>>()?;
            domains.push(DomainSpec {
                name,
                addrs,
                user_limits: raw_domain.limits.user.into(),
                total_limits: raw_domain.limits.total.into(),
                max_filter_nodes: raw_domain.max_filter_nodes.unwrap_or(0),
                idle_timeout: raw_domain.idle_timeout_secs.map(Duration::from_secs),
                same_generation_policy: raw_domain
                    .same_generation_policy
                    .unwrap_or_default()
                    .into(),
            });
        }
        Ok(Self { domains })
    }

    /// A single unnamed domain listening on `addrs`, for `--addr` mode.
    pub fn single_domain(addrs: &[String]) -> Result<Self, ConfigError> {
        if addrs.is_empty() {
            return Err(ConfigError::NoDomains);
        }
        let addrs = addrs
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<ListenAddr>, _>>()?;
        Ok(Self {
            domains: vec![DomainSpec::from_addrs("default", addrs)],
        })
    }
}

/// Configuration of one domain.
#[derive(Debug, Clone)]
pub struct DomainSpec {
    /// Name used in logs.
    pub name: String,
    /// Listen addresses.
    pub addrs: Vec<ListenAddr>,
    /// Per-user resource limits.
    pub user_limits: ResourceLimits,
    /// Domain-total resource limits.
    pub total_limits: ResourceLimits,
    /// Per-subscription filter complexity cap; zero picks the default.
    pub max_filter_nodes: usize,
    /// Close sessions quiet for longer than this; `None` disables.
    pub idle_timeout: Option<Duration>,
    /// Equal-generation conflict policy.
    pub same_generation_policy: SameGenerationPolicy,
}

impl DomainSpec {
    /// A domain with the given addresses and everything else default.
    #[must_use]
    pub fn from_addrs(name: impl Into<String>, addrs: Vec<ListenAddr>) -> Self {
        Self {
            name: name.into(),
            addrs,
            user_limits: ResourceLimits::unlimited(),
            total_limits: ResourceLimits::unlimited(),
            max_filter_nodes: 0,
            idle_timeout: None,
            same_generation_policy: SameGenerationPolicy::default(),
        }
    }

    /// The domain-kernel configuration this spec induces.
    #[must_use]
    pub fn domain_config(&self) -> DomainConfig {
        DomainConfig {
            user_limits: self.user_limits,
            total_limits: self.total_limits,
            max_filter_nodes: self.max_filter_nodes,
            same_generation_policy: self.same_generation_policy,
        }
    }
}

// ----------------------------------------------------------------------
// Raw TOML schema
// ----------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default, rename = "domain")]
    domains: Vec<RawDomain>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawDomain {
    name: Option<String>,
    #[serde(default)]
    addrs: Vec<String>,
    #[serde(default)]
    limits: RawLimits,
    max_filter_nodes: Option<usize>,
    idle_timeout_secs: Option<u64>,
    same_generation_policy: Option<RawPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    #[serde(default)]
    user: RawLimitSet,
    #[serde(default)]
    total: RawLimitSet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawLimitSet {
    clients: Option<u64>,
    services: Option<u64>,
    subscriptions: Option<u64>,
    filter_nodes: Option<u64>,
}

impl From<RawLimitSet> for ResourceLimits {
    fn from(raw: RawLimitSet) -> Self {
        Self {
            clients: raw.clients,
            services: raw.services,
            subscriptions: raw.subscriptions,
            filter_nodes: raw.filter_nodes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RawPolicy {
    #[default]
    Reject,
    Idempotent,
}

impl From<RawPolicy> for SameGenerationPolicy {
    fn from(raw: RawPolicy) -> Self {
        match raw {
            RawPolicy::Reject => Self::Reject,
            RawPolicy::Idempotent => Self::Idempotent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let config = ServerConfig::from_toml_str(
            r#"
            [[domain]]
            name = "main"
            addrs = ["tcp:127.0.0.1:4711", "ux:/tmp/pf-main.sock"]
            max-filter-nodes = 64
            idle-timeout-secs = 30
            same-generation-policy = "idempotent"

            [domain.limits.user]
            clients = 16
            services = 256

            [domain.limits.total]
            clients = 1024
            filter-nodes = 65536

            [[domain]]
            addrs = ["tcp:0.0.0.0:4712"]
            "#,
        )
        .unwrap();

        assert_eq!(config.domains.len(), 2);
        let main = &config.domains[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.addrs.len(), 2);
        assert_eq!(main.user_limits.clients, Some(16));
        assert_eq!(main.user_limits.services, Some(256));
        assert_eq!(main.user_limits.subscriptions, None);
        assert_eq!(main.total_limits.clients, Some(1024));
        assert_eq!(main.total_limits.filter_nodes, Some(65536));
        assert_eq!(main.max_filter_nodes, 64);
        assert_eq!(main.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            main.same_generation_policy,
            SameGenerationPolicy::Idempotent
        );

        let second = &config.domains[1];
        assert_eq!(second.name, "domain-1");
        assert_eq!(second.idle_timeout, None);
        assert_eq!(second.same_generation_policy, SameGenerationPolicy::Reject);
    }

    #[test]
    fn empty_config_is_refused() {
        assert!(matches!(
            ServerConfig::from_toml_str(""),
            Err(ConfigError::NoDomains)
        ));
    }

    #[test]
    fn domain_without_addrs_is_refused() {
        let err = ServerConfig::from_toml_str(
            r#"
            [[domain]]
            name = "empty"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoAddrs { name } if name == "empty"));
    }

    #[test]
    fn bad_addr_is_refused() {
        let err = ServerConfig::from_toml_str(
            r#"
            [[domain]]
            addrs = ["udp:1.2.3.4:1"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Addr(_)));
    }

    #[test]
    fn unknown_keys_are_refused() {
        let err = ServerConfig::from_toml_str(
            r#"
            [[domain]]
            addrs = ["tcp:127.0.0.1:1"]
            surprise = true
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn single_domain_mode() {
        let config =
            ServerConfig::single_domain(&["tcp:127.0.0.1:4711".to_owned()]).unwrap();
        assert_eq!(config.domains.len(), 1);
        assert_eq!(config.domains[0].name, "default");

        assert!(matches!(
            ServerConfig::single_domain(&[]),
            Err(ConfigError::NoDomains)
        ));
    }
}

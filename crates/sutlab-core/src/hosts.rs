use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;

/// Alias of the machine the controller itself runs on. Commands addressed to it
/// execute through a local shell instead of ssh.
pub const LOCAL_HOST_ALIAS: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostTarget {
    alias: String,
}

impl HostTarget {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
        }
    }

    pub fn local() -> Self {
        Self::new(LOCAL_HOST_ALIAS)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn is_local(&self) -> bool {
        self.alias == LOCAL_HOST_ALIAS
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.alias)
    }
}

/// Password material. Never printed by `Debug` or `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub address: String,
    pub principal: String,
    pub secret: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub principal: String,
    pub secret: Secret,
}

pub trait HostRegistry: Send + Sync {
    fn resolve(&self, alias: &str) -> Result<ResolvedHost, ConfigurationError>;

    /// Principal and secret only, for services that are not ssh targets
    /// (the power meter login, local sudo).
    fn resolve_login(&self, alias: &str) -> Result<LoginCredentials, ConfigurationError>;
}

/// Reads `{ALIAS}_H`, `{ALIAS}_U` and `{ALIAS}_P` from the process environment
/// at the moment of the call.
#[derive(Debug, Clone, Default)]
pub struct EnvHostRegistry;

impl EnvHostRegistry {
    pub fn new() -> Self {
        Self
    }

    fn required(alias: &str, suffix: &str, field: &'static str) -> Result<String, ConfigurationError> {
        let name = env_var_name(alias, suffix);
        match env::var(&name) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ConfigurationError::MissingCredential {
                alias: alias.to_string(),
                field,
                env_var: name,
            }),
        }
    }
}

impl HostRegistry for EnvHostRegistry {
    fn resolve(&self, alias: &str) -> Result<ResolvedHost, ConfigurationError> {
        let address = Self::required(alias, "H", "address")?;
        let principal = Self::required(alias, "U", "principal")?;
        let secret = Self::required(alias, "P", "secret")?;
        Ok(ResolvedHost {
            address,
            principal,
            secret: Secret::new(secret),
        })
    }

    fn resolve_login(&self, alias: &str) -> Result<LoginCredentials, ConfigurationError> {
        let principal = Self::required(alias, "U", "principal")?;
        let secret = Self::required(alias, "P", "secret")?;
        Ok(LoginCredentials {
            principal,
            secret: Secret::new(secret),
        })
    }
}

pub fn env_var_name(alias: &str, suffix: &str) -> String {
    let normalized: String = alias
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}", normalized, suffix)
}

/// Fixed table of hosts, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticHostRegistry {
    hosts: BTreeMap<String, ResolvedHost>,
}

impl StaticHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, alias: &str, address: &str, principal: &str, secret: &str) -> Self {
        self.hosts.insert(
            alias.to_string(),
            ResolvedHost {
                address: address.to_string(),
                principal: principal.to_string(),
                secret: Secret::new(secret),
            },
        );
        self
    }
}

impl HostRegistry for StaticHostRegistry {
    fn resolve(&self, alias: &str) -> Result<ResolvedHost, ConfigurationError> {
        self.hosts
            .get(alias)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownHost(alias.to_string()))
    }

    fn resolve_login(&self, alias: &str) -> Result<LoginCredentials, ConfigurationError> {
        let host = self.resolve(alias)?;
        Ok(LoginCredentials {
            principal: host.principal,
            secret: host.secret,
        })
    }
}

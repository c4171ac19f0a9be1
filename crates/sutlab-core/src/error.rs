use thiserror::Error;

/// Problems with the experiment setup itself. These are fatal for the whole
/// experiment and must surface before the first run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("missing_credential: host '{alias}' has no {field} (expected env var {env_var})")]
    MissingCredential {
        alias: String,
        field: &'static str,
        env_var: String,
    },
    #[error("unknown_host: no entry for host alias '{0}'")]
    UnknownHost(String),
}

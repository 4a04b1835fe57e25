//! YAML configuration for the client, server and delegated modes.
//!
//! ```yaml
//! client:
//!   uds_path: /run/spire/agent.sock
//!   server_svid: spiffe://example.org/api
//! server:
//!   allowed_spiffe_ids_file: /etc/authz/allowed.yaml
//! delegated:
//!   admin_uds_path: /run/spire/admin.sock
//! ```
//!
//! Empty strings are treated as unset.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeIdError;

/// Why a configuration or allow-list file could not be loaded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("read failed")]
    Io(#[source] io::Error),

    /// The file is not valid YAML for the expected shape.
    #[error("invalid yaml")]
    Yaml(#[source] serde_yaml::Error),

    /// An identity listed in the file is malformed.
    #[error("invalid SPIFFE ID '{value}'")]
    InvalidSpiffeId {
        /// The rejected entry.
        value: String,
        /// Syntax error.
        #[source]
        source: SpiffeIdError,
    },
}

/// Settings for the mTLS client role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientAuthConfig {
    /// Agent socket override.
    pub uds_path: Option<String>,
    /// Identity the server must present, or `any`.
    pub server_svid: Option<String>,
}

/// Settings for the mTLS server role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerAuthConfig {
    /// Agent socket override.
    pub uds_path: Option<String>,
    /// YAML file listing the client identities to accept.
    pub allowed_spiffe_ids_file: Option<PathBuf>,
    /// Fail instead of widening to the trust domain when the allow-list
    /// file cannot be loaded.
    pub strict_allow_list: bool,
}

/// Settings for delegated JWT retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DelegatedAuthConfig {
    /// Agent socket override.
    pub uds_path: Option<String>,
    /// Broker (admin) socket override.
    pub admin_uds_path: Option<String>,
}

/// Top-level configuration file. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// `client:` section.
    pub client: Option<ClientAuthConfig>,
    /// `server:` section.
    pub server: Option<ServerAuthConfig>,
    /// `delegated:` section.
    pub delegated: Option<DelegatedAuthConfig>,
}

impl AuthConfig {
    /// Reads and parses `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigLoad`] if the file cannot be read or parsed.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        read_yaml(path).map_err(|source| Error::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] on malformed input.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(ConfigError::Yaml)
    }
}

pub(crate) fn read_yaml<T>(path: &Path) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    let data = fs::read_to_string(path).map_err(ConfigError::Io)?;
    serde_yaml::from_str(&data).map_err(ConfigError::Yaml)
}

/// `None` for unset, empty or whitespace-only values.
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

//! Resolution of the agent and broker socket addresses.
//!
//! An address comes from, in order: explicit configuration, an environment
//! variable, a compiled-in default. A value without a scheme is taken to be
//! a Unix socket path. The canonical form is then parsed into an
//! [`Endpoint`].

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::config::non_empty;
use crate::error::{Error, Result};

const TCP_SCHEME: &str = "tcp";
const UNIX_SCHEME: &str = "unix";

/// Environment variable naming the Workload API socket.
pub const AGENT_SOCKET_ENV: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Workload API socket used when nothing else is configured.
pub const DEFAULT_AGENT_SOCKET: &str = "unix:///tmp/spire-agent/public/api.sock";

/// Environment variable naming the agent's administrative socket.
pub const ADMIN_SOCKET_ENV: &str = "SPIRE_ADMIN_ENDPOINT_SOCKET";

/// Administrative socket used when nothing else is configured.
pub const DEFAULT_ADMIN_SOCKET: &str = "unix:///tmp/spire-agent/private/admin.sock";

/// A parsed agent or broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket at an absolute path.
    Unix(PathBuf),

    /// TCP endpoint; the host must be an IP literal.
    Tcp {
        /// IP address.
        host: IpAddr,
        /// Port.
        port: u16,
    },
}

/// Why an address is not a usable endpoint.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EndpointError {
    /// Not a URI at all.
    #[error("endpoint socket is not a valid URI")]
    Parse(#[from] url::ParseError),

    /// Scheme other than `unix:` or `tcp:`.
    #[error("endpoint socket URI scheme must be unix: or tcp:")]
    InvalidScheme,

    /// `user:pass@` present.
    #[error("endpoint socket URI must not include user info")]
    HasUserInfo,

    /// `?query` present.
    #[error("endpoint socket URI must not include query values")]
    HasQuery,

    /// `#fragment` present.
    #[error("endpoint socket URI must not include a fragment")]
    HasFragment,

    /// `unix://host/...`.
    #[error("unix: endpoint socket URI must not include an authority")]
    UnixAuthorityNotAllowed,

    /// `unix:` with an empty or relative path.
    #[error("unix: endpoint socket URI must include an absolute path")]
    UnixMissingPath,

    /// `tcp:` with a DNS name.
    #[error("tcp: endpoint socket URI host must be an IP address")]
    TcpHostNotIp,

    /// `tcp:` without a port.
    #[error("tcp: endpoint socket URI must include a port")]
    TcpMissingPort,

    /// `tcp:` with a path.
    #[error("tcp: endpoint socket URI must not include a path")]
    TcpUnexpectedPath,
}

impl Endpoint {
    /// Parses `unix:///path`, `unix:/path`, `tcp://ip:port` or `tcp:ip:port`.
    ///
    /// # Errors
    ///
    /// Returns an [`EndpointError`] describing the first rule violated.
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        let url = Url::parse(&expand_shorthand(input))?;

        if !url.username().is_empty() || url.password().is_some() {
            return Err(EndpointError::HasUserInfo);
        }
        if url.query().is_some() {
            return Err(EndpointError::HasQuery);
        }
        if url.fragment().is_some() {
            return Err(EndpointError::HasFragment);
        }

        match url.scheme() {
            UNIX_SCHEME => parse_unix(&url),
            TCP_SCHEME => parse_tcp(&url),
            _ => Err(EndpointError::InvalidScheme),
        }
    }
}

fn parse_unix(url: &Url) -> Result<Endpoint, EndpointError> {
    if url.host_str().is_some_and(|h| !h.is_empty()) {
        return Err(EndpointError::UnixAuthorityNotAllowed);
    }
    match url.path() {
        "" | "/" => Err(EndpointError::UnixMissingPath),
        path if !path.starts_with('/') => Err(EndpointError::UnixMissingPath),
        path => Ok(Endpoint::Unix(PathBuf::from(path))),
    }
}

fn parse_tcp(url: &Url) -> Result<Endpoint, EndpointError> {
    let host = match url.host() {
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip),
        // Non-special schemes keep IPv4 literals as opaque domains.
        Some(url::Host::Domain(domain)) => {
            IpAddr::from_str(domain).map_err(|_| EndpointError::TcpHostNotIp)?
        }
        None => return Err(EndpointError::TcpHostNotIp),
    };
    let port = url.port().ok_or(EndpointError::TcpMissingPort)?;
    if !matches!(url.path(), "" | "/") {
        return Err(EndpointError::TcpUnexpectedPath);
    }
    Ok(Endpoint::Tcp { host, port })
}

fn expand_shorthand(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("unix:/") {
        if !rest.starts_with('/') {
            return format!("unix:///{rest}");
        }
    }
    if let Some(rest) = input.strip_prefix("tcp:") {
        if !rest.starts_with("//") {
            return format!("tcp://{rest}");
        }
    }
    input.to_owned()
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp { host, port } => match host {
                IpAddr::V6(ip) => write!(f, "tcp://[{ip}]:{port}"),
                IpAddr::V4(ip) => write!(f, "tcp://{ip}:{port}"),
            },
        }
    }
}

/// Where a resolved address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOrigin {
    /// Explicit configuration value.
    Explicit,
    /// Environment variable.
    Environment,
    /// Compiled-in default.
    Default,
}

impl fmt::Display for EndpointOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Explicit => "configuration",
            Self::Environment => "environment",
            Self::Default => "default",
        })
    }
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    uri: String,
    endpoint: Endpoint,
    origin: EndpointOrigin,
}

impl ResolvedEndpoint {
    /// Canonical URI, e.g. `unix:///run/spire/agent.sock`.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Parsed endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Which source supplied the address.
    pub fn origin(&self) -> EndpointOrigin {
        self.origin
    }
}

/// Resolves an address with precedence `explicit` > `$env_var` > `default`.
///
/// # Errors
///
/// Returns [`Error::InvalidEndpoint`] if the canonical form does not parse.
pub fn resolve(explicit: Option<&str>, env_var: &str, default: &str) -> Result<ResolvedEndpoint> {
    let env_value = std::env::var(env_var).ok();
    resolve_from(explicit, env_value.as_deref(), default)
}

/// [`resolve`] with the environment value supplied by the caller.
///
/// # Errors
///
/// Returns [`Error::InvalidEndpoint`] if the canonical form does not parse.
pub fn resolve_from(
    explicit: Option<&str>,
    env_value: Option<&str>,
    default: &str,
) -> Result<ResolvedEndpoint> {
    let (raw, origin) = if let Some(v) = non_empty(explicit) {
        (v, EndpointOrigin::Explicit)
    } else if let Some(v) = non_empty(env_value) {
        (v, EndpointOrigin::Environment)
    } else {
        (default, EndpointOrigin::Default)
    };

    let uri = canonicalize(raw);
    let endpoint = Endpoint::parse(&uri).map_err(|source| Error::InvalidEndpoint {
        address: uri.clone(),
        source,
    })?;

    Ok(ResolvedEndpoint {
        uri,
        endpoint,
        origin,
    })
}

fn canonicalize(raw: &str) -> String {
    let has_scheme = raw.starts_with("unix:") || raw.starts_with("tcp:") || raw.contains("://");
    if has_scheme {
        raw.to_owned()
    } else {
        format!("{UNIX_SCHEME}://{raw}")
    }
}

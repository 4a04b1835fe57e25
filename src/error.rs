//! Error taxonomy surfaced to callers of this crate.
//!
//! Each variant wraps the lower-level cause as its `source()`. Nothing here
//! is retried internally; [`Error::is_timeout`] and [`Error::is_cancelled`]
//! let callers tell a deadline from a definitive rejection.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::delegated::DelegationError;
use crate::endpoint::EndpointError;
use crate::spiffe_id::SpiffeIdError;
use crate::svid::jwt::JwtSvidError;
use crate::tls::TlsError;
use crate::workload_api::WorkloadApiError;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the public operations of this crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The resolved agent or broker address is not a usable endpoint URI.
    #[error("invalid endpoint address '{address}'")]
    InvalidEndpoint {
        /// The canonical address that failed to parse.
        address: String,
        /// Parse failure.
        #[source]
        source: EndpointError,
    },

    /// The identity agent is unreachable or has no usable material.
    #[error("identity source unavailable")]
    SourceUnavailable(#[source] WorkloadApiError),

    /// The identity source was closed.
    #[error("identity source is closed")]
    SourceClosed,

    /// A string that should be a workload identity is not one.
    #[error("malformed workload identity '{input}'")]
    MalformedIdentity {
        /// The rejected input.
        input: String,
        /// Syntax error.
        #[source]
        source: SpiffeIdError,
    },

    /// The workload's own identity could not be obtained. The source is the
    /// source-level failure, such as [`Error::SourceClosed`].
    #[error("workload identity unavailable")]
    IdentityUnavailable(#[source] Box<Error>),

    /// The agent refused to issue a credential.
    #[error("credential issuance failed")]
    Issuance(#[source] WorkloadApiError),

    /// A presented JWT-SVID was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A delegated identity request failed.
    #[error("delegated identity request failed")]
    Delegation(#[from] DelegationError),

    /// The caller's deadline elapsed first.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that was in flight.
        operation: &'static str,
        /// Deadline budget that was exhausted.
        timeout: Duration,
    },

    /// The caller's cancellation token fired first.
    #[error("{operation} was cancelled")]
    Cancelled {
        /// Operation that was in flight.
        operation: &'static str,
    },

    /// A configuration file could not be loaded.
    #[error("failed to load configuration from '{}'", path.display())]
    ConfigLoad {
        /// File that failed.
        path: PathBuf,
        /// Read or parse failure.
        #[source]
        source: ConfigError,
    },

    /// rustls material could not be assembled.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl Error {
    /// `true` for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// `true` for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Wraps a failure to obtain the own identity. Deadline and
    /// cancellation errors pass through unchanged.
    pub(crate) fn identity_unavailable(self) -> Self {
        match self {
            e @ (Self::Timeout { .. } | Self::Cancelled { .. } | Self::IdentityUnavailable(_)) => e,
            e => Self::IdentityUnavailable(Box::new(e)),
        }
    }

    pub(crate) fn malformed_identity(input: &str, source: SpiffeIdError) -> Self {
        Self::MalformedIdentity {
            input: input.to_owned(),
            source,
        }
    }
}

/// Which check rejected a JWT-SVID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ValidationFailure {
    /// Bad signature, or no trusted key for the token's trust domain and key id.
    Signature,
    /// The expected audience is not among the token's audiences.
    Audience,
    /// The token is past its expiry.
    Expired,
    /// The token is not a well-formed JWT-SVID.
    Malformed,
}

/// A JWT-SVID failed validation.
///
/// `Display` is identical for every cause. Use [`ValidationError::kind`] or
/// the `source()` chain when diagnosing.
#[derive(Debug, Error)]
#[error("credential validation failed")]
pub struct ValidationError {
    kind: ValidationFailure,
    #[source]
    source: JwtSvidError,
}

impl ValidationError {
    pub(crate) fn new(kind: ValidationFailure, source: JwtSvidError) -> Self {
        Self { kind, source }
    }

    /// The check that failed.
    pub fn kind(&self) -> ValidationFailure {
        self.kind
    }
}

impl From<JwtSvidError> for ValidationError {
    fn from(source: JwtSvidError) -> Self {
        Self::new(source.validation_failure(), source)
    }
}

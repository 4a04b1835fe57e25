//! Error types for Workload API operations.

use thiserror::Error;

use crate::bundle::{JwtBundleError, X509BundleError};
use crate::spiffe_id::{SpiffeIdError, TrustDomain};
use crate::svid::{JwtSvidError, X509SvidError};
use crate::transport::TransportError;

/// Errors produced talking to the agent or the broker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkloadApiError {
    /// The call ended without a usable message.
    ///
    /// Usually the stream closed early or the agent has nothing for this
    /// workload yet.
    #[error("empty Workload API response")]
    EmptyResponse,

    /// The agent sent nothing usable within the default bound.
    #[error("no response from the agent within {0:?}")]
    NoResponse(std::time::Duration),

    /// The agent could not match the caller to any registration entry.
    #[error("no identity issued")]
    NoIdentityIssued,

    /// The request was refused for another permission reason.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A JWT-SVID was requested without an audience.
    #[error("at least one non-empty audience is required")]
    EmptyAudience,

    /// The requested trust domain has no bundle.
    #[error("no bundle for trust domain '{0}'")]
    NoBundle(TrustDomain),

    /// Channel setup failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The call failed with a gRPC status.
    #[error("workload api call failed: {0}")]
    Grpc(tonic::Status),

    /// An X.509-SVID in the response is invalid.
    #[error("failed to parse X.509 SVID: {0}")]
    X509Svid(#[from] X509SvidError),

    /// A JWT-SVID in the response is invalid.
    #[error("failed to parse JWT-SVID: {0}")]
    JwtSvid(#[from] JwtSvidError),

    /// An X.509 bundle in the response is invalid.
    #[error("failed to parse X.509 bundle: {0}")]
    X509Bundle(#[from] X509BundleError),

    /// A JWT bundle in the response is invalid.
    #[error("failed to parse JWT bundle: {0}")]
    JwtBundle(#[from] JwtBundleError),

    /// A trust domain or SPIFFE ID in the response is invalid.
    #[error("failed to parse SPIFFE ID: {0}")]
    SpiffeId(#[from] SpiffeIdError),
}

impl WorkloadApiError {
    /// `true` for both flavours of permission refusal.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::NoIdentityIssued | Self::PermissionDenied(_))
    }
}

impl From<tonic::Status> for WorkloadApiError {
    fn from(status: tonic::Status) -> Self {
        if status.code() == tonic::Code::PermissionDenied {
            let msg = status.message();
            if msg.contains("no identity issued") {
                return Self::NoIdentityIssued;
            }
            return Self::PermissionDenied(msg.to_owned());
        }
        Self::Grpc(status)
    }
}

impl From<tonic::transport::Error> for WorkloadApiError {
    fn from(e: tonic::transport::Error) -> Self {
        Self::Transport(TransportError::Tonic(e))
    }
}

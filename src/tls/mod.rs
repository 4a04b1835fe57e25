//! Mutual TLS over the workload's X.509-SVID.
//!
//! Both sides present the current SVID, verify the peer's chain against the
//! trust bundle for the peer's trust domain, then apply the configured
//! [`AuthorizationPolicy`](crate::policy::AuthorizationPolicy). Server names
//! play no part in verification; the SPIFFE ID in the URI SAN is the only
//! identity that counts.

mod client;
mod crypto;
mod material;
mod resolve;
mod server;
mod verifier;

use std::error::Error as StdError;
use std::io;

use rustls::pki_types::CertificateDer;
use thiserror::Error;

use crate::cert::{spiffe_id_from_der, CertificateError};
use crate::policy::Unauthorized;
use crate::spiffe_id::{SpiffeId, TrustDomain};

pub use client::{ClientAuth, MtlsClient};
pub use server::{ServerAuth, ServerTls};

/// Failures while assembling rustls material or completing a handshake.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// No trust bundle is known for the peer's trust domain.
    #[error("no trust bundle for trust domain '{0}'")]
    NoBundle(TrustDomain),

    /// The bundle exists but holds no usable trust anchor.
    #[error("trust bundle for '{0}' has no usable authorities")]
    EmptyBundle(TrustDomain),

    /// The bundle source failed.
    #[error("trust bundle lookup failed")]
    BundleLookup(#[source] Box<dyn StdError + Send + Sync + 'static>),

    /// The peer's leaf certificate does not carry a usable SPIFFE ID.
    #[error("peer certificate has no usable SPIFFE ID")]
    PeerCertificate(#[source] CertificateError),

    /// The peer presented no certificate.
    #[error("peer presented no certificate")]
    MissingPeerCertificate,

    /// The peer's identity failed the authorization policy.
    #[error(transparent)]
    Unauthorized(#[from] Unauthorized),

    /// The SVID's key could not be loaded by the crypto provider.
    #[error("cannot load SVID signing key")]
    CertifiedKey(#[source] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("cannot build client certificate verifier")]
    VerifierBuilder(#[source] rustls::server::VerifierBuilderError),

    /// The handshake failed.
    #[error("TLS handshake failed")]
    Handshake(#[source] rustls::Error),

    /// rustls rejected the configuration.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    /// `server_name` is not a valid TLS server name.
    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    /// Socket failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TlsError {
    /// Unwraps the rustls error tokio-rustls tucks inside an `io::Error`.
    pub(crate) fn from_io(err: io::Error) -> Self {
        let handshake = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .cloned();
        match handshake {
            Some(tls) => Self::Handshake(tls),
            None => Self::Io(err),
        }
    }
}

/// The SPIFFE ID carried by the leaf of a peer certificate chain.
///
/// # Errors
///
/// [`TlsError::MissingPeerCertificate`] for an empty chain, or
/// [`TlsError::PeerCertificate`] when the leaf has no single SPIFFE ID.
pub fn peer_identity(chain: &[CertificateDer<'_>]) -> Result<SpiffeId, TlsError> {
    let leaf = chain.first().ok_or(TlsError::MissingPeerCertificate)?;
    spiffe_id_from_der(leaf.as_ref()).map_err(TlsError::PeerCertificate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_has_no_identity() {
        assert!(matches!(
            peer_identity(&[]),
            Err(TlsError::MissingPeerCertificate)
        ));
    }

    #[test]
    fn garbage_leaf_has_no_identity() {
        let chain = [CertificateDer::from(vec![0x30, 0x03, 0x01, 0x01, 0x00])];
        assert!(matches!(
            peer_identity(&chain),
            Err(TlsError::PeerCertificate(_))
        ));
    }

    #[test]
    fn handshake_errors_are_unwrapped_from_io() {
        let io = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::NoCertificatesPresented,
        );
        assert!(matches!(
            TlsError::from_io(io),
            TlsError::Handshake(rustls::Error::NoCertificatesPresented)
        ));

        let io = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(TlsError::from_io(io), TlsError::Io(_)));
    }
}

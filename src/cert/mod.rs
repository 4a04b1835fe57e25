//! DER certificates and PKCS#8 keys as delivered by the agent.

use pkcs8::PrivateKeyInfo;
use thiserror::Error;
use x509_parser::asn1_rs::Oid;
use x509_parser::error::X509Error;
use zeroize::Zeroize;

use crate::spiffe_id::{SpiffeId, SpiffeIdError};

pub(crate) mod parsing;

pub(crate) use parsing::{parse_certificate, single_spiffe_id, split_der_chain};

/// Problems reading an X.509 certificate.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum CertificateError {
    /// Not DER X.509.
    #[error("failed parsing X.509 certificate")]
    ParseX509Certificate(#[from] X509Error),

    /// A required extension is absent.
    #[error("X.509 extension is missing: {0}")]
    MissingX509Extension(Oid<'static>),

    /// No `spiffe://` URI SAN.
    #[error("certificate is missing SPIFFE ID in URI SAN")]
    MissingSpiffeId,

    /// More than one `spiffe://` URI SAN.
    #[error("certificate contains multiple SPIFFE IDs in URI SAN")]
    MultipleSpiffeIds,

    /// URI SAN list exceeds the inspection bound.
    #[error("certificate has too many URI SAN entries (max {max})")]
    TooManyUriSanEntries {
        /// Bound.
        max: usize,
    },

    /// Chain exceeds the length bound.
    #[error("certificate chain is too long (max {max})")]
    TooManyCertificates {
        /// Bound.
        max: usize,
    },

    /// A `spiffe://` URI SAN that does not parse.
    #[error("failed to parse SPIFFE ID from URI SAN")]
    InvalidSpiffeId(#[from] SpiffeIdError),
}

/// A single validated DER certificate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The single SPIFFE ID in the URI SAN.
    ///
    /// # Errors
    ///
    /// Fails unless exactly one `spiffe://` URI SAN is present and valid.
    pub fn spiffe_id(&self) -> Result<SpiffeId, CertificateError> {
        spiffe_id_from_der(&self.0)
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Certificate {
    type Error = CertificateError;

    fn try_from(der: &[u8]) -> Result<Self, Self::Error> {
        parse_certificate(der)?;
        Ok(Self(der.to_vec()))
    }
}

impl TryFrom<Vec<u8>> for Certificate {
    type Error = CertificateError;

    fn try_from(der: Vec<u8>) -> Result<Self, Self::Error> {
        parse_certificate(&der)?;
        Ok(Self(der))
    }
}

/// Undecodable private key.
#[derive(Debug, Error, PartialEq)]
#[error("failed decoding PKCS#8 private key")]
pub struct PrivateKeyError(#[source] pkcs8::Error);

/// PKCS#8 DER private key. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = PrivateKeyError;

    fn try_from(der: &[u8]) -> Result<Self, Self::Error> {
        PrivateKeyInfo::try_from(der).map_err(PrivateKeyError)?;
        Ok(Self(der.to_vec()))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("len", &self.0.len())
            .finish()
    }
}

/// SPIFFE ID of a DER certificate, as used on handshake peer certificates.
///
/// # Errors
///
/// Fails unless the certificate parses and carries exactly one valid
/// `spiffe://` URI SAN.
pub fn spiffe_id_from_der(der: &[u8]) -> Result<SpiffeId, CertificateError> {
    single_spiffe_id(&parse_certificate(der)?)
}

//! X.509-SVIDs: a certificate chain and the private key for its leaf.

use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;

use crate::cert::parsing::MAX_CHAIN_LENGTH;
use crate::cert::{
    parse_certificate, single_spiffe_id, split_der_chain, Certificate, CertificateError,
    PrivateKey, PrivateKeyError,
};
use crate::spiffe_id::SpiffeId;

/// Reasons agent-delivered material is not a usable X.509-SVID.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum X509SvidError {
    /// No certificates.
    #[error("no certificates found in chain")]
    EmptyChain,

    /// Leaf is marked as a CA.
    #[error("leaf certificate must not have CA flag set to true")]
    LeafCertificateHasCaFlag,

    /// Leaf cannot sign handshakes.
    #[error("leaf certificate must have 'digitalSignature' set as key usage")]
    LeafCertificateMissingDigitalSignature,

    /// Leaf may sign certificates or CRLs.
    #[error("leaf certificate must not have 'keyCertSign' or 'cRLSign' set as key usage")]
    LeafCertificateCanSign,

    /// An intermediate is not a CA.
    #[error("signing certificate must have CA flag set to true")]
    SigningCertificateMissingCaFlag,

    /// Certificate problem.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Key problem.
    #[error(transparent)]
    PrivateKey(#[from] PrivateKeyError),
}

/// An X.509-SVID.
///
/// Values are replaced as a whole on rotation, never modified, so the chain
/// and key held by one value always belong together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Svid {
    spiffe_id: SpiffeId,
    cert_chain: Vec<Certificate>,
    private_key: PrivateKey,
    expiry: OffsetDateTime,
    hint: Option<String>,
}

impl X509Svid {
    /// Builds an SVID from concatenated DER certificates (leaf first) and a
    /// PKCS#8 DER key.
    ///
    /// # Errors
    ///
    /// Returns an [`X509SvidError`] if the chain is empty or malformed, the
    /// leaf is not a valid SVID leaf, or the key does not decode.
    pub fn parse_from_der(chain_der: &[u8], key_der: &[u8]) -> Result<Self, X509SvidError> {
        let cert_chain = split_der_chain(chain_der, Some(MAX_CHAIN_LENGTH))?;
        let (leaf, intermediates) = cert_chain.split_first().ok_or(X509SvidError::EmptyChain)?;

        let leaf_x509 = parse_certificate(leaf.as_bytes())?;
        check_leaf(&leaf_x509)?;
        let spiffe_id = single_spiffe_id(&leaf_x509)?;
        let expiry = leaf_x509.validity().not_after.to_datetime();

        for cert in intermediates {
            check_signing(&parse_certificate(cert.as_bytes())?)?;
        }

        let private_key = PrivateKey::try_from(key_der)?;

        Ok(Self {
            spiffe_id,
            cert_chain,
            private_key,
            expiry,
            hint: None,
        })
    }

    /// Attaches the agent-supplied hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        self.hint = (!hint.is_empty()).then_some(hint);
        self
    }

    /// Identity in the leaf URI SAN.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Chain, leaf first.
    pub fn cert_chain(&self) -> &[Certificate] {
        &self.cert_chain
    }

    /// Leaf certificate.
    pub fn leaf(&self) -> &Certificate {
        // parse_from_der rejects empty chains
        &self.cert_chain[0]
    }

    /// Private key for the leaf.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Leaf `notAfter`.
    pub fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    /// Agent-supplied hint, if any.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

fn check_leaf(cert: &X509Certificate<'_>) -> Result<(), X509SvidError> {
    if let Some(bc) = cert.basic_constraints().map_err(CertificateError::from)? {
        if bc.value.ca {
            return Err(X509SvidError::LeafCertificateHasCaFlag);
        }
    }
    if let Some(ku) = cert.key_usage().map_err(CertificateError::from)? {
        if !ku.value.digital_signature() {
            return Err(X509SvidError::LeafCertificateMissingDigitalSignature);
        }
        if ku.value.key_cert_sign() || ku.value.crl_sign() {
            return Err(X509SvidError::LeafCertificateCanSign);
        }
    }
    Ok(())
}

fn check_signing(cert: &X509Certificate<'_>) -> Result<(), X509SvidError> {
    match cert.basic_constraints().map_err(CertificateError::from)? {
        Some(bc) if bc.value.ca => Ok(()),
        _ => Err(X509SvidError::SigningCertificateMissingCaFlag),
    }
}

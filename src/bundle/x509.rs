//! X.509 bundles: per trust domain sets of CA certificates.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use thiserror::Error;

use super::BundleSource;
use crate::cert::{split_der_chain, Certificate, CertificateError};
use crate::spiffe_id::TrustDomain;

/// Malformed X.509 bundle.
#[derive(Debug, Error, PartialEq)]
#[error("invalid X.509 bundle")]
pub struct X509BundleError(#[from] CertificateError);

/// CA certificates trusted for one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Bundle {
    trust_domain: TrustDomain,
    x509_authorities: Vec<Certificate>,
}

impl X509Bundle {
    /// Empty bundle.
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            x509_authorities: Vec::new(),
        }
    }

    /// Parses concatenated DER CA certificates.
    ///
    /// # Errors
    ///
    /// Returns [`X509BundleError`] if any certificate fails to parse.
    pub fn parse_from_der(trust_domain: TrustDomain, der: &[u8]) -> Result<Self, X509BundleError> {
        Ok(Self {
            trust_domain,
            x509_authorities: split_der_chain(der, None)?,
        })
    }

    /// Adds one CA.
    pub fn add_authority(&mut self, authority: Certificate) {
        self.x509_authorities.push(authority);
    }

    /// Owning trust domain.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// CA certificates.
    pub fn authorities(&self) -> &[Certificate] {
        &self.x509_authorities
    }
}

/// X.509 bundles for the local and federated trust domains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X509BundleSet {
    bundles: HashMap<TrustDomain, Arc<X509Bundle>>,
}

impl X509BundleSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the bundle for its trust domain.
    pub fn add_bundle(&mut self, bundle: X509Bundle) {
        self.bundles
            .insert(bundle.trust_domain().clone(), Arc::new(bundle));
    }

    /// Bundle for `trust_domain`.
    pub fn get(&self, trust_domain: &TrustDomain) -> Option<Arc<X509Bundle>> {
        self.bundles.get(trust_domain).cloned()
    }

    /// Number of trust domains.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// `true` when no bundle is present.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// All bundles, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<X509Bundle>> {
        self.bundles.values()
    }
}

impl BundleSource for X509BundleSet {
    type Item = X509Bundle;
    type Error = Infallible;

    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error> {
        Ok(self.get(trust_domain))
    }
}

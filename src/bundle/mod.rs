//! Trust bundles: the anchors used to verify peers, keyed by trust domain.

pub mod jwt;
pub mod x509;

use std::error::Error;
use std::sync::Arc;

use crate::spiffe_id::TrustDomain;

pub use jwt::{JwtAuthority, JwtBundle, JwtBundleError, JwtBundleSet};
pub use x509::{X509Bundle, X509BundleError, X509BundleSet};

/// Lookup of a bundle by trust domain.
pub trait BundleSource {
    /// Bundle type handed out.
    type Item: Send + Sync + 'static;

    /// Failure to consult the source.
    type Error: Error + Send + Sync + 'static;

    /// Returns the bundle for `trust_domain`, or `Ok(None)` when the source
    /// holds none.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` when the source itself cannot be read.
    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error>;
}

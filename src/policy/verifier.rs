use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::bundle::{BundleSource, X509Bundle};
use crate::spiffe_id::{SpiffeId, TrustDomain};

use super::{AuthorizationPolicy, Authorizer, Unauthorized};

type LookupError = Box<dyn StdError + Send + Sync + 'static>;

trait X509BundleLookup: Send + Sync {
    fn lookup(&self, trust_domain: &TrustDomain) -> Result<Option<Arc<X509Bundle>>, LookupError>;
}

impl<S> X509BundleLookup for S
where
    S: BundleSource<Item = X509Bundle> + Send + Sync,
{
    fn lookup(&self, trust_domain: &TrustDomain) -> Result<Option<Arc<X509Bundle>>, LookupError> {
        self.bundle_for_trust_domain(trust_domain)
            .map_err(|e| Box::new(e) as LookupError)
    }
}

/// An [`AuthorizationPolicy`] bound to the trust bundles used to verify a
/// peer's certificate chain.
///
/// Cheap to clone, holds no mutable state of its own and may be shared by
/// any number of concurrent handshakes.
#[derive(Clone)]
pub struct PeerVerifier {
    policy: Arc<AuthorizationPolicy>,
    bundles: Arc<dyn X509BundleLookup>,
}

/// Binds `policy` to the bundles of `source`.
///
/// The source is consulted on every handshake, so bundle rotation is picked
/// up without rebuilding the verifier. The policy itself never changes.
pub fn build_verifier<S>(policy: AuthorizationPolicy, source: &S) -> PeerVerifier
where
    S: BundleSource<Item = X509Bundle> + Clone + Send + Sync + 'static,
{
    PeerVerifier {
        policy: Arc::new(policy),
        bundles: Arc::new(source.clone()),
    }
}

impl PeerVerifier {
    /// `true` if `peer` satisfies the policy.
    pub fn accepts(&self, peer: &SpiffeId) -> bool {
        self.policy.accepts(peer)
    }

    /// The bound policy.
    pub fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }

    /// Trust anchors for `trust_domain`, read from the source at call time.
    pub(crate) fn bundle_for(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<X509Bundle>>, LookupError> {
        self.bundles.lookup(trust_domain)
    }
}

impl Authorizer for PeerVerifier {
    fn authorize(&self, peer: &SpiffeId) -> Result<(), Unauthorized> {
        self.policy.authorize(peer)
    }
}

impl fmt::Debug for PeerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerVerifier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

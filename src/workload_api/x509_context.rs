use std::sync::Arc;

use crate::bundle::X509BundleSet;
use crate::svid::X509Svid;

/// The X.509 material carried by one agent update: the workload's SVIDs and
/// the bundles of its own and federated trust domains.
#[derive(Debug, Clone)]
pub struct X509Context {
    svids: Vec<Arc<X509Svid>>,
    bundles: Arc<X509BundleSet>,
}

impl X509Context {
    /// Builds a context from already-parsed material.
    pub fn new(
        svids: impl IntoIterator<Item = Arc<X509Svid>>,
        bundles: impl Into<Arc<X509BundleSet>>,
    ) -> Self {
        Self {
            svids: svids.into_iter().collect(),
            bundles: bundles.into(),
        }
    }

    /// The first SVID sent by the agent, which is the workload's default.
    pub fn default_svid(&self) -> Option<&Arc<X509Svid>> {
        self.svids.first()
    }

    /// Every SVID in the update.
    pub fn svids(&self) -> &[Arc<X509Svid>] {
        &self.svids
    }

    /// Bundle set in the update.
    pub fn bundles(&self) -> &Arc<X509BundleSet> {
        &self.bundles
    }
}

//! Peer authorization for mTLS sessions.
//!
//! A policy is chosen once per configuration load by [`select_policy`] and is
//! immutable afterwards. [`build_verifier`] binds it to the bundles of an
//! [`IdentitySource`](crate::IdentitySource); the TLS layer then asks the
//! verifier about every handshake.
//!
//! Selection precedence:
//!
//! 1. expected peer `any` → [`AuthorizationPolicy::AnyPeer`]
//! 2. expected peer that parses → [`AuthorizationPolicy::ExactPeer`]
//! 3. server role with a non-empty allow-list → [`AuthorizationPolicy::OneOfPeers`]
//! 4. otherwise → [`AuthorizationPolicy::TrustDomainMember`] of the local trust domain

mod verifier;

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::allowlist::AllowList;
use crate::config::non_empty;
use crate::error::{Error, Result};
use crate::observability::Logger;
use crate::prelude::{info, warn};
use crate::spiffe_id::{SpiffeId, TrustDomain};

pub use verifier::{build_verifier, PeerVerifier};

/// Expected-peer value that disables identity checks.
pub const ANY_PEER: &str = "any";

/// Which side of the handshake the policy protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Verifies the server it connects to.
    Client,
    /// Verifies the clients it accepts.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

/// Peer acceptance settings, as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    /// A single identity the peer must present, or [`ANY_PEER`].
    pub expected_peer: Option<String>,
    /// Accepted identities. Only consulted in the server role.
    pub allow_list: AllowList,
}

/// The rule a peer's identity must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationPolicy {
    /// Exactly this identity.
    ExactPeer(SpiffeId),
    /// Any identity that chains to a trusted bundle.
    AnyPeer,
    /// Any identity in this trust domain.
    TrustDomainMember(TrustDomain),
    /// One of these identities.
    OneOfPeers(BTreeSet<SpiffeId>),
}

impl AuthorizationPolicy {
    /// Pure predicate over a verified peer identity.
    pub fn accepts(&self, peer: &SpiffeId) -> bool {
        match self {
            Self::ExactPeer(expected) => peer == expected,
            Self::AnyPeer => true,
            Self::TrustDomainMember(td) => peer.is_member_of(td),
            Self::OneOfPeers(allowed) => allowed.contains(peer),
        }
    }

    /// Short name used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExactPeer(_) => "exact-peer",
            Self::AnyPeer => "any-peer",
            Self::TrustDomainMember(_) => "trust-domain-member",
            Self::OneOfPeers(_) => "one-of-peers",
        }
    }
}

impl fmt::Display for AuthorizationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExactPeer(id) => write!(f, "exact-peer({id})"),
            Self::AnyPeer => f.write_str("any-peer"),
            Self::TrustDomainMember(td) => write!(f, "trust-domain-member({td})"),
            Self::OneOfPeers(ids) => write!(f, "one-of-peers({} ids)", ids.len()),
        }
    }
}

/// A verified peer identity was refused by the policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("peer '{peer}' is not authorized by the {policy} policy")]
pub struct Unauthorized {
    /// Identity the peer presented.
    pub peer: SpiffeId,
    /// [`AuthorizationPolicy::kind`] of the refusing policy.
    pub policy: &'static str,
}

/// Decides whether a verified peer identity may proceed.
pub trait Authorizer: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns [`Unauthorized`] when the peer is refused.
    fn authorize(&self, peer: &SpiffeId) -> Result<(), Unauthorized>;
}

impl Authorizer for AuthorizationPolicy {
    fn authorize(&self, peer: &SpiffeId) -> Result<(), Unauthorized> {
        if self.accepts(peer) {
            Ok(())
        } else {
            Err(Unauthorized {
                peer: peer.clone(),
                policy: self.kind(),
            })
        }
    }
}

/// Chooses the policy for `role` from `config`.
///
/// `local_trust_domain` is the trust domain of the workload's own identity
/// and bounds the fallback.
///
/// # Errors
///
/// Returns [`Error::MalformedIdentity`] when the expected peer is set, is
/// not `any` and is not a valid identity.
pub fn select_policy(
    role: Role,
    config: &PeerConfig,
    local_trust_domain: &TrustDomain,
    logger: &Logger,
) -> Result<AuthorizationPolicy> {
    if let Some(expected) = non_empty(config.expected_peer.as_deref()) {
        if expected == ANY_PEER {
            warn!(logger, "{role} authorizing any peer identity");
            return Ok(AuthorizationPolicy::AnyPeer);
        }

        let id = SpiffeId::new(expected).map_err(|e| Error::malformed_identity(expected, e))?;
        info!(logger, "{role} authorizing peer identity {id}");
        return Ok(AuthorizationPolicy::ExactPeer(id));
    }

    if role == Role::Server && !config.allow_list.is_empty() {
        info!(
            logger,
            "{role} authorizing {} allow-listed peer identities",
            config.allow_list.len()
        );
        return Ok(AuthorizationPolicy::OneOfPeers(
            config.allow_list.ids().iter().cloned().collect(),
        ));
    }

    match role {
        Role::Server => warn!(
            logger,
            "no allowed peer identities, {role} authorizing trust domain {local_trust_domain}"
        ),
        Role::Client => info!(
            logger,
            "{role} authorizing any peer in trust domain {local_trust_domain}"
        ),
    }
    Ok(AuthorizationPolicy::TrustDomainMember(
        local_trust_domain.clone(),
    ))
}

//! JWT-SVIDs fetched on behalf of another workload through the SPIRE
//! Delegated Identity API.
//!
//! The broker (the agent's admin socket) returns zero or more tokens for the
//! workload matching every given [`Selector`]. A broker that refuses the
//! caller and a broker with no matching workload look the same: an empty
//! result.

mod client;
mod selectors;

use thiserror::Error;

use crate::config::{non_empty, DelegatedAuthConfig};
use crate::context::CallContext;
use crate::endpoint::{
    self, ResolvedEndpoint, ADMIN_SOCKET_ENV, AGENT_SOCKET_ENV, DEFAULT_ADMIN_SOCKET,
    DEFAULT_AGENT_SOCKET,
};
use crate::error::{Error, Result};
use crate::observability::Logger;
use crate::prelude::{debug, info};
use crate::proto::spire::api::types::Jwtsvid as ProtoJwtSvid;
use crate::spiffe_id::{SpiffeId, SpiffeIdError};
use crate::svid::{JwtSvid, JwtSvidError};
use crate::workload_api::WorkloadApiError;

pub use client::DelegatedIdentityClient;
pub use selectors::{K8s, Selector, Unix};

/// Delegated identity failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DelegationError {
    /// No selectors: the broker would have nothing to match.
    #[error("at least one selector is required")]
    EmptySelectors,

    /// No non-empty audience.
    #[error("at least one non-empty audience is required")]
    EmptyAudience,

    /// The broker could not be reached or failed the call.
    #[error("delegated identity broker call failed")]
    Broker(#[source] WorkloadApiError),

    /// A returned token is not a JWT-SVID.
    #[error("broker returned an invalid JWT-SVID")]
    InvalidToken(#[source] JwtSvidError),

    /// A returned identity is not a SPIFFE ID.
    #[error("broker returned an invalid identity")]
    InvalidIdentity(#[source] SpiffeIdError),

    /// The reported identity differs from the token subject.
    #[error("broker reported identity '{reported}' for a token issued to '{subject}'")]
    IdentityMismatch {
        /// Identity in the response.
        reported: SpiffeId,
        /// Subject of the token.
        subject: SpiffeId,
    },
}

/// A token issued to the delegated workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedJwt {
    /// The workload the token was issued to.
    pub identity: SpiffeId,
    /// The token.
    pub svid: JwtSvid,
}

/// Entry point for delegated mode.
#[derive(Debug, Clone)]
pub struct DelegatedAuth {
    config: DelegatedAuthConfig,
    logger: Logger,
}

impl DelegatedAuth {
    /// Wraps `config`; sockets are resolved per request.
    pub fn new(config: DelegatedAuthConfig, logger: Logger) -> Self {
        Self { config, logger }
    }

    /// The broker socket: `admin_uds_path`, then
    /// `SPIRE_ADMIN_ENDPOINT_SOCKET`, then the default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`].
    pub fn admin_endpoint(&self) -> Result<ResolvedEndpoint> {
        endpoint::resolve(
            non_empty(self.config.admin_uds_path.as_deref()),
            ADMIN_SOCKET_ENV,
            DEFAULT_ADMIN_SOCKET,
        )
    }

    /// The caller's own agent socket, for callers that also need an
    /// [`IdentitySource`](crate::IdentitySource). Fetching delegated tokens
    /// never opens one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`].
    pub fn agent_endpoint(&self) -> Result<ResolvedEndpoint> {
        endpoint::resolve(
            non_empty(self.config.uds_path.as_deref()),
            AGENT_SOCKET_ENV,
            DEFAULT_AGENT_SOCKET,
        )
    }

    /// Fetches JWT-SVIDs for `audiences` on behalf of the workload matching
    /// all `selectors`.
    ///
    /// One attempt, no retries. The broker connection is dropped before
    /// returning on every path.
    ///
    /// # Errors
    ///
    /// - [`Error::Delegation`] for empty selectors or audiences, an
    ///   unreachable broker, a failed call or an unparseable token.
    /// - [`Error::InvalidEndpoint`] for a bad admin socket address.
    /// - [`Error::Timeout`] or [`Error::Cancelled`] from `ctx`.
    pub async fn fetch_jwt_svids<A>(
        &self,
        ctx: &CallContext,
        selectors: &[Selector],
        audiences: &[A],
    ) -> Result<Vec<DelegatedJwt>>
    where
        A: AsRef<str>,
    {
        if selectors.is_empty() {
            return Err(DelegationError::EmptySelectors.into());
        }
        let audiences: Vec<String> = audiences
            .iter()
            .filter_map(|a| non_empty(Some(a.as_ref())))
            .map(str::to_owned)
            .collect();
        if audiences.is_empty() {
            return Err(DelegationError::EmptyAudience.into());
        }

        let resolved = self.admin_endpoint()?;
        let selector_list = selectors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        debug!(
            self.logger,
            "fetching delegated JWT-SVIDs: broker={}, selectors=[{selector_list}]",
            resolved.endpoint()
        );

        let svids = ctx
            .run("fetch delegated JWT-SVIDs", async {
                let client = DelegatedIdentityClient::connect(resolved.endpoint())
                    .await
                    .map_err(DelegationError::Broker)?;
                match client.fetch_jwt_svids(&audiences, selectors).await {
                    Ok(svids) => Ok(svids),
                    Err(e) if e.is_permission_denied() => {
                        info!(
                            self.logger,
                            "broker refused delegated request for [{selector_list}]: {e}"
                        );
                        Ok(Vec::new())
                    }
                    Err(e) => Err(Error::from(DelegationError::Broker(e))),
                }
            })
            .await?;

        let issued = svids
            .into_iter()
            .map(parse_delegated)
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            self.logger,
            "fetched {} delegated JWT-SVIDs for [{selector_list}]",
            issued.len()
        );
        Ok(issued)
    }
}

fn parse_delegated(svid: ProtoJwtSvid) -> Result<DelegatedJwt, DelegationError> {
    let parsed = JwtSvid::parse_insecure(&svid.token).map_err(DelegationError::InvalidToken)?;
    let parsed = if svid.hint.is_empty() {
        parsed
    } else {
        parsed.with_hint(svid.hint)
    };

    let identity = match svid.id {
        Some(id) => {
            let reported = SpiffeId::new(&format!("spiffe://{}{}", id.trust_domain, id.path))
                .map_err(DelegationError::InvalidIdentity)?;
            if &reported != parsed.spiffe_id() {
                return Err(DelegationError::IdentityMismatch {
                    reported,
                    subject: parsed.spiffe_id().clone(),
                });
            }
            reported
        }
        None => parsed.spiffe_id().clone(),
    };

    Ok(DelegatedJwt {
        identity,
        svid: parsed,
    })
}

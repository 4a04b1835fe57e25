//! Direct-mode JWT-SVID issuance and validation.
//!
//! [`JwtWorkflow::fetch`] acquires the workload's own identity from an
//! [`IdentitySource`], then issues a token for the requested audience and
//! fetches the JWT bundles concurrently. [`validate`] is the receiving side.

use std::sync::Arc;

use crate::bundle::JwtBundleSet;
use crate::context::CallContext;
use crate::error::{Error, Result, ValidationError, ValidationFailure};
use crate::observability::Logger;
use crate::prelude::{debug, info};
use crate::source::IdentitySource;
use crate::spiffe_id::SpiffeId;
use crate::svid::jwt::JwtSvidError;
use crate::svid::JwtSvid;
use crate::workload_api::{WorkloadApiClient, WorkloadApiError};

/// A freshly issued token and the bundles that validate it.
#[derive(Debug, Clone)]
pub struct JwtCredentials {
    /// JWT bundles of every trust domain the workload trusts.
    pub bundles: Arc<JwtBundleSet>,
    /// The issued token.
    pub svid: JwtSvid,
}

/// Issues JWT-SVIDs for the identity held by a source.
#[derive(Debug, Clone)]
pub struct JwtWorkflow {
    source: IdentitySource,
    client: WorkloadApiClient,
    logger: Logger,
}

impl JwtWorkflow {
    /// Connects to the agent behind `source`.
    ///
    /// # Errors
    ///
    /// [`Error::SourceUnavailable`] if the agent cannot be reached, or
    /// [`Error::Timeout`] / [`Error::Cancelled`] from `ctx`.
    pub async fn connect(source: IdentitySource, ctx: &CallContext, logger: Logger) -> Result<Self> {
        let client = ctx
            .run("connect to agent", async {
                WorkloadApiClient::connect(source.endpoint())
                    .await
                    .map_err(Error::SourceUnavailable)
            })
            .await?;

        Ok(Self {
            source,
            client,
            logger,
        })
    }

    /// The source the workflow issues for.
    pub fn source(&self) -> &IdentitySource {
        &self.source
    }

    /// Issues a token for `audience` with the workload's own identity as
    /// subject, along with the bundles needed to validate it.
    ///
    /// # Errors
    ///
    /// - [`Error::IdentityUnavailable`] if the source has no identity to
    ///   offer, for example after it was closed.
    /// - [`Error::Issuance`] if `audience` is blank or the agent refuses.
    /// - [`Error::SourceUnavailable`] if bundles cannot be fetched or lack
    ///   the workload's trust domain.
    /// - [`Error::Timeout`] or [`Error::Cancelled`] from `ctx`.
    pub async fn fetch(&self, ctx: &CallContext, audience: &str) -> Result<JwtCredentials> {
        let identity = self
            .source
            .current_identity()
            .map_err(Error::identity_unavailable)?;
        let subject = identity.spiffe_id();

        if audience.trim().is_empty() {
            return Err(Error::Issuance(WorkloadApiError::EmptyAudience));
        }

        let (svid, bundles) = ctx
            .run("fetch JWT credentials", async {
                let (svid, bundles) = tokio::join!(
                    self.client.fetch_jwt_svid([audience], Some(subject)),
                    self.client.fetch_jwt_bundles(),
                );
                Ok((
                    svid.map_err(Error::Issuance)?,
                    bundles.map_err(Error::SourceUnavailable)?,
                ))
            })
            .await?;

        let trust_domain = subject.trust_domain();
        if bundles.get(trust_domain).is_none() {
            return Err(Error::SourceUnavailable(WorkloadApiError::NoBundle(
                trust_domain.clone(),
            )));
        }

        info!(
            self.logger,
            "issued JWT-SVID: spiffe_id={}, audience={audience}, expiry={}",
            svid.spiffe_id(),
            svid.expiry()
        );
        debug!(self.logger, "JWT bundles for {} trust domains", bundles.len());

        Ok(JwtCredentials {
            bundles: Arc::new(bundles),
            svid,
        })
    }
}

/// Verifies `token` against `bundles` and returns its subject.
///
/// Checks the signature with the key the bundle of the subject's trust
/// domain holds for the token's `kid`, that `expected_audience` is among the
/// `aud` values and that the token has not expired. No clock leeway.
///
/// # Errors
///
/// [`Error::Validation`]; [`ValidationError::kind`] says which check failed.
pub fn validate(bundles: &JwtBundleSet, token: &str, expected_audience: &str) -> Result<SpiffeId> {
    let svid = JwtSvid::parse_and_validate(token, bundles, expected_audience)
        .map_err(ValidationError::from)?;
    Ok(svid.spiffe_id().clone())
}

/// Verifies an already parsed credential, expecting its first audience.
///
/// # Errors
///
/// See [`validate`].
pub fn validate_credential(bundles: &JwtBundleSet, svid: &JwtSvid) -> Result<SpiffeId> {
    let audience = svid.audience().first().ok_or_else(|| {
        ValidationError::new(
            ValidationFailure::Audience,
            JwtSvidError::InvalidToken(jsonwebtoken::errors::ErrorKind::InvalidAudience.into()),
        )
    })?;
    validate(bundles, svid.token(), audience)
}

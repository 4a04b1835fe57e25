use tonic::transport::Channel;

use crate::endpoint::Endpoint;
use crate::proto::spire::api::agent::delegatedidentity::v1::delegated_identity_client::DelegatedIdentityClient as DelegatedIdentityApiClient;
use crate::proto::spire::api::agent::delegatedidentity::v1::FetchJwtsviDsRequest;
use crate::proto::spire::api::types::Jwtsvid as ProtoJwtSvid;
use crate::transport;
use crate::workload_api::WorkloadApiError;

use super::Selector;

/// Client for the SPIRE agent's Delegated Identity API.
///
/// Must be pointed at the agent's admin socket, not the Workload API socket.
/// The connection closes when the client is dropped.
#[derive(Debug, Clone)]
pub struct DelegatedIdentityClient {
    client: DelegatedIdentityApiClient<Channel>,
}

impl DelegatedIdentityClient {
    /// Connects to the broker at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Transport`] if the socket cannot be reached.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, WorkloadApiError> {
        let channel = transport::connect(endpoint).await?;
        Ok(Self {
            client: DelegatedIdentityApiClient::new(channel),
        })
    }

    /// Raw `FetchJWTSVIDs` call for the workload matching all `selectors`.
    ///
    /// # Errors
    ///
    /// Returns the broker's status mapped to a [`WorkloadApiError`].
    pub(crate) async fn fetch_jwt_svids(
        &self,
        audiences: &[String],
        selectors: &[Selector],
    ) -> Result<Vec<ProtoJwtSvid>, WorkloadApiError> {
        let request = FetchJwtsviDsRequest {
            audience: audiences.to_vec(),
            selectors: selectors.iter().map(Into::into).collect(),
            pid: 0,
        };

        let response = self
            .client
            .clone()
            .fetch_jwtsvi_ds(request)
            .await?
            .into_inner();
        Ok(response.svids)
    }
}

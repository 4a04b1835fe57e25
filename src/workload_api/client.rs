//! Workload API calls over a tonic channel.
//!
//! One-shot fetches take the first message of the server stream. The
//! streaming variant hands every update to the caller and is what
//! [`crate::IdentitySource`] consumes to keep its material current.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt as _};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use crate::bundle::{JwtBundle, JwtBundleSet, X509Bundle, X509BundleSet};
use crate::endpoint::Endpoint;
use crate::proto::workload::spiffe_workload_api_client::SpiffeWorkloadApiClient;
use crate::proto::workload::{
    JwtBundlesRequest, JwtBundlesResponse, JwtsvidRequest, X509svidRequest, X509svidResponse,
};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::{JwtSvid, X509Svid};
use crate::transport::{self, WorkloadHeader};

use super::{WorkloadApiError, X509Context};

/// Stream of X.509 context updates. Ends when the agent closes the stream.
pub type X509ContextStream =
    Pin<Box<dyn Stream<Item = Result<X509Context, WorkloadApiError>> + Send + 'static>>;

/// Client for the SPIFFE Workload API.
///
/// Cloning is cheap and clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct WorkloadApiClient {
    endpoint: Endpoint,
    client: SpiffeWorkloadApiClient<InterceptedService<Channel, WorkloadHeader>>,
}

impl WorkloadApiClient {
    /// Connects to the agent at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Transport`] if the socket cannot be reached.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, WorkloadApiError> {
        let channel = transport::connect(endpoint).await?;
        Ok(Self {
            endpoint: endpoint.clone(),
            client: SpiffeWorkloadApiClient::with_interceptor(channel, WorkloadHeader),
        })
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Fetches the workload's current SVIDs and bundles.
    ///
    /// # Errors
    ///
    /// Fails if the call fails, the stream ends before the first message or
    /// the material in it does not parse.
    pub async fn fetch_x509_context(&self) -> Result<X509Context, WorkloadApiError> {
        let mut client = self.client.clone();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;
        let message = first_message(response.into_inner()).await?;
        parse_x509_context(message)
    }

    /// Fetches the workload's default X.509-SVID.
    ///
    /// # Errors
    ///
    /// Same as [`WorkloadApiClient::fetch_x509_context`], plus
    /// [`WorkloadApiError::EmptyResponse`] when the update holds no SVID.
    pub async fn fetch_x509_svid(&self) -> Result<Arc<X509Svid>, WorkloadApiError> {
        let context = self.fetch_x509_context().await?;
        context
            .default_svid()
            .cloned()
            .ok_or(WorkloadApiError::EmptyResponse)
    }

    /// Opens the X.509 update stream.
    ///
    /// The stream does not reconnect on its own.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be opened. Per-update failures are
    /// yielded as stream items.
    pub async fn stream_x509_contexts(&self) -> Result<X509ContextStream, WorkloadApiError> {
        let mut client = self.client.clone();
        let response = client.fetch_x509svid(X509svidRequest::default()).await?;
        let stream = response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(parse_x509_context)
        });
        Ok(Box::pin(stream))
    }

    /// Requests a JWT-SVID for `audiences`.
    ///
    /// With `subject` unset the agent picks the workload's default identity.
    ///
    /// # Errors
    ///
    /// Returns the agent's refusal (mapped from the gRPC status),
    /// [`WorkloadApiError::EmptyResponse`] when no token comes back, or a
    /// parse error for the returned token.
    pub async fn fetch_jwt_svid<I>(
        &self,
        audiences: I,
        subject: Option<&SpiffeId>,
    ) -> Result<JwtSvid, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let request = JwtsvidRequest {
            audience: audiences
                .into_iter()
                .map(|a| a.as_ref().to_owned())
                .collect(),
            spiffe_id: subject.map(ToString::to_string).unwrap_or_default(),
        };

        let mut client = self.client.clone();
        let response = client.fetch_jwtsvid(request).await?.into_inner();
        let first = response
            .svids
            .into_iter()
            .next()
            .ok_or(WorkloadApiError::EmptyResponse)?;

        let svid = JwtSvid::parse_insecure(&first.svid)?;
        Ok(if first.hint.is_empty() {
            svid
        } else {
            svid.with_hint(first.hint)
        })
    }

    /// Fetches the JWT bundles of every trust domain the workload trusts.
    ///
    /// # Errors
    ///
    /// Fails if the call fails, the stream ends before the first message or
    /// a JWKS does not parse.
    pub async fn fetch_jwt_bundles(&self) -> Result<JwtBundleSet, WorkloadApiError> {
        let mut client = self.client.clone();
        let response = client.fetch_jwt_bundles(JwtBundlesRequest::default()).await?;
        let message = first_message(response.into_inner()).await?;
        parse_jwt_bundle_set(message)
    }
}

async fn first_message<T>(mut stream: tonic::Streaming<T>) -> Result<T, WorkloadApiError> {
    stream
        .message()
        .await?
        .ok_or(WorkloadApiError::EmptyResponse)
}

fn parse_x509_context(response: X509svidResponse) -> Result<X509Context, WorkloadApiError> {
    let mut svids = Vec::with_capacity(response.svids.len());
    let mut bundles = X509BundleSet::new();

    for svid in response.svids {
        let mut parsed = X509Svid::parse_from_der(&svid.x509_svid, &svid.x509_svid_key)?;
        if !svid.hint.is_empty() {
            parsed = parsed.with_hint(svid.hint);
        }

        let trust_domain = parsed.spiffe_id().trust_domain().clone();
        bundles.add_bundle(X509Bundle::parse_from_der(trust_domain, &svid.bundle)?);
        svids.push(Arc::new(parsed));
    }

    for (trust_domain, der) in response.federated_bundles {
        let trust_domain = TrustDomain::new(&trust_domain)?;
        bundles.add_bundle(X509Bundle::parse_from_der(trust_domain, &der)?);
    }

    Ok(X509Context::new(svids, bundles))
}

fn parse_jwt_bundle_set(response: JwtBundlesResponse) -> Result<JwtBundleSet, WorkloadApiError> {
    let mut set = JwtBundleSet::new();
    for (trust_domain, jwks) in response.bundles {
        let trust_domain = TrustDomain::new(&trust_domain)?;
        set.add_bundle(JwtBundle::from_jwt_authorities(trust_domain, &jwks)?);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::workload::X509svid;

    #[test]
    fn empty_update_parses_to_empty_context() {
        let context = parse_x509_context(X509svidResponse::default()).unwrap();
        assert!(context.default_svid().is_none());
        assert!(context.bundles().is_empty());
    }

    #[test]
    fn garbage_svid_is_rejected() {
        let response = X509svidResponse {
            svids: vec![X509svid {
                spiffe_id: "spiffe://example.org/w".into(),
                x509_svid: vec![1, 2, 3].into(),
                x509_svid_key: vec![4, 5, 6].into(),
                bundle: Default::default(),
                hint: String::new(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            parse_x509_context(response),
            Err(WorkloadApiError::X509Svid(_))
        ));
    }

    #[test]
    fn federated_bundle_key_must_be_a_trust_domain() {
        let mut response = X509svidResponse::default();
        response
            .federated_bundles
            .insert("Not A Domain".into(), Default::default());
        assert!(matches!(
            parse_x509_context(response),
            Err(WorkloadApiError::SpiffeId(_))
        ));
    }

    #[test]
    fn jwt_bundles_keyed_by_trust_domain_id() {
        let mut response = JwtBundlesResponse::default();
        response
            .bundles
            .insert("spiffe://example.org".into(), br#"{"keys": []}"#.to_vec().into());
        let set = parse_jwt_bundle_set(response).unwrap();
        let td = TrustDomain::new("example.org").unwrap();
        assert!(set.get(&td).is_some());
    }
}

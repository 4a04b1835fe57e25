use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::client::Resumption;
use rustls::ClientConfig;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{non_empty, ClientAuthConfig};
use crate::context::CallContext;
use crate::endpoint::{self, ResolvedEndpoint, AGENT_SOCKET_ENV, DEFAULT_AGENT_SOCKET};
use crate::error::{Error, Result};
use crate::jwt::JwtWorkflow;
use crate::observability::Logger;
use crate::policy::{build_verifier, select_policy, AuthorizationPolicy, PeerConfig, PeerVerifier, Role};
use crate::prelude::info;
use crate::source::IdentitySource;
use crate::spiffe_id::SpiffeId;

use super::crypto::provider;
use super::resolve::SvidResolver;
use super::verifier::SpiffeServerCertVerifier;
use super::{peer_identity, TlsError};

/// Entry point for the client role.
#[derive(Debug, Clone)]
pub struct ClientAuth {
    config: ClientAuthConfig,
    logger: Logger,
}

impl ClientAuth {
    /// Nothing is resolved or contacted until a method needs the agent.
    pub fn new(config: ClientAuthConfig, logger: Logger) -> Self {
        Self { config, logger }
    }

    /// The agent socket: `uds_path`, then `SPIFFE_ENDPOINT_SOCKET`, then the
    /// default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`](crate::Error::InvalidEndpoint).
    pub fn endpoint(&self) -> Result<ResolvedEndpoint> {
        endpoint::resolve(
            non_empty(self.config.uds_path.as_deref()),
            AGENT_SOCKET_ENV,
            DEFAULT_AGENT_SOCKET,
        )
    }

    /// Opens an identity source on the resolved agent socket.
    ///
    /// # Errors
    ///
    /// See [`IdentitySource::open`].
    pub async fn open_source(&self, ctx: &CallContext) -> Result<IdentitySource> {
        let resolved = self.endpoint()?;
        IdentitySource::open(resolved.endpoint(), ctx, self.logger.clone()).await
    }

    /// Builds an mTLS client that authorizes the server by
    /// `server_svid`, or by the local trust domain when unset.
    ///
    /// The returned client owns the identity source; call
    /// [`MtlsClient::close`] when done.
    ///
    /// # Errors
    ///
    /// Source errors from [`IdentitySource::open`],
    /// [`Error::MalformedIdentity`](crate::Error::MalformedIdentity) for a bad
    /// `server_svid`, or [`Error::Tls`](crate::Error::Tls).
    pub async fn tls_client(&self, ctx: &CallContext) -> Result<MtlsClient> {
        let source = self.open_source(ctx).await?;
        match self.build(&source) {
            Ok(client) => Ok(client),
            Err(e) => {
                source.close().await;
                Err(e)
            }
        }
    }

    /// Opens a source and wraps it in a [`JwtWorkflow`].
    ///
    /// # Errors
    ///
    /// [`Error::IdentityUnavailable`](crate::Error::IdentityUnavailable)
    /// wrapping the [`IdentitySource::open`] failure, or
    /// [`Error::Timeout`](crate::Error::Timeout) or
    /// [`Error::Cancelled`](crate::Error::Cancelled) from `ctx`.
    pub async fn jwt_workflow(&self, ctx: &CallContext) -> Result<JwtWorkflow> {
        let source = self
            .open_source(ctx)
            .await
            .map_err(Error::identity_unavailable)?;
        match JwtWorkflow::connect(source.clone(), ctx, self.logger.clone()).await {
            Ok(workflow) => Ok(workflow),
            Err(e) => {
                source.close().await;
                Err(e)
            }
        }
    }

    fn build(&self, source: &IdentitySource) -> Result<MtlsClient> {
        let peers = PeerConfig {
            expected_peer: self.config.server_svid.clone(),
            ..PeerConfig::default()
        };
        let policy = select_policy(Role::Client, &peers, &source.trust_domain()?, &self.logger)?;
        let verifier = build_verifier(policy, source);

        let provider = provider();
        let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(TlsError::from)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SpiffeServerCertVerifier::new(
                verifier.clone(),
                Arc::clone(&provider),
                self.logger.clone(),
            )))
            .with_client_cert_resolver(Arc::new(SvidResolver::new(
                source.clone(),
                provider,
                self.logger.clone(),
            )));
        // Every handshake must verify the peer against the live bundle and
        // present the current SVID.
        config.resumption = Resumption::disabled();

        info!(
            self.logger,
            "mTLS client ready: policy={}",
            verifier.policy()
        );

        Ok(MtlsClient {
            config: Arc::new(config),
            source: source.clone(),
            verifier,
            logger: self.logger.clone(),
        })
    }
}

/// A rustls client configuration bound to a live identity source.
///
/// [`MtlsClient::connect`] gives a raw stream. For HTTP, hand
/// [`MtlsClient::config`] to a connector:
///
/// ```no_run
/// use std::sync::Arc;
///
/// use hyper_util::rt::TokioIo;
/// use rustls::pki_types::ServerName;
/// use spire_authz::{CallContext, ClientAuth, ClientAuthConfig, Logger};
/// use tokio::net::TcpStream;
/// use tokio_rustls::TlsConnector;
/// use tonic::transport::{Endpoint, Uri};
/// use tower::service_fn;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientAuthConfig {
///     server_svid: Some("spiffe://example.org/payments/api".to_owned()),
///     ..ClientAuthConfig::default()
/// };
/// let client = ClientAuth::new(config, Logger::log_crate())
///     .tls_client(&CallContext::new())
///     .await?;
///
/// let mut tls = (*client.config()).clone();
/// tls.alpn_protocols = vec![b"h2".to_vec()];
/// let connector = TlsConnector::from(Arc::new(tls));
///
/// // HTTP/2 channel for any generated tonic client.
/// let channel = Endpoint::try_from("http://payments.internal:8443")?
///     .connect_with_connector(service_fn(move |uri: Uri| {
///         let connector = connector.clone();
///         async move {
///             let host = uri.host().unwrap_or("localhost").to_owned();
///             let tcp = TcpStream::connect((host.as_str(), uri.port_u16().unwrap_or(443))).await?;
///             let name = ServerName::try_from(host).map_err(std::io::Error::other)?;
///             let tls = connector.connect(name, tcp).await?;
///             Ok::<_, std::io::Error>(TokioIo::new(tls))
///         }
///     }))
///     .await?;
/// # drop(channel);
/// # client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MtlsClient {
    config: Arc<ClientConfig>,
    source: IdentitySource,
    verifier: PeerVerifier,
    logger: Logger,
}

impl MtlsClient {
    /// The rustls configuration, for use with an HTTP or gRPC stack.
    pub fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// The policy the server must satisfy.
    pub fn policy(&self) -> &AuthorizationPolicy {
        self.verifier.policy()
    }

    /// The identity source backing this client.
    pub fn source(&self) -> &IdentitySource {
        &self.source
    }

    /// Connects to `addr` and completes an mTLS handshake.
    ///
    /// `server_name` is only sent as SNI; the server is authenticated by its
    /// SPIFFE ID.
    ///
    /// # Errors
    ///
    /// [`Error::Tls`](crate::Error::Tls) for socket and handshake failures,
    /// including a rejected server identity, and
    /// [`Error::Timeout`](crate::Error::Timeout) or
    /// [`Error::Cancelled`](crate::Error::Cancelled) from `ctx`.
    pub async fn connect(
        &self,
        ctx: &CallContext,
        addr: impl ToSocketAddrs,
        server_name: &str,
    ) -> Result<(TlsStream<TcpStream>, SpiffeId)> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_owned()))?;
        let connector = TlsConnector::from(Arc::clone(&self.config));

        ctx.run("mTLS connect", async {
            let tcp = TcpStream::connect(addr).await.map_err(TlsError::Io)?;
            let stream = connector
                .connect(name, tcp)
                .await
                .map_err(TlsError::from_io)?;

            let (_, session) = stream.get_ref();
            let peer = peer_identity(session.peer_certificates().unwrap_or_default())?;
            info!(self.logger, "connected to server {peer}");
            Ok((stream, peer))
        })
        .await
    }

    /// Closes the identity source.
    pub async fn close(&self) {
        self.source.close().await;
    }
}

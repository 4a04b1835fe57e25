use std::sync::Arc;

use rustls::server::NoServerSessionStorage;
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::allowlist::AllowList;
use crate::config::{non_empty, ServerAuthConfig};
use crate::context::CallContext;
use crate::endpoint::{self, ResolvedEndpoint, AGENT_SOCKET_ENV, DEFAULT_AGENT_SOCKET};
use crate::error::Result;
use crate::observability::Logger;
use crate::policy::{build_verifier, select_policy, AuthorizationPolicy, PeerConfig, PeerVerifier, Role};
use crate::prelude::{debug, info};
use crate::source::IdentitySource;
use crate::spiffe_id::SpiffeId;

use super::crypto::provider;
use super::resolve::SvidResolver;
use super::verifier::SpiffeClientCertVerifier;
use super::{peer_identity, TlsError};

/// Entry point for the server role.
#[derive(Debug, Clone)]
pub struct ServerAuth {
    config: ServerAuthConfig,
    logger: Logger,
}

impl ServerAuth {
    /// Nothing is read or contacted until [`ServerAuth::tls_config`].
    pub fn new(config: ServerAuthConfig, logger: Logger) -> Self {
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

    /// Reads the configured allow-list.
    ///
    /// Without `strict_allow_list` an unreadable file is logged and treated
    /// as empty, which widens the policy to the local trust domain.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigLoad`](crate::Error::ConfigLoad), only in strict mode.
    pub fn allow_list(&self) -> Result<AllowList> {
        let path = match self.config.allowed_spiffe_ids_file.as_deref() {
            Some(path) if !path.as_os_str().is_empty() => path,
            _ => {
                debug!(self.logger, "no allow-list configured");
                return Ok(AllowList::default());
            }
        };

        if self.config.strict_allow_list {
            AllowList::load(path)
        } else {
            Ok(AllowList::load_or_empty(path, &self.logger))
        }
    }

    /// Builds the rustls server configuration.
    ///
    /// The allow-list is read before the agent is contacted, so a strict
    /// load failure never opens a source.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigLoad`](crate::Error::ConfigLoad) in strict mode, source
    /// errors from [`IdentitySource::open`], or
    /// [`Error::Tls`](crate::Error::Tls).
    pub async fn tls_config(&self, ctx: &CallContext) -> Result<ServerTls> {
        let allow_list = self.allow_list()?;
        let resolved = self.endpoint()?;
        let source = IdentitySource::open(resolved.endpoint(), ctx, self.logger.clone()).await?;

        match self.build(&source, allow_list) {
            Ok(tls) => Ok(tls),
            Err(e) => {
                source.close().await;
                Err(e)
            }
        }
    }

    fn build(&self, source: &IdentitySource, allow_list: AllowList) -> Result<ServerTls> {
        let peers = PeerConfig {
            expected_peer: None,
            allow_list,
        };
        let policy = select_policy(Role::Server, &peers, &source.trust_domain()?, &self.logger)?;
        let verifier = build_verifier(policy, source);

        let provider = provider();
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(TlsError::from)?
            .with_client_cert_verifier(Arc::new(SpiffeClientCertVerifier::new(
                verifier.clone(),
                Arc::clone(&provider),
                self.logger.clone(),
            )))
            .with_cert_resolver(Arc::new(SvidResolver::new(
                source.clone(),
                provider,
                self.logger.clone(),
            )));
        // No resumed sessions: the client is verified on every handshake.
        config.session_storage = Arc::new(NoServerSessionStorage {});
        config.send_tls13_tickets = 0;

        info!(
            self.logger,
            "mTLS server config ready: policy={}",
            verifier.policy()
        );

        Ok(ServerTls {
            config: Arc::new(config),
            source: source.clone(),
            verifier,
            logger: self.logger.clone(),
        })
    }
}

/// A rustls server configuration bound to a live identity source.
#[derive(Debug, Clone)]
pub struct ServerTls {
    config: Arc<ServerConfig>,
    source: IdentitySource,
    verifier: PeerVerifier,
    logger: Logger,
}

impl ServerTls {
    /// The rustls configuration, for use with an HTTP or gRPC server.
    pub fn config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    /// A tokio-rustls acceptor sharing this configuration.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }

    /// The policy clients must satisfy.
    pub fn policy(&self) -> &AuthorizationPolicy {
        self.verifier.policy()
    }

    /// The identity source backing this configuration.
    pub fn source(&self) -> &IdentitySource {
        &self.source
    }

    /// Completes the server side of an mTLS handshake on `stream`.
    ///
    /// # Errors
    ///
    /// [`Error::Tls`](crate::Error::Tls) when the handshake fails or the
    /// client is refused, [`Error::Timeout`](crate::Error::Timeout) or
    /// [`Error::Cancelled`](crate::Error::Cancelled) from `ctx`.
    pub async fn accept(
        &self,
        ctx: &CallContext,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, SpiffeId)> {
        let acceptor = self.acceptor();
        ctx.run("mTLS accept", async {
            let stream = acceptor.accept(stream).await.map_err(TlsError::from_io)?;

            let (_, session) = stream.get_ref();
            let peer = peer_identity(session.peer_certificates().unwrap_or_default())?;
            info!(self.logger, "accepted client {peer}");
            Ok((stream, peer))
        })
        .await
    }

    /// Closes the identity source.
    pub async fn close(&self) {
        self.source.close().await;
    }
}

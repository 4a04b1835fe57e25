//! rustls verifiers that pick trust anchors by the peer's trust domain and
//! authorize by SPIFFE ID.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};

use crate::bundle::X509Bundle;
use crate::cert::spiffe_id_from_der;
use crate::observability::Logger;
use crate::policy::{Authorizer, PeerVerifier};
use crate::prelude::{debug, warn};
use crate::spiffe_id::SpiffeId;

use super::material::{root_store, Memo};
use super::TlsError;

fn other_err(e: TlsError) -> rustls::Error {
    rustls::Error::Other(rustls::OtherError(Arc::new(e)))
}

/// Shared lookup from a peer leaf to the anchors of its trust domain.
struct Anchors {
    verifier: PeerVerifier,
    roots: Memo<X509Bundle, Arc<RootCertStore>>,
}

impl Anchors {
    fn new(verifier: PeerVerifier) -> Self {
        Self {
            verifier,
            roots: Memo::new(),
        }
    }

    /// The peer's claimed identity and the bundle of its trust domain. The
    /// claim is only used to choose anchors; the chain is verified after.
    fn for_leaf(
        &self,
        end_entity: &CertificateDer<'_>,
    ) -> Result<(SpiffeId, Arc<X509Bundle>), TlsError> {
        let peer = spiffe_id_from_der(end_entity.as_ref()).map_err(TlsError::PeerCertificate)?;
        let bundle = self
            .verifier
            .bundle_for(peer.trust_domain())
            .map_err(TlsError::BundleLookup)?
            .ok_or_else(|| TlsError::NoBundle(peer.trust_domain().clone()))?;
        Ok((peer, bundle))
    }

    fn roots(&self, bundle: &Arc<X509Bundle>) -> Result<Arc<RootCertStore>, TlsError> {
        self.roots.get_or_try_init(bundle, root_store)
    }

    fn authorize(&self, peer: &SpiffeId) -> Result<(), TlsError> {
        self.verifier.authorize(peer).map_err(TlsError::from)
    }
}

/// Client-side verifier of the server's certificate.
pub(crate) struct SpiffeServerCertVerifier {
    anchors: Anchors,
    provider: Arc<CryptoProvider>,
    logger: Logger,
}

impl SpiffeServerCertVerifier {
    pub(crate) fn new(verifier: PeerVerifier, provider: Arc<CryptoProvider>, logger: Logger) -> Self {
        Self {
            anchors: Anchors::new(verifier),
            provider,
            logger,
        }
    }

    fn verify(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<SpiffeId, rustls::Error> {
        let (peer, bundle) = self.anchors.for_leaf(end_entity).map_err(other_err)?;
        let roots = self.anchors.roots(&bundle).map_err(other_err)?;

        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;

        self.anchors.authorize(&peer).map_err(other_err)?;
        Ok(peer)
    }
}

impl ServerCertVerifier for SpiffeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.verify(end_entity, intermediates, now) {
            Ok(peer) => {
                debug!(self.logger, "server authenticated: peer={peer}");
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => {
                warn!(self.logger, "server rejected: {e}");
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl fmt::Debug for SpiffeServerCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeServerCertVerifier")
            .field("policy", self.anchors.verifier.policy())
            .finish_non_exhaustive()
    }
}

/// Server-side verifier of the client's certificate. Client authentication
/// is always mandatory.
pub(crate) struct SpiffeClientCertVerifier {
    anchors: Anchors,
    webpki: Memo<RootCertStore, Arc<dyn ClientCertVerifier>>,
    provider: Arc<CryptoProvider>,
    logger: Logger,
}

impl SpiffeClientCertVerifier {
    pub(crate) fn new(verifier: PeerVerifier, provider: Arc<CryptoProvider>, logger: Logger) -> Self {
        Self {
            anchors: Anchors::new(verifier),
            webpki: Memo::new(),
            provider,
            logger,
        }
    }

    fn verify(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<SpiffeId, rustls::Error> {
        let (peer, bundle) = self.anchors.for_leaf(end_entity).map_err(other_err)?;
        let roots = self.anchors.roots(&bundle).map_err(other_err)?;

        let chain = self
            .webpki
            .get_or_try_init(&roots, |_| {
                WebPkiClientVerifier::builder_with_provider(
                    Arc::clone(&roots),
                    Arc::clone(&self.provider),
                )
                .build()
                .map_err(TlsError::VerifierBuilder)
            })
            .map_err(other_err)?;
        chain.verify_client_cert(end_entity, intermediates, now)?;

        self.anchors.authorize(&peer).map_err(other_err)?;
        Ok(peer)
    }
}

impl ClientCertVerifier for SpiffeClientCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    // Peers may belong to any federated trust domain.
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match self.verify(end_entity, intermediates, now) {
            Ok(peer) => {
                debug!(self.logger, "client authenticated: peer={peer}");
                Ok(ClientCertVerified::assertion())
            }
            Err(e) => {
                warn!(self.logger, "client rejected: {e}");
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl fmt::Debug for SpiffeClientCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeClientCertVerifier")
            .field("policy", self.anchors.verifier.policy())
            .finish_non_exhaustive()
    }
}

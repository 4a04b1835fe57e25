use std::fmt;
use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;

use crate::observability::Logger;
use crate::prelude::error;
use crate::source::IdentitySource;
use crate::svid::X509Svid;

use super::material::{certified_key, Memo};

/// Presents whatever SVID the source holds at handshake time.
pub(crate) struct SvidResolver {
    source: IdentitySource,
    provider: Arc<CryptoProvider>,
    keys: Memo<X509Svid, Arc<CertifiedKey>>,
    logger: Logger,
}

impl SvidResolver {
    pub(crate) fn new(source: IdentitySource, provider: Arc<CryptoProvider>, logger: Logger) -> Self {
        Self {
            source,
            provider,
            keys: Memo::new(),
            logger,
        }
    }

    fn current(&self) -> Option<Arc<CertifiedKey>> {
        let svid = match self.source.current_identity() {
            Ok(svid) => svid,
            Err(e) => {
                error!(self.logger, "no SVID to present: {e}");
                return None;
            }
        };

        match self
            .keys
            .get_or_try_init(&svid, |svid| certified_key(svid, &self.provider))
        {
            Ok(key) => Some(key),
            Err(e) => {
                error!(
                    self.logger,
                    "cannot present SVID {}: {e}",
                    svid.spiffe_id()
                );
                None
            }
        }
    }
}

impl ResolvesClientCert for SvidResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.current()
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for SvidResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

impl fmt::Debug for SvidResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SvidResolver")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

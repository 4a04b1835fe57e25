//! Conversions from SVIDs and bundles to rustls material, and a one-slot
//! cache keyed on the snapshot they were built from.

use std::sync::{Arc, Mutex};

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;

use crate::bundle::X509Bundle;
use crate::svid::X509Svid;

use super::TlsError;

/// Builds the rustls signing material for `svid`.
pub(crate) fn certified_key(
    svid: &X509Svid,
    provider: &CryptoProvider,
) -> Result<Arc<CertifiedKey>, TlsError> {
    let chain = svid
        .cert_chain()
        .iter()
        .map(|c| CertificateDer::from(c.as_bytes().to_vec()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        svid.private_key().as_bytes().to_vec(),
    ));

    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(TlsError::CertifiedKey)?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Trust anchors of `bundle` as a rustls root store.
pub(crate) fn root_store(bundle: &X509Bundle) -> Result<Arc<RootCertStore>, TlsError> {
    let mut store = RootCertStore::empty();
    store.add_parsable_certificates(
        bundle
            .authorities()
            .iter()
            .map(|c| CertificateDer::from(c.as_bytes().to_vec())),
    );

    if store.is_empty() {
        return Err(TlsError::EmptyBundle(bundle.trust_domain().clone()));
    }
    Ok(Arc::new(store))
}

/// Remembers the value derived from the last snapshot it was asked about.
///
/// Snapshots are compared by pointer: the identity source swaps in a new
/// `Arc` on every rotation, so a pointer match means nothing changed.
pub(crate) struct Memo<K, V> {
    slot: Mutex<Option<(Arc<K>, V)>>,
}

impl<K, V: Clone> Memo<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn get_or_try_init<E>(
        &self,
        key: &Arc<K>,
        build: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<V, E> {
        if let Ok(slot) = self.slot.lock() {
            if let Some((cached, value)) = slot.as_ref() {
                if Arc::ptr_eq(cached, key) {
                    return Ok(value.clone());
                }
            }
        }

        let value = build(key)?;
        // A poisoned slot is rebuilt on every call.
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some((Arc::clone(key), value.clone()));
        }
        Ok(value)
    }
}

//! JWT bundles: per trust domain JWKS used to verify JWT-SVID signatures.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::BundleSource;
use crate::spiffe_id::TrustDomain;

/// Malformed JWKS document or key.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JwtBundleError {
    /// A key has no `kid`.
    #[error("missing key ID")]
    MissingKeyId,

    /// Not a JWKS document.
    #[error("cannot deserialize json jwk set")]
    Deserialize(#[from] serde_json::Error),
}

/// One JWT signing key, kept as its JWK JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtAuthority {
    kid: Arc<str>,
    jwk_json: Arc<[u8]>,
}

impl JwtAuthority {
    /// Reads a single JWK object; `kid` is required.
    ///
    /// # Errors
    ///
    /// Returns [`JwtBundleError`] if the JSON is invalid or has no string `kid`.
    pub fn from_jwk_json(jwk_json: &[u8]) -> Result<Self, JwtBundleError> {
        let value: Value = serde_json::from_slice(jwk_json)?;
        Self::from_value(&value)
    }

    fn from_value(value: &Value) -> Result<Self, JwtBundleError> {
        let kid = value
            .get("kid")
            .and_then(Value::as_str)
            .ok_or(JwtBundleError::MissingKeyId)?;
        Ok(Self {
            kid: Arc::from(kid),
            jwk_json: Arc::from(serde_json::to_vec(value)?),
        })
    }

    /// `kid`.
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    /// JWK JSON.
    pub fn jwk_json(&self) -> &[u8] {
        &self.jwk_json
    }
}

#[derive(Deserialize)]
struct Jwks {
    keys: Vec<Value>,
}

/// JWT signing keys trusted for one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtBundle {
    trust_domain: TrustDomain,
    jwt_authorities: HashMap<String, Arc<JwtAuthority>>,
}

impl JwtBundle {
    /// Empty bundle.
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            jwt_authorities: HashMap::new(),
        }
    }

    /// Parses an RFC 7517 JWKS document.
    ///
    /// # Errors
    ///
    /// Returns [`JwtBundleError`] if the document has no `keys` array or a
    /// key lacks `kid`.
    pub fn from_jwt_authorities(trust_domain: TrustDomain, jwks: &[u8]) -> Result<Self, JwtBundleError> {
        let jwks: Jwks = serde_json::from_slice(jwks)?;
        let mut bundle = Self::new(trust_domain);
        for key in &jwks.keys {
            bundle.add_jwt_authority(JwtAuthority::from_value(key)?);
        }
        Ok(bundle)
    }

    /// Owning trust domain.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Key with `kid == key_id`.
    pub fn find_jwt_authority(&self, key_id: &str) -> Option<&Arc<JwtAuthority>> {
        self.jwt_authorities.get(key_id)
    }

    /// Inserts or replaces a key.
    pub fn add_jwt_authority(&mut self, authority: JwtAuthority) {
        self.jwt_authorities
            .insert(authority.key_id().to_owned(), Arc::new(authority));
    }

    /// All keys.
    pub fn jwt_authorities(&self) -> impl Iterator<Item = &Arc<JwtAuthority>> {
        self.jwt_authorities.values()
    }
}

/// JWT bundles keyed by trust domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JwtBundleSet {
    bundles: BTreeMap<TrustDomain, Arc<JwtBundle>>,
}

impl JwtBundleSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the bundle for its trust domain.
    pub fn add_bundle(&mut self, bundle: JwtBundle) {
        self.bundles
            .insert(bundle.trust_domain().clone(), Arc::new(bundle));
    }

    /// Bundle for `trust_domain`.
    pub fn get(&self, trust_domain: &TrustDomain) -> Option<&Arc<JwtBundle>> {
        self.bundles.get(trust_domain)
    }

    /// Number of trust domains.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// `true` when no bundle is present.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// All bundles ordered by trust domain.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<JwtBundle>> {
        self.bundles.values()
    }
}

impl BundleSource for JwtBundleSet {
    type Item = JwtBundle;
    type Error = Infallible;

    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error> {
        Ok(self.get(trust_domain).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JWKS: &str = r#"{
        "keys": [
            {"kty": "EC", "kid": "C6vs25welZOx6WksNYfbMfiw9l96pMnD", "crv": "P-256",
             "x": "ngLYQnlfF6GsojUwqtcEE3WgTNG2RUlsGhK73RNEl5k",
             "y": "tKbiDSUSsQ3F1P7wteeHNXIcU-cx6CgSbroeQrQHTLM"},
            {"kty": "EC", "kid": "gHTCunJbefYtnZnTctd84xeRWyMrEsWD", "crv": "P-256",
             "x": "7MGOl06DP9df2u8oHY6lqYFIoQWzCj9UYlp-MFeEYeY",
             "y": "PSLLy5Pg0_kNGFFXq_eeq9kYcGDM3MPHJ6ncteNOr6w"}
        ],
        "spiffe_refresh_hint": 300
    }"#;

    #[test]
    fn parses_jwks_keys_by_kid() {
        let td = TrustDomain::new("example.org").unwrap();
        let bundle = JwtBundle::from_jwt_authorities(td.clone(), JWKS.as_bytes()).unwrap();
        assert_eq!(bundle.trust_domain(), &td);
        assert_eq!(bundle.jwt_authorities().count(), 2);
        assert!(bundle.find_jwt_authority("C6vs25welZOx6WksNYfbMfiw9l96pMnD").is_some());
        assert!(bundle.find_jwt_authority("unknown").is_none());
    }

    #[test]
    fn rejects_key_without_kid() {
        let td = TrustDomain::new("example.org").unwrap();
        let err = JwtBundle::from_jwt_authorities(td, br#"{"keys":[{"kty":"EC"}]}"#).unwrap_err();
        assert!(matches!(err, JwtBundleError::MissingKeyId));
    }

    #[test]
    fn rejects_document_without_keys() {
        let td = TrustDomain::new("example.org").unwrap();
        let err = JwtBundle::from_jwt_authorities(td, br#"{"kty":"EC"}"#).unwrap_err();
        assert!(matches!(err, JwtBundleError::Deserialize(_)));
    }

    #[test]
    fn set_replaces_bundle_for_same_domain() {
        let td = TrustDomain::new("example.org").unwrap();
        let mut set = JwtBundleSet::new();
        set.add_bundle(JwtBundle::from_jwt_authorities(td.clone(), JWKS.as_bytes()).unwrap());
        set.add_bundle(JwtBundle::new(td.clone()));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&td).unwrap().jwt_authorities().count(), 0);
    }
}

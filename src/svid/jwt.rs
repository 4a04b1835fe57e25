//! JWT-SVIDs.
//!
//! Tokens fetched from the agent are trusted by construction and parsed with
//! [`JwtSvid::parse_insecure`]. Tokens presented by a peer go through
//! [`JwtSvid::parse_and_validate`], which checks signature, expiry and
//! audience against a [`JwtBundleSet`].

use std::fmt;
use std::str::FromStr;

use base64ct::{Base64UrlUnpadded, Encoding as _};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{DecodingKey, Validation};
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use zeroize::Zeroize;

use crate::bundle::jwt::JwtBundleSet;
use crate::error::ValidationFailure;
use crate::spiffe_id::{SpiffeId, SpiffeIdError, TrustDomain};

const MAX_AUDIENCE_COUNT: usize = 32;
const MAX_SEGMENT_SIZE: usize = 64 * 1024;

/// Signature algorithms allowed by the JWT-SVID profile.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum JwtAlg {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    PS256,
    PS384,
    PS512,
}

impl JwtAlg {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "RS256" => Self::RS256,
            "RS384" => Self::RS384,
            "RS512" => Self::RS512,
            "ES256" => Self::ES256,
            "ES384" => Self::ES384,
            "PS256" => Self::PS256,
            "PS384" => Self::PS384,
            "PS512" => Self::PS512,
            _ => return None,
        })
    }

    const fn to_jsonwebtoken(self) -> jsonwebtoken::Algorithm {
        use jsonwebtoken::Algorithm as A;
        match self {
            Self::RS256 => A::RS256,
            Self::RS384 => A::RS384,
            Self::RS512 => A::RS512,
            Self::ES256 => A::ES256,
            Self::ES384 => A::ES384,
            Self::PS256 => A::PS256,
            Self::PS384 => A::PS384,
            Self::PS512 => A::PS512,
        }
    }
}

/// Reasons a token is not an acceptable JWT-SVID.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JwtSvidError {
    /// `sub` is not a SPIFFE ID.
    #[error("invalid spiffe_id in token 'sub' claim")]
    InvalidSubject(#[from] SpiffeIdError),

    /// No `kid` header.
    #[error("token header 'kid' not found")]
    MissingKeyId,

    /// `typ` header other than `JWT` or `JOSE`.
    #[error("token header 'typ' should be 'JWT' or 'JOSE'")]
    InvalidTyp,

    /// `exp` out of range.
    #[error("invalid token expiration ('exp') claim")]
    InvalidExpiration,

    /// `alg` outside the JWT-SVID profile.
    #[error("algorithm in 'alg' header is not supported")]
    UnsupportedAlgorithm,

    /// Not `header.claims.signature`.
    #[error("malformed jwt token: expected 3 dot-separated parts")]
    InvalidJwtFormat,

    /// Header or claims are not base64url.
    #[error("malformed jwt token: invalid base64url encoding")]
    InvalidBase64,

    /// Header or claims are not the expected JSON.
    #[error("malformed jwt token: invalid json")]
    InvalidJson(#[source] serde_json::Error),

    /// No bundle for the subject's trust domain.
    #[error("cannot find JWT bundle for trust domain: {0}")]
    BundleNotFound(TrustDomain),

    /// Bundle has no key with the token's `kid`.
    #[error("cannot find JWT authority for key_id: {0}")]
    AuthorityNotFound(String),

    /// The bundle's key is not a usable JWK.
    #[error("cannot parse authority JWK")]
    InvalidAuthorityJwk(#[source] serde_json::Error),

    /// Signature or claim check failed.
    #[error("cannot validate token")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

impl JwtSvidError {
    /// Classifies the failure for [`crate::ValidationError`].
    pub fn validation_failure(&self) -> ValidationFailure {
        match self {
            Self::InvalidToken(e) => match e.kind() {
                ErrorKind::ExpiredSignature => ValidationFailure::Expired,
                ErrorKind::InvalidAudience => ValidationFailure::Audience,
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidEcdsaKey
                | ErrorKind::InvalidRsaKey(_)
                | ErrorKind::InvalidKeyFormat
                | ErrorKind::InvalidAlgorithm => ValidationFailure::Signature,
                _ => ValidationFailure::Malformed,
            },
            Self::BundleNotFound(_) | Self::AuthorityNotFound(_) | Self::InvalidAuthorityJwk(_) => {
                ValidationFailure::Signature
            }
            _ => ValidationFailure::Malformed,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
struct Token(String);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    typ: Option<String>,
    alg: String,
}

/// The registered claims a JWT-SVID must carry.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    sub: String,
    #[serde(deserialize_with = "string_or_seq_string")]
    aud: Vec<String>,
    exp: i64,
}

impl Claims {
    /// Builds a claim set.
    pub fn new(sub: impl Into<String>, aud: Vec<String>, exp: i64) -> Self {
        Self {
            sub: sub.into(),
            aud,
            exp,
        }
    }

    /// `sub`.
    pub fn sub(&self) -> &str {
        &self.sub
    }

    /// `aud`.
    pub fn aud(&self) -> &[String] {
        &self.aud
    }

    /// `exp`, seconds since the epoch.
    pub fn exp(&self) -> i64 {
        self.exp
    }
}

/// A JWT-SVID. The serialized token is zeroized on drop and never printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtSvid {
    spiffe_id: SpiffeId,
    hint: Option<String>,
    expiry: OffsetDateTime,
    claims: Claims,
    kid: String,
    alg: JwtAlg,
    token: Token,
}

impl JwtSvid {
    /// Parses the token structure without checking the signature.
    ///
    /// # Errors
    ///
    /// Returns a [`JwtSvidError`] if the token is not a structurally valid
    /// JWT-SVID.
    pub fn parse_insecure(token: &str) -> Result<Self, JwtSvidError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(JwtSvidError::InvalidJwtFormat);
        };

        let header: Header =
            serde_json::from_slice(&decode_segment(header_b64)?).map_err(JwtSvidError::InvalidJson)?;
        let claims: Claims =
            serde_json::from_slice(&decode_segment(claims_b64)?).map_err(JwtSvidError::InvalidJson)?;

        if !matches!(header.typ.as_deref(), None | Some("JWT" | "JOSE")) {
            return Err(JwtSvidError::InvalidTyp);
        }
        let alg = JwtAlg::parse(&header.alg).ok_or(JwtSvidError::UnsupportedAlgorithm)?;
        let kid = header.kid.ok_or(JwtSvidError::MissingKeyId)?;
        let spiffe_id = SpiffeId::new(&claims.sub)?;
        let expiry = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| JwtSvidError::InvalidExpiration)?;

        Ok(Self {
            spiffe_id,
            hint: None,
            expiry,
            claims,
            kid,
            alg,
            token: Token(token.to_owned()),
        })
    }

    /// Parses `token` and verifies it against `bundles`.
    ///
    /// The signature must verify with the key named by `kid` in the bundle
    /// of the subject's trust domain, `exp` must be in the future (no
    /// leeway) and `expected_audience` must be one of the `aud` values.
    ///
    /// # Errors
    ///
    /// Returns a [`JwtSvidError`]; [`JwtSvidError::validation_failure`]
    /// tells which check failed.
    pub fn parse_and_validate(
        token: &str,
        bundles: &JwtBundleSet,
        expected_audience: &str,
    ) -> Result<Self, JwtSvidError> {
        let untrusted = Self::parse_insecure(token)?;
        let trust_domain = untrusted.spiffe_id.trust_domain();

        let bundle = bundles
            .get(trust_domain)
            .ok_or_else(|| JwtSvidError::BundleNotFound(trust_domain.clone()))?;
        let authority = bundle
            .find_jwt_authority(&untrusted.kid)
            .ok_or_else(|| JwtSvidError::AuthorityNotFound(untrusted.kid.clone()))?;

        let jwk: Jwk =
            serde_json::from_slice(authority.jwk_json()).map_err(JwtSvidError::InvalidAuthorityJwk)?;
        let key = DecodingKey::from_jwk(&jwk)?;

        let mut validation = Validation::new(untrusted.alg.to_jsonwebtoken());
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_audience(&[expected_audience]);

        jsonwebtoken::decode::<Claims>(token, &key, &validation)?;

        Ok(untrusted)
    }

    /// Attaches the agent-supplied hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        self.hint = (!hint.is_empty()).then_some(hint);
        self
    }

    /// Serialized token.
    pub fn token(&self) -> &str {
        &self.token.0
    }

    /// Subject identity.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// `aud` values.
    pub fn audience(&self) -> &[String] {
        &self.claims.aud
    }

    /// Expiry instant.
    pub fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    /// `kid` header.
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    /// Signature algorithm.
    pub fn alg(&self) -> JwtAlg {
        self.alg
    }

    /// Claims. Untrusted unless the token came from the agent or from
    /// [`JwtSvid::parse_and_validate`].
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Agent-supplied hint, if any.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

impl FromStr for JwtSvid {
    type Err = JwtSvidError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::parse_insecure(token)
    }
}

fn string_or_seq_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec;

    impl<'de> de::Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("string or sequence of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_owned()])
        }

        fn visit_seq<S: de::SeqAccess<'de>>(self, mut seq: S) -> Result<Self::Value, S::Error> {
            let mut out = Vec::new();
            while let Some(v) = seq.next_element::<String>()? {
                if out.len() >= MAX_AUDIENCE_COUNT {
                    return Err(de::Error::custom(format!(
                        "'aud' claim has too many entries (max {MAX_AUDIENCE_COUNT})"
                    )));
                }
                out.push(v);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}

fn decode_segment(input: &str) -> Result<Vec<u8>, JwtSvidError> {
    if input.len() > MAX_SEGMENT_SIZE * 4 / 3 + 4 {
        return Err(JwtSvidError::InvalidBase64);
    }
    Base64UrlUnpadded::decode_vec(input).map_err(|_| JwtSvidError::InvalidBase64)
}

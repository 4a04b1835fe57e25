//! Workload identities: SPIFFE IDs and the trust domains that scope them.
//!
//! A [`SpiffeId`] has the form `spiffe://<trust-domain>/<path>`. Parsing is
//! strict: anything that is not a conformant identity is rejected with a
//! [`SpiffeIdError`] and no value is produced.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const SCHEME_PREFIX: &str = "spiffe://";

const VALID_TRUST_DOMAIN_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-._";
const VALID_PATH_SEGMENT_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._";

/// Identity of a workload, as presented in X.509 and JWT SVIDs.
///
/// Immutable once parsed. Equality is exact: two identities are equal only
/// when both trust domain and path match byte for byte.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

/// The name used throughout the authorization layer for a peer's identity.
pub type WorkloadIdentity = SpiffeId;

/// Authority component of a [`SpiffeId`]; the unit of default trust.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrustDomain {
    name: String,
}

/// Reasons a string is not a valid SPIFFE ID or trust domain.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum SpiffeIdError {
    /// Input was empty.
    #[error("cannot be empty")]
    Empty,

    /// Input does not start with `spiffe://`.
    #[error("scheme is missing or invalid")]
    WrongScheme,

    /// Nothing between the scheme and the path.
    #[error("trust domain is missing")]
    MissingTrustDomain,

    /// Trust domain uses characters outside `[a-z0-9.-_]`.
    #[error(
        "trust domain characters are limited to lowercase letters, numbers, dots, dashes, and \
         underscores"
    )]
    BadTrustDomainChar,

    /// Path segment uses characters outside `[a-zA-Z0-9.-_]`.
    #[error(
        "path segment characters are limited to letters, numbers, dots, dashes, and underscores"
    )]
    BadPathSegmentChar,

    /// Path contains `//`.
    #[error("path cannot contain empty segments")]
    EmptySegment,

    /// Path contains `/.` or `/..` segments.
    #[error("path cannot contain dot segments")]
    DotSegment,

    /// Path ends with `/`.
    #[error("path cannot have a trailing slash")]
    TrailingSlash,
}

impl SpiffeId {
    /// Parses a SPIFFE ID such as `spiffe://example.org/ns/payments/sa/api`.
    ///
    /// # Errors
    ///
    /// Returns the first [`SpiffeIdError`] found, checking scheme, then trust
    /// domain, then path.
    ///
    /// # Examples
    ///
    /// ```
    /// use spire_authz::SpiffeId;
    ///
    /// let id = SpiffeId::new("spiffe://example.org/payments/api").unwrap();
    /// assert_eq!("example.org", id.trust_domain().as_str());
    /// assert_eq!("/payments/api", id.path());
    /// ```
    pub fn new(id: &str) -> Result<Self, SpiffeIdError> {
        if id.is_empty() {
            return Err(SpiffeIdError::Empty);
        }

        let rest = id
            .strip_prefix(SCHEME_PREFIX)
            .ok_or(SpiffeIdError::WrongScheme)?;

        let (td, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };

        let trust_domain = TrustDomain::from_name(td)?;
        if !path.is_empty() {
            validate_path(path)?;
        }

        Ok(Self {
            trust_domain,
            path: path.to_owned(),
        })
    }

    /// Builds an identity in `trust_domain` from individual path segments.
    ///
    /// Segments must not contain `/`.
    ///
    /// # Errors
    ///
    /// Returns a [`SpiffeIdError`] if any segment is not a valid path segment.
    pub fn from_segments(trust_domain: TrustDomain, segments: &[&str]) -> Result<Self, SpiffeIdError> {
        let mut path = String::new();
        for segment in segments {
            validate_segment(segment, true)?;
            path.push('/');
            path.push_str(segment);
        }
        Ok(Self { trust_domain, path })
    }

    /// Trust domain this identity belongs to.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Path component, empty or starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns `true` if this identity belongs to `trust_domain`.
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        &self.trust_domain == trust_domain
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}{}", self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = SpiffeIdError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        Self::new(id)
    }
}

impl TryFrom<&str> for SpiffeId {
    type Error = SpiffeIdError;

    fn try_from(id: &str) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = SpiffeIdError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(&id)
    }
}

impl TrustDomain {
    /// Parses a trust domain from a bare name (`example.org`) or from any
    /// SPIFFE ID in it (`spiffe://example.org/svc`).
    ///
    /// # Errors
    ///
    /// Returns a [`SpiffeIdError`] if the input is neither.
    pub fn new(id_or_name: &str) -> Result<Self, SpiffeIdError> {
        if id_or_name.is_empty() {
            return Err(SpiffeIdError::MissingTrustDomain);
        }

        if id_or_name.contains(":/") {
            return SpiffeId::new(id_or_name).map(|id| id.trust_domain);
        }

        Self::from_name(id_or_name)
    }

    fn from_name(name: &str) -> Result<Self, SpiffeIdError> {
        if name.is_empty() {
            return Err(SpiffeIdError::MissingTrustDomain);
        }
        if !name.chars().all(|c| VALID_TRUST_DOMAIN_CHARS.contains(c)) {
            return Err(SpiffeIdError::BadTrustDomainChar);
        }
        Ok(Self {
            name: name.to_owned(),
        })
    }

    /// The trust domain name, e.g. `example.org`.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The trust domain as a SPIFFE ID string, e.g. `spiffe://example.org`.
    pub fn id_string(&self) -> String {
        format!("{SCHEME_PREFIX}{}", self.name)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for TrustDomain {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl FromStr for TrustDomain {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for TrustDomain {
    type Error = SpiffeIdError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = SpiffeIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

/// Checks that `path` is a conformant SPIFFE ID path (`/seg/seg...`).
pub fn validate_path(path: &str) -> Result<(), SpiffeIdError> {
    let segments = path.strip_prefix('/').ok_or(if path.is_empty() {
        SpiffeIdError::Empty
    } else {
        SpiffeIdError::BadPathSegmentChar
    })?;

    let mut iter = segments.split('/').peekable();
    while let Some(segment) = iter.next() {
        validate_segment(segment, iter.peek().is_none())?;
    }
    Ok(())
}

fn validate_segment(segment: &str, last: bool) -> Result<(), SpiffeIdError> {
    match segment {
        "" if last => Err(SpiffeIdError::TrailingSlash),
        "" => Err(SpiffeIdError::EmptySegment),
        "." | ".." => Err(SpiffeIdError::DotSegment),
        s if s.chars().all(|c| VALID_PATH_SEGMENT_CHARS.contains(c)) => Ok(()),
        _ => Err(SpiffeIdError::BadPathSegmentChar),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! parse_ok_tests {
        ($($name:ident: $input:expr => ($td:expr, $path:expr),)*) => {
        $(
            #[test]
            fn $name() {
                let id = SpiffeId::new($input).unwrap();
                assert_eq!(id.trust_domain().as_str(), $td);
                assert_eq!(id.path(), $path);
                assert_eq!(id.to_string(), $input);
            }
        )*
        }
    }

    parse_ok_tests! {
        parse_trust_domain_only: "spiffe://example.org" => ("example.org", ""),
        parse_single_segment: "spiffe://example.org/api" => ("example.org", "/api"),
        parse_k8s_style_path: "spiffe://prod.acme-co/ns/payments/sa/api" => ("prod.acme-co", "/ns/payments/sa/api"),
        parse_dots_inside_segment: "spiffe://example.org/a.b/..c/d..." => ("example.org", "/a.b/..c/d..."),
        parse_uppercase_path: "spiffe://example.org/Service_A" => ("example.org", "/Service_A"),
        parse_underscore_domain: "spiffe://trust_domain.test/x" => ("trust_domain.test", "/x"),
    }

    macro_rules! parse_err_tests {
        ($($name:ident: $input:expr => $err:expr,)*) => {
        $(
            #[test]
            fn $name() {
                assert_eq!(SpiffeId::new($input).unwrap_err(), $err);
            }
        )*
        }
    }

    parse_err_tests! {
        reject_empty: "" => SpiffeIdError::Empty,
        reject_http_scheme: "https://example.org/api" => SpiffeIdError::WrongScheme,
        reject_single_slash_scheme: "spiffe:/example.org/api" => SpiffeIdError::WrongScheme,
        reject_uppercase_scheme: "SPIFFE://example.org/api" => SpiffeIdError::WrongScheme,
        reject_missing_domain: "spiffe:///api" => SpiffeIdError::MissingTrustDomain,
        reject_bare_scheme: "spiffe://" => SpiffeIdError::MissingTrustDomain,
        reject_port: "spiffe://example.org:8443/api" => SpiffeIdError::BadTrustDomainChar,
        reject_userinfo: "spiffe://user@example.org/api" => SpiffeIdError::BadTrustDomainChar,
        reject_uppercase_domain: "spiffe://Example.org/api" => SpiffeIdError::BadTrustDomainChar,
        reject_trailing_slash: "spiffe://example.org/" => SpiffeIdError::TrailingSlash,
        reject_trailing_slash_after_segment: "spiffe://example.org/api/" => SpiffeIdError::TrailingSlash,
        reject_empty_segment: "spiffe://example.org//api" => SpiffeIdError::EmptySegment,
        reject_dot_segment: "spiffe://example.org/./api" => SpiffeIdError::DotSegment,
        reject_dot_dot_segment: "spiffe://example.org/api/.." => SpiffeIdError::DotSegment,
        reject_query: "spiffe://example.org/api?x=1" => SpiffeIdError::BadPathSegmentChar,
        reject_fragment: "spiffe://example.org/api#frag" => SpiffeIdError::BadPathSegmentChar,
        reject_percent_encoding: "spiffe://example.org/a%20b" => SpiffeIdError::BadPathSegmentChar,
    }

    #[test]
    fn every_ascii_char_in_domain_and_path() {
        for b in 0u8..=127 {
            let c = b as char;
            let td_result = SpiffeId::new(&format!("spiffe://ex{c}ample/path"));
            if c == '/' {
                // splits into domain "ex" and path "/ample/path"
                assert!(td_result.is_ok());
            } else if VALID_TRUST_DOMAIN_CHARS.contains(c) {
                assert!(td_result.is_ok(), "char {c:?} should be valid in a trust domain");
            } else {
                assert_eq!(td_result.unwrap_err(), SpiffeIdError::BadTrustDomainChar, "char {c:?}");
            }

            let path_result = SpiffeId::new(&format!("spiffe://example/pa{c}th"));
            if c == '/' || VALID_PATH_SEGMENT_CHARS.contains(c) {
                assert!(path_result.is_ok(), "char {c:?} should be valid in a path");
            } else {
                assert_eq!(path_result.unwrap_err(), SpiffeIdError::BadPathSegmentChar, "char {c:?}");
            }
        }
    }

    #[test]
    fn round_trip_preserves_string() {
        let inputs = [
            "spiffe://example.org",
            "spiffe://example.org/a",
            "spiffe://a-b.c_d/x/Y/z-0/...a",
            "spiffe://1.2.3.4/workload",
        ];
        for input in inputs {
            let parsed: SpiffeId = input.parse().unwrap();
            assert_eq!(parsed.to_string(), input);
            assert_eq!(SpiffeId::new(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn from_segments_builds_path() {
        let td = TrustDomain::new("example.org").unwrap();
        let id = SpiffeId::from_segments(td, &["ns", "payments", "sa", "api"]).unwrap();
        assert_eq!(id.to_string(), "spiffe://example.org/ns/payments/sa/api");
    }

    #[test]
    fn from_segments_rejects_separator_and_dots() {
        let td = TrustDomain::new("example.org").unwrap();
        assert_eq!(
            SpiffeId::from_segments(td.clone(), &["a/b"]).unwrap_err(),
            SpiffeIdError::BadPathSegmentChar
        );
        assert_eq!(
            SpiffeId::from_segments(td.clone(), &[".."]).unwrap_err(),
            SpiffeIdError::DotSegment
        );
        assert_eq!(
            SpiffeId::from_segments(td, &[""]).unwrap_err(),
            SpiffeIdError::TrailingSlash
        );
    }

    #[test]
    fn trust_domain_from_name_or_id() {
        let from_name = TrustDomain::new("example.org").unwrap();
        let from_id = TrustDomain::new("spiffe://example.org/some/workload").unwrap();
        assert_eq!(from_name, from_id);
        assert_eq!(from_name.id_string(), "spiffe://example.org");
        assert_eq!(
            TrustDomain::new("").unwrap_err(),
            SpiffeIdError::MissingTrustDomain
        );
        assert_eq!(
            TrustDomain::new("Example.org").unwrap_err(),
            SpiffeIdError::BadTrustDomainChar
        );
        assert_eq!(
            TrustDomain::new("spiffe://example.org/").unwrap_err(),
            SpiffeIdError::TrailingSlash
        );
    }

    #[test]
    fn membership_compares_trust_domain_only() {
        let id = SpiffeId::new("spiffe://example.org/api").unwrap();
        assert!(id.is_member_of(&TrustDomain::new("example.org").unwrap()));
        assert!(!id.is_member_of(&TrustDomain::new("example.com").unwrap()));
    }
}

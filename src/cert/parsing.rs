use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::nom;
use x509_parser::oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME;

use super::{Certificate, CertificateError};
use crate::spiffe_id::SpiffeId;

const SPIFFE_URI_PREFIX: &str = "spiffe://";
const MAX_URI_SAN_ENTRIES: usize = 32;
const MAX_URI_LENGTH: usize = 2048;

/// Upper bound on certificates in an SVID chain. Bundles are not bounded.
pub(crate) const MAX_CHAIN_LENGTH: usize = 16;

pub(crate) fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, CertificateError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(nom_to_cert_error)
}

fn nom_to_cert_error(e: nom::Err<X509Error>) -> CertificateError {
    match e {
        nom::Err::Incomplete(_) => CertificateError::ParseX509Certificate(X509Error::InvalidCertificate),
        nom::Err::Error(e) | nom::Err::Failure(e) => CertificateError::ParseX509Certificate(e),
    }
}

/// Splits concatenated DER certificates. `max` bounds the count when set.
pub(crate) fn split_der_chain(
    der: &[u8],
    max: Option<usize>,
) -> Result<Vec<Certificate>, CertificateError> {
    let mut rest = der;
    let mut certs = Vec::new();

    while !rest.is_empty() {
        if let Some(max) = max {
            if certs.len() >= max {
                return Err(CertificateError::TooManyCertificates { max });
            }
        }

        let (remaining, _) = x509_parser::parse_x509_certificate(rest).map_err(nom_to_cert_error)?;
        let len = rest.len() - remaining.len();
        certs.push(Certificate(rest[..len].to_vec()));
        rest = remaining;
    }

    Ok(certs)
}

/// Exactly one `spiffe://` URI SAN, parsed.
pub(crate) fn single_spiffe_id(cert: &X509Certificate<'_>) -> Result<SpiffeId, CertificateError> {
    let Some(ext) = cert.tbs_certificate.get_extension_unique(&OID_X509_EXT_SUBJECT_ALT_NAME)? else {
        return Err(CertificateError::MissingX509Extension(OID_X509_EXT_SUBJECT_ALT_NAME));
    };
    let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() else {
        return Err(CertificateError::ParseX509Certificate(X509Error::InvalidExtensions));
    };

    let mut found: Option<SpiffeId> = None;
    let uris = san.general_names.iter().filter_map(|name| match name {
        GeneralName::URI(uri) => Some(*uri),
        _ => None,
    });

    for (n, uri) in uris.enumerate() {
        if n >= MAX_URI_SAN_ENTRIES {
            return Err(CertificateError::TooManyUriSanEntries {
                max: MAX_URI_SAN_ENTRIES,
            });
        }
        if uri.len() > MAX_URI_LENGTH || !uri.starts_with(SPIFFE_URI_PREFIX) {
            continue;
        }
        if found.is_some() {
            return Err(CertificateError::MultipleSpiffeIds);
        }
        found = Some(SpiffeId::new(uri)?);
    }

    found.ok_or(CertificateError::MissingSpiffeId)
}

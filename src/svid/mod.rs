//! X.509 and JWT SVIDs: the credentials that bind a workload identity to
//! key material or to a signed token.

pub mod jwt;
pub mod x509;

pub use jwt::{Claims, JwtAlg, JwtSvid, JwtSvidError};
pub use x509::{X509Svid, X509SvidError};

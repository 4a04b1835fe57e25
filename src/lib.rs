#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Workload identity for services running under a SPIRE agent.
//!
//! The crate turns the agent's [SPIFFE Workload API] into three ready-made
//! artifacts:
//!
//! - an mTLS client ([`ClientAuth`]) and an mTLS server configuration
//!   ([`ServerAuth`]), both backed by a self-rotating [`IdentitySource`] and
//!   an [`AuthorizationPolicy`] chosen once from configuration;
//! - JWT-SVIDs for the workload's own identity ([`JwtWorkflow`]) and their
//!   validation ([`validate`]);
//! - JWT-SVIDs fetched on behalf of another workload through the SPIRE
//!   Delegated Identity API ([`DelegatedAuth`]).
//!
//! Every call that talks to the agent takes a [`CallContext`] carrying an
//! optional deadline and a cancellation token. Diagnostics go through an
//! explicitly passed [`Logger`].
//!
//! # Examples
//!
//! ```no_run
//! use spire_authz::{CallContext, ClientAuth, ClientAuthConfig, Logger};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), spire_authz::Error> {
//! let config = ClientAuthConfig {
//!     server_svid: Some("spiffe://example.org/payments/api".to_owned()),
//!     ..ClientAuthConfig::default()
//! };
//! let ctx = CallContext::with_timeout(Duration::from_secs(5));
//!
//! let client = ClientAuth::new(config, Logger::log_crate()).tls_client(&ctx).await?;
//! let (stream, server) = client.connect(&ctx, "10.0.0.7:8443", "payments").await?;
//! println!("connected to {server}");
//! # drop(stream);
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! [SPIFFE Workload API]: https://github.com/spiffe/spiffe/blob/main/standards/SPIFFE_Workload_API.md

pub mod allowlist;
pub mod bundle;
pub mod cert;
pub mod config;
pub mod context;
pub mod delegated;
pub mod endpoint;
pub mod error;
pub mod jwt;
pub mod observability;
pub mod policy;
pub mod proto;
pub mod source;
pub mod spiffe_id;
pub mod svid;
pub mod tls;
pub mod workload_api;

mod prelude;
mod transport;

pub use crate::{
    allowlist::AllowList,
    bundle::{BundleSource, JwtBundle, JwtBundleSet, X509Bundle, X509BundleSet},
    config::{AuthConfig, ClientAuthConfig, DelegatedAuthConfig, ServerAuthConfig},
    context::CallContext,
    delegated::{DelegatedAuth, DelegatedJwt, Selector},
    endpoint::{resolve, Endpoint, ResolvedEndpoint},
    error::{Error, Result, ValidationError, ValidationFailure},
    jwt::{validate, validate_credential, JwtCredentials, JwtWorkflow},
    observability::{Logger, MemorySink},
    policy::{
        build_verifier, select_policy, AuthorizationPolicy, PeerConfig, PeerVerifier, Role,
    },
    source::IdentitySource,
    spiffe_id::{SpiffeId, TrustDomain, WorkloadIdentity},
    svid::{JwtSvid, X509Svid},
    tls::{peer_identity, ClientAuth, MtlsClient, ServerAuth, ServerTls},
    workload_api::{WorkloadApiClient, X509Context},
};

//! Client side of the SPIFFE Workload API served by the local agent.

mod client;
mod error;
mod x509_context;

pub use client::{WorkloadApiClient, X509ContextStream};
pub use error::WorkloadApiError;
pub use x509_context::X509Context;

pub use crate::transport::TransportError;

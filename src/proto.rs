//! Generated wire types for the SPIFFE Workload API and the SPIRE Delegated
//! Identity API.
//!
//! Clients and servers are both generated, so test doubles of the agent and
//! the broker can be built from the same definitions.

#![allow(missing_docs, clippy::all, clippy::pedantic)]

/// SPIFFE Workload API. The proto declares no package.
pub mod workload {
    tonic::include_proto!("_");
}

/// SPIRE agent APIs and shared types.
pub mod spire {
    pub mod api {
        pub mod types {
            tonic::include_proto!("spire.api.types");
        }

        pub mod agent {
            pub mod delegatedidentity {
                pub mod v1 {
                    tonic::include_proto!("spire.api.agent.delegatedidentity.v1");
                }
            }
        }
    }
}

//! gRPC channels to the agent and the broker.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use thiserror::Error;
#[cfg(unix)]
use tokio::net::UnixStream;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tower::service_fn;

use crate::endpoint::Endpoint;

// tonic needs an authority even when the connector ignores it.
const PLACEHOLDER_URI: &str = "http://[::]:50051";

const WORKLOAD_HEADER_KEY: &str = "workload.spiffe.io";
const WORKLOAD_HEADER_VALUE: &str = "true";

/// Failures establishing a channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Unix sockets on a platform without them.
    #[error("unsupported endpoint transport: {scheme}")]
    UnsupportedEndpointTransport {
        /// Scheme that cannot be served.
        scheme: &'static str,
    },

    /// Connection or channel setup failed.
    #[error(transparent)]
    Tonic(#[from] tonic::transport::Error),
}

/// Opens a channel to `endpoint`. The connection is established eagerly.
pub(crate) async fn connect(endpoint: &Endpoint) -> Result<Channel, TransportError> {
    match endpoint {
        Endpoint::Unix(path) => connect_unix(path).await,
        Endpoint::Tcp { host, port } => connect_tcp(*host, *port).await,
    }
}

async fn connect_tcp(host: IpAddr, port: u16) -> Result<Channel, TransportError> {
    let uri = match host {
        IpAddr::V4(ip) => format!("http://{ip}:{port}"),
        IpAddr::V6(ip) => format!("http://[{ip}]:{port}"),
    };
    Ok(TonicEndpoint::try_from(uri)?.connect().await?)
}

#[cfg(unix)]
async fn connect_unix(path: &Path) -> Result<Channel, TransportError> {
    let path: Arc<PathBuf> = Arc::new(path.to_path_buf());

    let channel = TonicEndpoint::try_from(PLACEHOLDER_URI)?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = Arc::clone(&path);
            async move {
                let stream = UnixStream::connect(path.as_path()).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;

    Ok(channel)
}

#[cfg(not(unix))]
async fn connect_unix(_path: &Path) -> Result<Channel, TransportError> {
    Err(TransportError::UnsupportedEndpointTransport { scheme: "unix" })
}

/// Adds the `workload.spiffe.io: true` header the agent requires on every
/// Workload API call.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WorkloadHeader;

impl tonic::service::Interceptor for WorkloadHeader {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        request.metadata_mut().insert(
            AsciiMetadataKey::from_static(WORKLOAD_HEADER_KEY),
            AsciiMetadataValue::from_static(WORKLOAD_HEADER_VALUE),
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::service::Interceptor as _;

    #[test]
    fn workload_header_is_added() {
        let request = WorkloadHeader.call(tonic::Request::new(())).unwrap();
        assert_eq!(
            request.metadata().get(WORKLOAD_HEADER_KEY).unwrap(),
            WORKLOAD_HEADER_VALUE
        );
    }

    #[tokio::test]
    async fn missing_socket_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("absent.sock"));
        assert!(matches!(
            connect(&endpoint).await,
            Err(TransportError::Tonic(_))
        ));
    }
}

//! In-process SPIRE agent and delegated identity broker for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64ct::{Base64UrlUnpadded, Encoding};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePrivateKey as _;
use rand_core::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use spire_authz::proto::spire::api::agent::delegatedidentity::v1::delegated_identity_server::{
    DelegatedIdentity, DelegatedIdentityServer,
};
use spire_authz::proto::spire::api::agent::delegatedidentity::v1::{
    FetchJwtsviDsRequest, FetchJwtsviDsResponse,
};
use spire_authz::proto::spire::api::types::{Jwtsvid as BrokerJwtSvid, Selector, Spiffeid};
use spire_authz::proto::workload::spiffe_workload_api_server::{
    SpiffeWorkloadApi, SpiffeWorkloadApiServer,
};
use spire_authz::proto::workload::{
    JwtBundlesRequest, JwtBundlesResponse, Jwtsvid, JwtsvidRequest, JwtsvidResponse,
    X509BundlesRequest, X509BundlesResponse, X509svid, X509svidRequest, X509svidResponse,
};

pub const TRUST_DOMAIN: &str = "example.org";

/// Audience the mock agent refuses to issue for.
pub const FORBIDDEN_AUDIENCE: &str = "forbidden";

// ---- X.509 fixtures ----

/// A self-signed CA for one trust domain.
pub struct Ca {
    pub trust_domain: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// An issued X.509-SVID as the agent would deliver it.
#[derive(Clone)]
pub struct Svid {
    pub spiffe_id: String,
    pub chain_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl Ca {
    pub fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{trust_domain} CA"));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.subject_alt_names = vec![SanType::URI(
            format!("spiffe://{trust_domain}").try_into().unwrap(),
        )];
        let cert = params.self_signed(&key).unwrap();

        Self {
            trust_domain: trust_domain.to_owned(),
            cert,
            key,
        }
    }

    pub fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    /// Issues a leaf for `path` in this trust domain.
    pub fn issue(&self, path: &str) -> Svid {
        self.issue_with(path, |_| {})
    }

    /// Like [`Ca::issue`], with `configure` applied to the leaf parameters
    /// before signing.
    pub fn issue_with(&self, path: &str, configure: impl FnOnce(&mut CertificateParams)) -> Svid {
        let spiffe_id = format!("spiffe://{}{path}", self.trust_domain);
        let key = KeyPair::generate().unwrap();

        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "workload");
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = vec![SanType::URI(spiffe_id.clone().try_into().unwrap())];
        configure(&mut params);
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        Svid {
            spiffe_id,
            chain_der: cert.der().to_vec(),
            key_der: key.serialize_der(),
        }
    }
}

/// One Workload API update carrying `svid`, its CA and `federated` CAs.
pub fn x509_update(svid: &Svid, ca: &Ca, federated: &[&Ca]) -> X509svidResponse {
    X509svidResponse {
        svids: vec![X509svid {
            spiffe_id: svid.spiffe_id.clone(),
            x509_svid: svid.chain_der.clone().into(),
            x509_svid_key: svid.key_der.clone().into(),
            bundle: ca.der().into(),
            hint: String::new(),
        }],
        crl: Vec::new(),
        federated_bundles: federated
            .iter()
            .map(|ca| (format!("spiffe://{}", ca.trust_domain), ca.der().into()))
            .collect(),
    }
}

// ---- JWT fixtures ----

/// An ES256 key published in a trust domain's JWT bundle.
pub struct JwtSigner {
    pub kid: String,
    key: EncodingKey,
    jwk: serde_json::Value,
}

impl JwtSigner {
    pub fn new(kid: &str) -> Self {
        let signing = SigningKey::random(&mut OsRng);
        let der = signing.to_pkcs8_der().unwrap();
        let point = signing.verifying_key().to_encoded_point(false);
        let jwk = serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": Base64UrlUnpadded::encode_string(point.x().unwrap()),
            "y": Base64UrlUnpadded::encode_string(point.y().unwrap()),
            "kid": kid,
            "use": "jwt-svid",
        });
        Self {
            kid: kid.to_owned(),
            key: EncodingKey::from_ec_der(der.as_bytes()),
            jwk,
        }
    }

    pub fn sign(&self, sub: &str, aud: &[String], exp: u64) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        header.typ = Some("JWT".to_owned());
        let claims = serde_json::json!({ "sub": sub, "aud": aud, "exp": exp });
        jsonwebtoken::encode(&header, &claims, &self.key).unwrap()
    }

    /// JWKS document holding this key.
    pub fn jwks(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({ "keys": [self.jwk] })).unwrap()
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn in_one_hour() -> u64 {
    now_unix() + 3600
}

// ---- mock agent ----

struct AgentState {
    current: Mutex<X509svidResponse>,
    subscribers: Mutex<Vec<mpsc::Sender<Result<X509svidResponse, Status>>>>,
    default_id: Mutex<String>,
    signer: JwtSigner,
    fetch_delay: Mutex<Duration>,
    jwt_delay: Mutex<Duration>,
    deny_x509: Mutex<bool>,
}

#[derive(Clone)]
struct AgentService(Arc<AgentState>);

/// A Workload API server on a Unix socket in a temporary directory.
pub struct MockAgent {
    state: Arc<AgentState>,
    socket: PathBuf,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl MockAgent {
    /// Starts serving `initial` to every X.509 subscriber.
    pub async fn start(initial: X509svidResponse) -> Self {
        let default_id = initial
            .svids
            .first()
            .map(|s| s.spiffe_id.clone())
            .unwrap_or_default();
        let state = Arc::new(AgentState {
            current: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
            default_id: Mutex::new(default_id),
            signer: JwtSigner::new("agent-key-1"),
            fetch_delay: Mutex::new(Duration::ZERO),
            jwt_delay: Mutex::new(Duration::ZERO),
            deny_x509: Mutex::new(false),
        });

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let shutdown = CancellationToken::new();

        let service = SpiffeWorkloadApiServer::new(AgentService(Arc::clone(&state)));
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), stop.cancelled_owned())
                .await
                .unwrap();
        });

        Self {
            state,
            socket,
            shutdown,
            _dir: dir,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// `unix://` address of the socket.
    pub fn address(&self) -> String {
        format!("unix://{}", self.socket.display())
    }

    /// Pushes a new X.509 update to every open stream.
    pub async fn rotate(&self, update: X509svidResponse) {
        if let Some(svid) = update.svids.first() {
            *self.state.default_id.lock().unwrap() = svid.spiffe_id.clone();
        }
        *self.state.current.lock().unwrap() = update.clone();
        let subscribers = self.state.subscribers.lock().unwrap().clone();
        for tx in subscribers {
            let _ = tx.send(Ok(update.clone())).await;
        }
    }

    /// Ends every open X.509 stream, as an agent restart would.
    pub fn end_streams(&self) {
        self.state.subscribers.lock().unwrap().clear();
    }

    /// Delays the first X.509 message of every new stream.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.state.fetch_delay.lock().unwrap() = delay;
    }

    /// Delays every JWT-SVID response by `delay`.
    pub fn set_jwt_delay(&self, delay: Duration) {
        *self.state.jwt_delay.lock().unwrap() = delay;
    }

    /// Makes X.509 fetches fail as for an unregistered workload.
    pub fn deny_x509(&self, deny: bool) {
        *self.state.deny_x509.lock().unwrap() = deny;
    }

    pub fn jwt_signer(&self) -> &JwtSigner {
        &self.state.signer
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tonic::async_trait]
impl SpiffeWorkloadApi for AgentService {
    async fn fetch_jwtsvid(
        &self,
        request: Request<JwtsvidRequest>,
    ) -> Result<Response<JwtsvidResponse>, Status> {
        check_header(&request)?;
        let delay = *self.0.jwt_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let request = request.into_inner();
        if request.audience.iter().any(|a| a == FORBIDDEN_AUDIENCE) {
            return Err(Status::permission_denied("audience not allowed"));
        }

        let subject = if request.spiffe_id.is_empty() {
            self.0.default_id.lock().unwrap().clone()
        } else {
            request.spiffe_id
        };
        let token = self.0.signer.sign(&subject, &request.audience, in_one_hour());

        Ok(Response::new(JwtsvidResponse {
            svids: vec![Jwtsvid {
                spiffe_id: subject,
                svid: token,
                hint: String::new(),
            }],
        }))
    }

    type FetchJWTBundlesStream = ReceiverStream<Result<JwtBundlesResponse, Status>>;

    async fn fetch_jwt_bundles(
        &self,
        request: Request<JwtBundlesRequest>,
    ) -> Result<Response<Self::FetchJWTBundlesStream>, Status> {
        check_header(&request)?;
        let mut bundles = HashMap::new();
        bundles.insert(
            format!("spiffe://{TRUST_DOMAIN}"),
            self.0.signer.jwks().into(),
        );

        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(JwtBundlesResponse { bundles })).await;
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type FetchX509SVIDStream = ReceiverStream<Result<X509svidResponse, Status>>;

    async fn fetch_x509svid(
        &self,
        request: Request<X509svidRequest>,
    ) -> Result<Response<Self::FetchX509SVIDStream>, Status> {
        check_header(&request)?;
        if *self.0.deny_x509.lock().unwrap() {
            return Err(Status::permission_denied("no identity issued"));
        }

        let delay = *self.0.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = mpsc::channel(16);
        let current = self.0.current.lock().unwrap().clone();
        let _ = tx.send(Ok(current)).await;
        self.0.subscribers.lock().unwrap().push(tx);
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type FetchX509BundlesStream = ReceiverStream<Result<X509BundlesResponse, Status>>;

    async fn fetch_x509_bundles(
        &self,
        _request: Request<X509BundlesRequest>,
    ) -> Result<Response<Self::FetchX509BundlesStream>, Status> {
        Err(Status::unimplemented("not served by the mock agent"))
    }
}

fn check_header<T>(request: &Request<T>) -> Result<(), Status> {
    match request.metadata().get("workload.spiffe.io") {
        Some(v) if v == "true" => Ok(()),
        _ => Err(Status::invalid_argument("security header missing from request")),
    }
}

// ---- mock broker ----

/// A workload the broker can issue for, named by its selectors.
pub struct BrokerWorkload {
    pub spiffe_id: String,
    pub selectors: Vec<(String, String)>,
}

struct BrokerState {
    workloads: Vec<BrokerWorkload>,
    signer: JwtSigner,
    deny: Mutex<bool>,
    requests: Mutex<Vec<FetchJwtsviDsRequest>>,
    garbage_tokens: Mutex<bool>,
    delay: Mutex<Duration>,
}

#[derive(Clone)]
struct BrokerService(Arc<BrokerState>);

/// A Delegated Identity API server on a Unix socket.
pub struct MockBroker {
    state: Arc<BrokerState>,
    socket: PathBuf,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl MockBroker {
    pub async fn start(workloads: Vec<BrokerWorkload>) -> Self {
        let state = Arc::new(BrokerState {
            workloads,
            signer: JwtSigner::new("broker-key-1"),
            deny: Mutex::new(false),
            requests: Mutex::new(Vec::new()),
            garbage_tokens: Mutex::new(false),
            delay: Mutex::new(Duration::ZERO),
        });

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("admin.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let shutdown = CancellationToken::new();

        let service = DelegatedIdentityServer::new(BrokerService(Arc::clone(&state)));
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), stop.cancelled_owned())
                .await
                .unwrap();
        });

        Self {
            state,
            socket,
            shutdown,
            _dir: dir,
        }
    }

    pub fn address(&self) -> String {
        format!("unix://{}", self.socket.display())
    }

    /// Refuses every caller with `PermissionDenied`.
    pub fn deny(&self, deny: bool) {
        *self.state.deny.lock().unwrap() = deny;
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// Answers with tokens that are not JWTs.
    pub fn send_garbage_tokens(&self, garbage: bool) {
        *self.state.garbage_tokens.lock().unwrap() = garbage;
    }

    pub fn requests(&self) -> Vec<FetchJwtsviDsRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn jwt_signer(&self) -> &JwtSigner {
        &self.state.signer
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tonic::async_trait]
impl DelegatedIdentity for BrokerService {
    async fn fetch_jwtsvi_ds(
        &self,
        request: Request<FetchJwtsviDsRequest>,
    ) -> Result<Response<FetchJwtsviDsResponse>, Status> {
        let request = request.into_inner();
        self.0.requests.lock().unwrap().push(request.clone());
        let delay = *self.0.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if *self.0.deny.lock().unwrap() {
            return Err(Status::permission_denied("caller is not an authorized delegate"));
        }
        if request.audience.is_empty() {
            return Err(Status::invalid_argument("audience must be specified"));
        }

        let garbage = *self.0.garbage_tokens.lock().unwrap();
        let svids = self
            .0
            .workloads
            .iter()
            .filter(|w| matches_all(&w.selectors, &request.selectors))
            .map(|w| {
                let (trust_domain, path) = split_id(&w.spiffe_id);
                BrokerJwtSvid {
                    token: if garbage {
                        "not-a-jwt".to_owned()
                    } else {
                        self.0.signer.sign(&w.spiffe_id, &request.audience, in_one_hour())
                    },
                    id: Some(Spiffeid {
                        trust_domain: trust_domain.to_owned(),
                        path: path.to_owned(),
                    }),
                    expires_at: i64::try_from(in_one_hour()).unwrap(),
                    issued_at: i64::try_from(now_unix()).unwrap(),
                    hint: String::new(),
                }
            })
            .collect();

        Ok(Response::new(FetchJwtsviDsResponse { svids }))
    }
}

fn matches_all(workload: &[(String, String)], requested: &[Selector]) -> bool {
    requested.iter().all(|s| {
        workload
            .iter()
            .any(|(kind, value)| *kind == s.r#type && *value == s.value)
    })
}

fn split_id(id: &str) -> (&str, &str) {
    let rest = id.strip_prefix("spiffe://").unwrap();
    match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    }
}

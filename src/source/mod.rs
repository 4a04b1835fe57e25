//! Live X.509 identity and trust bundles from the local agent.
//!
//! [`IdentitySource::open`] performs one synchronous fetch, then a single
//! background task follows the agent's update stream. The identity and the
//! bundle set sit in two independent [`ArcSwap`]s: each read is an atomic
//! snapshot of one of them and never a half-applied rotation.

mod supervisor;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::bundle::{BundleSource, X509Bundle, X509BundleSet};
use crate::context::CallContext;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::observability::Logger;
use crate::prelude::{debug, info, warn};
use crate::spiffe_id::TrustDomain;
use crate::svid::X509Svid;
use crate::workload_api::{WorkloadApiClient, WorkloadApiError, X509Context};

/// Bound on the initial fetch when the caller's context has no deadline.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to the agent that keeps the workload's X.509 identity and
/// bundles current.
///
/// Clones share the same connection. The background task stops on
/// [`IdentitySource::close`] or when the last clone is dropped.
#[derive(Clone)]
pub struct IdentitySource {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

pub(crate) struct Inner {
    endpoint: Endpoint,
    logger: Logger,

    svid: ArcSwap<X509Svid>,
    bundles: ArcSwap<X509BundleSet>,

    closed: AtomicBool,
    cancel: CancellationToken,

    update_seq: AtomicU64,
    update_tx: watch::Sender<u64>,

    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentitySource")
            .field("endpoint", &self.inner.endpoint)
            .field("spiffe_id", self.inner.svid.load().spiffe_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl IdentitySource {
    /// Connects to the agent at `endpoint` and waits for the first identity.
    ///
    /// The fetch is bounded by `ctx`, or by [`DEFAULT_OPEN_TIMEOUT`] when
    /// `ctx` carries no deadline.
    ///
    /// # Errors
    ///
    /// - [`Error::SourceUnavailable`] if the agent cannot be reached, refuses
    ///   the workload, sends an update without an SVID or stays silent past
    ///   [`DEFAULT_OPEN_TIMEOUT`].
    /// - [`Error::Timeout`] or [`Error::Cancelled`] from `ctx`.
    pub async fn open(endpoint: &Endpoint, ctx: &CallContext, logger: Logger) -> Result<Self> {
        let caller_deadline = ctx.remaining().is_some();
        let ctx = ctx.clone().or_timeout(DEFAULT_OPEN_TIMEOUT);

        let (client, context) = ctx
            .run("open identity source", async {
                let client = WorkloadApiClient::connect(endpoint)
                    .await
                    .map_err(Error::SourceUnavailable)?;
                let context = client
                    .fetch_x509_context()
                    .await
                    .map_err(Error::SourceUnavailable)?;
                Ok((client, context))
            })
            .await
            .map_err(|e| unavailable_past_default_bound(e, caller_deadline))?;

        let svid = context
            .default_svid()
            .cloned()
            .ok_or(Error::SourceUnavailable(WorkloadApiError::EmptyResponse))?;

        info!(
            logger,
            "identity source opened: endpoint={}, spiffe_id={}, bundles={}",
            endpoint,
            svid.spiffe_id(),
            context.bundles().len()
        );

        let (update_tx, _) = watch::channel(0u64);
        let cancel = CancellationToken::new();
        let inner = Arc::new(Inner {
            endpoint: endpoint.clone(),
            logger,
            svid: ArcSwap::new(svid),
            bundles: ArcSwap::new(Arc::clone(context.bundles())),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            update_seq: AtomicU64::new(0),
            update_tx,
            supervisor: Mutex::new(None),
        });

        let task_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            task_inner.run_supervisor(Some(client)).await;
        });
        *inner.supervisor.lock().await = Some(handle);

        Ok(Self {
            inner,
            _guard: Arc::new(cancel.drop_guard()),
        })
    }

    /// The workload's current X.509-SVID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceClosed`] after [`IdentitySource::close`].
    pub fn current_identity(&self) -> Result<Arc<X509Svid>> {
        self.assert_open()?;
        Ok(self.inner.svid.load_full())
    }

    /// The current X.509 bundle for `trust_domain`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceClosed`] after close, or
    /// [`Error::SourceUnavailable`] when the agent sent no bundle for
    /// `trust_domain`.
    pub fn current_bundle(&self, trust_domain: &TrustDomain) -> Result<Arc<X509Bundle>> {
        self.assert_open()?;
        self.inner.bundles.load().get(trust_domain).ok_or_else(|| {
            Error::SourceUnavailable(WorkloadApiError::NoBundle(trust_domain.clone()))
        })
    }

    /// Every bundle the workload currently trusts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceClosed`] after close.
    pub fn bundle_set(&self) -> Result<Arc<X509BundleSet>> {
        self.assert_open()?;
        Ok(self.inner.bundles.load_full())
    }

    /// Trust domain of the current identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceClosed`] after close.
    pub fn trust_domain(&self) -> Result<TrustDomain> {
        self.assert_open()?;
        Ok(self.inner.svid.load().spiffe_id().trust_domain().clone())
    }

    /// Endpoint of the agent.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Notifications of applied rotations.
    ///
    /// The sequence starts at 0 and the initial fetch does not count.
    pub fn updated(&self) -> SourceUpdates {
        SourceUpdates {
            rx: self.inner.update_tx.subscribe(),
            cancel: self.inner.cancel.clone(),
        }
    }

    /// Stops the background task and waits for it to finish.
    ///
    /// Idempotent. After the first call every accessor returns
    /// [`Error::SourceClosed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(self.inner.logger, "identity source task ended abnormally: {e}");
            }
        }
        debug!(self.inner.logger, "identity source closed: endpoint={}", self.inner.endpoint);
    }

    /// `true` once the source has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled()
    }

    fn assert_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SourceClosed);
        }
        Ok(())
    }
}

impl BundleSource for IdentitySource {
    type Item = X509Bundle;
    type Error = Error;

    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error> {
        self.assert_open()?;
        Ok(self.inner.bundles.load().get(trust_domain))
    }
}

/// Receiver of rotation sequence numbers from an [`IdentitySource`].
#[derive(Debug, Clone)]
pub struct SourceUpdates {
    rx: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl SourceUpdates {
    /// Waits for the next applied rotation and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceClosed`] once the source is closed.
    pub async fn changed(&mut self) -> Result<u64> {
        let closed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => true,
            changed = self.rx.changed() => changed.is_err(),
        };
        if closed {
            return Err(Error::SourceClosed);
        }
        Ok(*self.rx.borrow_and_update())
    }

    /// Last sequence number seen, without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }
}

impl Inner {
    /// Publishes `context` if it carries an identity. Returns `false` when
    /// the update was ignored.
    pub(crate) fn apply_update(&self, context: &X509Context) -> bool {
        let Some(svid) = context.default_svid() else {
            warn!(self.logger, "ignoring agent update without an X.509-SVID");
            return false;
        };

        let unchanged = **self.svid.load() == **svid && **self.bundles.load() == **context.bundles();
        if unchanged {
            return true;
        }

        self.svid.store(Arc::clone(svid));
        self.bundles.store(Arc::clone(context.bundles()));

        let seq = self.update_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.update_tx.send_replace(seq);
        info!(
            self.logger,
            "identity rotated: spiffe_id={}, bundles={}, seq={}",
            svid.spiffe_id(),
            context.bundles().len(),
            seq
        );
        true
    }
}

// A timeout is the caller's only when the caller set the deadline.
fn unavailable_past_default_bound(err: Error, caller_deadline: bool) -> Error {
    match err {
        Error::Timeout { timeout, .. } if !caller_deadline => {
            Error::SourceUnavailable(WorkloadApiError::NoResponse(timeout))
        }
        err => err,
    }
}

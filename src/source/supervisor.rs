use std::time::Duration;

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::prelude::{debug, info, warn};
use crate::workload_api::{WorkloadApiClient, WorkloadApiError, X509ContextStream};

use super::Inner;

pub(super) const MIN_BACKOFF: Duration = Duration::from_millis(100);
pub(super) const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Doubles `current`, clamped to [`MAX_BACKOFF`].
pub(super) fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_BACKOFF)
}

/// Sleeps for `duration`. Returns `true` if cancelled first.
async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

enum StreamOutcome {
    Cancelled,
    Ended { applied: bool },
}

impl Inner {
    pub(super) async fn run_supervisor(&self, mut client: Option<WorkloadApiClient>) {
        let cancel = self.cancel.clone();
        let mut backoff = MIN_BACKOFF;

        loop {
            if cancel.is_cancelled() {
                debug!(self.logger, "identity source supervisor stopping");
                return;
            }

            let c = match client.take() {
                Some(c) => c,
                None => match self.reconnect(&cancel).await {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        warn!(
                            self.logger,
                            "agent unreachable, retrying: endpoint={}, error={}, backoff_ms={}",
                            self.endpoint,
                            e,
                            backoff.as_millis()
                        );
                        if sleep_or_cancel(&cancel, backoff).await {
                            return;
                        }
                        backoff = next_backoff(backoff);
                        continue;
                    }
                    None => return,
                },
            };

            let opened = self.open_stream(&c, &cancel).await;
            match opened {
                None => return,
                Some(Ok(mut stream)) => match self.consume(&mut stream, &cancel).await {
                    StreamOutcome::Cancelled => return,
                    StreamOutcome::Ended { applied } => {
                        if applied {
                            backoff = MIN_BACKOFF;
                        }
                        client = Some(c);
                    }
                },
                Some(Err(e)) => {
                    warn!(
                        self.logger,
                        "workload api stream unavailable, retrying: endpoint={}, error={}, backoff_ms={}",
                        self.endpoint,
                        e,
                        backoff.as_millis()
                    );
                }
            }

            if sleep_or_cancel(&cancel, backoff).await {
                return;
            }
            backoff = next_backoff(backoff);
        }
    }

    /// `None` when cancelled.
    async fn reconnect(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<WorkloadApiClient, WorkloadApiError>> {
        tokio::select! {
            () = cancel.cancelled() => None,
            result = WorkloadApiClient::connect(&self.endpoint) => Some(result),
        }
    }

    /// `None` when cancelled.
    async fn open_stream(
        &self,
        client: &WorkloadApiClient,
        cancel: &CancellationToken,
    ) -> Option<Result<X509ContextStream, WorkloadApiError>> {
        tokio::select! {
            () = cancel.cancelled() => None,
            result = client.stream_x509_contexts() => Some(result),
        }
    }

    async fn consume(&self, stream: &mut X509ContextStream, cancel: &CancellationToken) -> StreamOutcome {
        let mut applied = false;
        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => return StreamOutcome::Cancelled,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(context)) => applied |= self.apply_update(&context),
                Some(Err(e)) => {
                    warn!(self.logger, "workload api stream error, reconnecting: {e}");
                    return StreamOutcome::Ended { applied };
                }
                None => {
                    info!(self.logger, "workload api stream ended, reconnecting");
                    return StreamOutcome::Ended { applied };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let mut backoff = MIN_BACKOFF;
        let mut seen = vec![backoff];
        for _ in 0..10 {
            backoff = next_backoff(backoff);
            seen.push(backoff);
        }
        assert_eq!(seen[1], Duration::from_millis(200));
        assert_eq!(seen[2], Duration::from_millis(400));
        assert_eq!(*seen.last().unwrap(), MAX_BACKOFF);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(sleep_or_cancel(&token, Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancellation() {
        let token = CancellationToken::new();
        assert!(!sleep_or_cancel(&token, Duration::from_millis(10)).await);
    }
}

//! Prediction poller: drives one [`PredictionHandle`] from `submitted` to a
//! terminal status on a fixed tick, within a per-stage tick budget.
//!
//! Cancelling the token only stops the local wait; the remote prediction
//! keeps running and is never canceled from here.

use crate::error::GenerationError;
use crate::provider::{PredictionHandle, PredictionStatus, ProviderGateway, RemoteState};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tick interval and budget for one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_ticks: u32,
    /// Consecutive transport errors tolerated before giving up.
    pub max_poll_errors: u32,
}

impl PollPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

    pub fn image() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            max_ticks: 90,
            max_poll_errors: 3,
        }
    }

    pub fn enhancement() -> Self {
        Self {
            max_ticks: 60,
            ..Self::image()
        }
    }

    pub fn video() -> Self {
        Self {
            max_ticks: 150,
            ..Self::image()
        }
    }

    /// Worst-case wall time this policy may wait.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_ticks
    }
}

pub struct PredictionPoller<'a> {
    gateway: &'a ProviderGateway,
    policy: PollPolicy,
}

impl<'a> PredictionPoller<'a> {
    pub fn new(gateway: &'a ProviderGateway, policy: PollPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Poll until the handle is terminal, the tick budget runs out, or
    /// `cancel` fires. Returns the result URI on success.
    pub async fn drive(
        &self,
        handle: &mut PredictionHandle,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        if let Some(settled) = settled_outcome(handle) {
            return settled;
        }

        let mut poll_errors = 0u32;
        while handle.ticks < self.policy.max_ticks {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(prediction_id = %handle.id, ticks = handle.ticks, "stopped polling");
                    return Err(GenerationError::Abandoned { id: handle.id.clone() });
                }
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
            handle.ticks += 1;

            let snapshot = match self.gateway.poll(handle).await {
                Ok(snapshot) => {
                    poll_errors = 0;
                    snapshot
                }
                Err(err) => {
                    poll_errors += 1;
                    tracing::warn!(
                        prediction_id = %handle.id,
                        tick = handle.ticks,
                        error = %err,
                        "poll failed ({poll_errors}/{})",
                        self.policy.max_poll_errors
                    );
                    if poll_errors >= self.policy.max_poll_errors {
                        let reason = err.to_string();
                        handle.advance(PredictionStatus::Failed {
                            reason: reason.clone(),
                        });
                        self.gateway.usage().record_failed();
                        return Err(GenerationError::PollLost {
                            id: handle.id.clone(),
                            reason,
                        });
                    }
                    continue;
                }
            };

            match snapshot.state {
                RemoteState::Queued => {}
                RemoteState::Running => {
                    handle.advance(PredictionStatus::Running);
                }
                RemoteState::Succeeded => {
                    return match snapshot.output {
                        Some(uri) => {
                            handle.advance(PredictionStatus::Succeeded { uri: uri.clone() });
                            tracing::debug!(prediction_id = %handle.id, ticks = handle.ticks, "prediction succeeded");
                            Ok(uri)
                        }
                        None => {
                            handle.advance(PredictionStatus::Failed {
                                reason: "succeeded-without-result".to_string(),
                            });
                            self.gateway.usage().record_failed();
                            Err(GenerationError::SucceededWithoutResult {
                                id: handle.id.clone(),
                            })
                        }
                    };
                }
                RemoteState::Failed => {
                    let reason = snapshot
                        .error
                        .unwrap_or_else(|| "provider reported failure".to_string());
                    handle.advance(PredictionStatus::Failed {
                        reason: reason.clone(),
                    });
                    self.gateway.usage().record_failed();
                    return Err(GenerationError::ProviderFailed {
                        id: handle.id.clone(),
                        reason,
                    });
                }
                RemoteState::Canceled => {
                    handle.advance(PredictionStatus::Canceled);
                    self.gateway.usage().record_failed();
                    return Err(GenerationError::Canceled {
                        id: handle.id.clone(),
                    });
                }
            }
        }

        tracing::warn!(prediction_id = %handle.id, ticks = handle.ticks, "prediction timed out");
        handle.advance(PredictionStatus::TimedOut { ticks: handle.ticks });
        self.gateway.usage().record_failed();
        Err(GenerationError::TimedOut {
            id: handle.id.clone(),
            ticks: handle.ticks,
        })
    }
}

fn settled_outcome(handle: &PredictionHandle) -> Option<Result<String, GenerationError>> {
    match &handle.status {
        PredictionStatus::Succeeded { uri } => Some(Ok(uri.clone())),
        PredictionStatus::Failed { reason } => Some(Err(GenerationError::ProviderFailed {
            id: handle.id.clone(),
            reason: reason.clone(),
        })),
        PredictionStatus::TimedOut { ticks } => Some(Err(GenerationError::TimedOut {
            id: handle.id.clone(),
            ticks: *ticks,
        })),
        PredictionStatus::Canceled => Some(Err(GenerationError::Canceled {
            id: handle.id.clone(),
        })),
        PredictionStatus::Submitted | PredictionStatus::Running => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{GenerationRequest, MockBehavior, MockProvider, ModelTarget};
    use std::sync::Arc;

    fn gateway_with(behavior: MockBehavior) -> ProviderGateway {
        ProviderGateway::new().with_provider(Arc::new(MockProvider::new("mock").with_default(behavior)))
    }

    fn policy(max_ticks: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(10),
            max_ticks,
            max_poll_errors: 3,
        }
    }

    async fn submit(gateway: &ProviderGateway) -> PredictionHandle {
        let request = GenerationRequest::new(&ModelTarget::new("mock", "flux"), "a red sneaker");
        gateway.submit(&request).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn drives_to_success() {
        let gateway = gateway_with(MockBehavior::Succeed { after_polls: 3 });
        let mut handle = submit(&gateway).await;
        let uri = PredictionPoller::new(&gateway, policy(10))
            .drive(&mut handle, &CancellationToken::new())
            .await
            .unwrap();
        assert!(uri.starts_with("mock://"));
        assert_eq!(handle.ticks, 4);
        assert_eq!(handle.result_uri(), Some(uri.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn success_without_output_is_a_failure() {
        let gateway = gateway_with(MockBehavior::SucceedWithoutOutput { after_polls: 0 });
        let mut handle = submit(&gateway).await;
        let err = PredictionPoller::new(&gateway, policy(10))
            .drive(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::SucceededWithoutResult { .. }));
        assert!(matches!(handle.status, PredictionStatus::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_failure_carries_reason() {
        let gateway = gateway_with(MockBehavior::Fail {
            after_polls: 1,
            reason: "content policy".into(),
        });
        let mut handle = submit(&gateway).await;
        let err = PredictionPoller::new(&gateway, policy(10))
            .drive(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GenerationError::ProviderFailed { reason, .. } => assert_eq!(reason, "content policy"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_budget() {
        let gateway = gateway_with(MockBehavior::Hang);
        let mut handle = submit(&gateway).await;
        let err = PredictionPoller::new(&gateway, policy(5))
            .drive(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::TimedOut { ticks: 5, .. }));
        assert_eq!(handle.status, PredictionStatus::TimedOut { ticks: 5 });
        assert_eq!(gateway.usage().snapshot().failed, 1);

        let replay = PredictionPoller::new(&gateway, policy(5))
            .drive(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(replay, GenerationError::TimedOut { ticks: 5, .. }));
        assert_eq!(replay.kind(), crate::error::ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_cancel_is_terminal() {
        let gateway = gateway_with(MockBehavior::Cancel { after_polls: 1 });
        let mut handle = submit(&gateway).await;
        let err = PredictionPoller::new(&gateway, policy(10))
            .drive(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Canceled { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Canceled);
        assert!(!err.never_started());
        assert_eq!(handle.status, PredictionStatus::Canceled);
        assert_eq!(handle.ticks, 2);
        assert!(!handle.advance(PredictionStatus::Succeeded {
            uri: "mock://late".into()
        }));
        assert_eq!(handle.status, PredictionStatus::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_handle_is_not_polled_again() {
        let gateway = gateway_with(MockBehavior::Hang);
        let mut handle = submit(&gateway).await;
        handle.advance(PredictionStatus::Canceled);
        let err = PredictionPoller::new(&gateway, policy(5))
            .drive(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Canceled { .. }));
        assert_eq!(handle.ticks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_waiting_without_terminal_status() {
        let gateway = gateway_with(MockBehavior::Hang);
        let mut handle = submit(&gateway).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = PredictionPoller::new(&gateway, policy(5))
            .drive(&mut handle, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Abandoned { .. }));
        assert!(!handle.status.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_transport_retries() {
        let gateway = gateway_with(MockBehavior::Unreachable);
        let mut handle = submit(&gateway).await;
        let err = PredictionPoller::new(&gateway, policy(50))
            .drive(&mut handle, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::PollLost { .. }));
        assert!(!err.never_started());
        assert_eq!(err.kind(), crate::error::ErrorKind::ProviderFailure);
        assert!(handle.status.is_terminal());
        assert_eq!(handle.ticks, 3);
    }
}

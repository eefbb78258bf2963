use crate::error::{codes, Error};
use crate::machine::{InvocationStateMachine, RunEnter};
use crate::retries::{RetryLoop, RetryPolicy};
use crate::{HandlerError, NonEmptyValue, RunExitResult, TerminalFailure};

use std::future::Future;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error returned by a `run` closure. Retryable failures are consumed by the
/// executor's retry loop; terminal failures are journaled and short-circuit.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Terminal(#[from] TerminalFailure),
    #[error("retryable run failure: {0}")]
    Retryable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RunError {
    pub fn retryable(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        RunError::Retryable(error.into())
    }
}

impl From<serde_json::Error> for RunError {
    fn from(value: serde_json::Error) -> Self {
        RunError::Retryable(value.into())
    }
}

/// Handed to `run` closures so they can observe supervisor cancellation.
/// Observing it is optional; a cancellation noticed inside the closure is a
/// retryable failure unless the closure surfaces a terminal one.
#[derive(Clone)]
pub struct CancelWatcher(CancellationToken);

impl CancelWatcher {
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }
}

/// Execute one logical side-effect step: consume the recorded result during
/// replay, otherwise run the closure under the retry policy and journal the
/// serialized outcome.
pub(crate) async fn execute_run<T, F, Fut>(
    machine: InvocationStateMachine,
    name: String,
    mut closure: F,
    retry_policy: Option<RetryPolicy>,
) -> Result<T, HandlerError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(CancelWatcher) -> Fut + Send,
    Fut: Future<Output = Result<T, RunError>> + Send,
{
    match machine.sys_run_enter(&name)? {
        RunEnter::Replayed(NonEmptyValue::Success(bytes)) => decode_recorded(&name, &bytes),
        RunEnter::Replayed(NonEmptyValue::Failure(failure)) => {
            Err(HandlerError::Terminal(failure))
        }
        RunEnter::Execute => {
            let policy = retry_policy
                .unwrap_or_else(|| machine.shared.run_retry_policy.lock().unwrap().clone());
            let mut retry_loop = RetryLoop::new(policy);
            let watcher = CancelWatcher(machine.shared.cancellation.clone());

            let started_at = Instant::now();
            loop {
                match closure(watcher.clone()).await {
                    Ok(value) => {
                        let bytes = serialize_result(&name, &value)?;
                        machine
                            .sys_run_exit(name, RunExitResult::Success(bytes))
                            .await?;
                        return Ok(value);
                    }
                    Err(RunError::Terminal(failure)) => {
                        machine
                            .sys_run_exit(name, RunExitResult::TerminalFailure(failure.clone()))
                            .await?;
                        return Err(HandlerError::Terminal(failure));
                    }
                    Err(RunError::Retryable(error)) => {
                        match retry_loop.next_pause(started_at.elapsed()) {
                            Some(pause) => {
                                debug!(
                                    "Side effect '{name}' failed, retrying in {pause:?}: {error}"
                                );
                                // Real-time sleep, not the durable sleep path.
                                tokio::select! {
                                    _ = tokio::time::sleep(pause) => {}
                                    _ = watcher.cancelled() => return Err(HandlerError::Cancelled),
                                }
                            }
                            None => {
                                // Retry budget exhausted: the failure becomes
                                // terminal and is journaled as such.
                                let failure = TerminalFailure {
                                    code: codes::INTERNAL,
                                    message: error.to_string(),
                                };
                                machine
                                    .sys_run_exit(
                                        name,
                                        RunExitResult::TerminalFailure(failure.clone()),
                                    )
                                    .await?;
                                return Err(HandlerError::Terminal(failure));
                            }
                        }
                    }
                }
            }
        }
    }
}

fn decode_recorded<T: DeserializeOwned>(name: &str, bytes: &Bytes) -> Result<T, HandlerError> {
    serde_json::from_slice(bytes).map_err(|e| {
        HandlerError::Retryable(Error::new(
            codes::PROTOCOL_VIOLATION,
            format!("cannot decode the recorded result of run '{name}': {e}"),
        ))
    })
}

fn serialize_result<T: Serialize>(name: &str, value: &T) -> Result<Bytes, HandlerError> {
    serde_json::to_vec(value).map(Bytes::from).map_err(|e| {
        HandlerError::Terminal(TerminalFailure {
            code: codes::INTERNAL,
            message: format!("cannot serialize the result of run '{name}': {e}"),
        })
    })
}

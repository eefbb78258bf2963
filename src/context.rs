use crate::error::{codes, Error};
use crate::machine::{AsyncResult, InvocationStateMachine};
use crate::run::{execute_run, CancelWatcher, RunError};
use crate::retries::RetryPolicy;
use crate::{HandlerError, NonEmptyValue, Target, TerminalFailure, Value};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::{select_all, try_join_all, BoxFuture, FutureExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Result of a durable operation awaited by handler code.
///
/// A thin, `Unpin` future wrapper so awaitables can be combined with
/// [`all`] and [`race`] before being awaited.
pub struct Awaitable<T> {
    inner: BoxFuture<'static, Result<T, HandlerError>>,
}

impl<T> Awaitable<T> {
    fn new(fut: impl Future<Output = Result<T, HandlerError>> + Send + 'static) -> Self {
        Self { inner: fut.boxed() }
    }
}

impl<T> Future for Awaitable<T> {
    type Output = Result<T, HandlerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// Resolves once every input resolved, in input order, propagating the first
/// failure. Deterministic on replay because each child is journaled
/// independently.
pub fn all<T: Send + 'static>(awaitables: Vec<Awaitable<T>>) -> Awaitable<Vec<T>> {
    Awaitable::new(try_join_all(awaitables))
}

/// Resolves with the first-completing input. On replay the winner is
/// whichever child's completion was recorded first.
pub fn race<T: Send + 'static>(awaitables: Vec<Awaitable<T>>) -> Awaitable<T> {
    Awaitable::new(async move {
        if awaitables.is_empty() {
            return Err(HandlerError::Retryable(Error::internal(
                "race() requires at least one awaitable",
            )));
        }
        let (result, _, _) = select_all(awaitables).await;
        result
    })
}

/// The only legal path from handler code into the invocation state machine.
///
/// Borrows the machine by shared handle; cloning is cheap and every clone
/// drives the same invocation.
#[derive(Clone)]
pub struct Context {
    machine: InvocationStateMachine,
}

impl Context {
    pub(crate) fn new(machine: InvocationStateMachine) -> Self {
        Self { machine }
    }

    /// Debug form of the invocation identifier.
    pub fn invocation_id(&self) -> String {
        self.machine.expect_start_info().debug_id
    }

    /// The object/workflow key this invocation runs against; empty for plain
    /// services.
    pub fn key(&self) -> String {
        self.machine.expect_start_info().key
    }

    /// Deterministic random draw: seeded from the Start frame, stable across
    /// replay as long as draws happen in program order.
    pub fn rand_u64(&self) -> u64 {
        self.machine.with_rng(|rng| rng.random())
    }

    pub fn rand_f64(&self) -> f64 {
        self.machine.with_rng(|rng| rng.random())
    }

    fn sys_err(&self, error: Error) -> HandlerError {
        HandlerError::Retryable(self.machine.fail(error))
    }

    // --- State

    pub async fn get_state<T: DeserializeOwned>(
        &self,
        key: impl Into<String>,
    ) -> Result<Option<T>, HandlerError> {
        let key = key.into();
        let result = self
            .machine
            .sys_state_get(key.clone())
            .await
            .map_err(|e| self.sys_err(e))?;
        match result.resolve().await? {
            Value::Void => {
                self.machine.learn_state(key, None);
                Ok(None)
            }
            Value::Success(bytes) => {
                self.machine.learn_state(key, Some(bytes.clone()));
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    decode_json(&bytes).map(Some)
                }
            }
            Value::Failure(failure) => Err(HandlerError::Terminal(failure)),
            _ => Err(self.sys_err(Error::new(
                codes::PROTOCOL_VIOLATION,
                "unexpected completion kind for get state",
            ))),
        }
    }

    pub async fn set_state<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), HandlerError> {
        let bytes = encode_json(value)?;
        self.machine
            .sys_state_set(key.into(), bytes)
            .await
            .map_err(|e| self.sys_err(e))
    }

    pub async fn clear_state(&self, key: impl Into<String>) -> Result<(), HandlerError> {
        self.machine
            .sys_state_clear(key.into())
            .await
            .map_err(|e| self.sys_err(e))
    }

    pub async fn clear_all_state(&self) -> Result<(), HandlerError> {
        self.machine
            .sys_state_clear_all()
            .await
            .map_err(|e| self.sys_err(e))
    }

    pub async fn state_keys(&self) -> Result<Vec<String>, HandlerError> {
        let result = self
            .machine
            .sys_state_get_keys()
            .await
            .map_err(|e| self.sys_err(e))?;
        match result.resolve().await? {
            Value::StateKeys(keys) => Ok(keys),
            Value::Failure(failure) => Err(HandlerError::Terminal(failure)),
            _ => Err(self.sys_err(Error::new(
                codes::PROTOCOL_VIOLATION,
                "unexpected completion kind for get state keys",
            ))),
        }
    }

    // --- Sleep

    pub async fn sleep(&self, duration: Duration) -> Result<(), HandlerError> {
        let wake_up_time = millis_since_epoch(SystemTime::now() + duration);
        let result = self
            .machine
            .sys_sleep(wake_up_time, String::new())
            .await
            .map_err(|e| self.sys_err(e))?;
        match result.resolve().await? {
            Value::Void => Ok(()),
            Value::Failure(failure) => Err(HandlerError::Terminal(failure)),
            _ => Err(self.sys_err(Error::new(
                codes::PROTOCOL_VIOLATION,
                "unexpected completion kind for sleep",
            ))),
        }
    }

    // --- Calls

    /// Durable request/response call to another handler. Journals the call
    /// eagerly; the returned awaitable can be combined before being awaited.
    pub async fn call<Req: Serialize, Res: DeserializeOwned + Send + 'static>(
        &self,
        target: Target,
        request: &Req,
    ) -> Result<Awaitable<Res>, HandlerError> {
        let parameter = encode_json(request)?;
        let result = self
            .machine
            .sys_call(target, parameter)
            .await
            .map_err(|e| self.sys_err(e))?;
        Ok(self.value_awaitable(result))
    }

    /// Durable one-way call, optionally delayed.
    pub async fn send<Req: Serialize>(
        &self,
        target: Target,
        request: &Req,
        delay: Option<Duration>,
    ) -> Result<(), HandlerError> {
        let parameter = encode_json(request)?;
        let invoke_time = delay
            .map(|d| millis_since_epoch(SystemTime::now() + d))
            .unwrap_or_default();
        self.machine
            .sys_send(target, parameter, invoke_time)
            .await
            .map_err(|e| self.sys_err(e))
    }

    // --- Awakeables

    /// Create a single-shot external-signal rendezvous. The identifier can be
    /// handed to any party; the awaitable resolves when someone completes it.
    pub async fn awakeable<T: DeserializeOwned + Send + 'static>(
        &self,
    ) -> Result<(String, Awaitable<T>), HandlerError> {
        let (id, result) = self
            .machine
            .sys_awakeable()
            .await
            .map_err(|e| self.sys_err(e))?;
        Ok((id, self.value_awaitable(result)))
    }

    pub async fn resolve_awakeable<T: Serialize>(
        &self,
        id: impl Into<String>,
        value: &T,
    ) -> Result<(), HandlerError> {
        let id = id.into();
        validate_awakeable_id(&id)?;
        let bytes = encode_json(value)?;
        self.machine
            .sys_complete_awakeable(id, NonEmptyValue::Success(bytes))
            .await
            .map_err(|e| self.sys_err(e))
    }

    pub async fn reject_awakeable(
        &self,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), HandlerError> {
        let id = id.into();
        validate_awakeable_id(&id)?;
        self.machine
            .sys_complete_awakeable(
                id,
                NonEmptyValue::Failure(TerminalFailure {
                    code: codes::INTERNAL,
                    message: reason.into(),
                }),
            )
            .await
            .map_err(|e| self.sys_err(e))
    }

    // --- Durable promises

    /// Block until the workflow-scoped promise is resolved.
    pub async fn promise<T: DeserializeOwned + Send + 'static>(
        &self,
        name: impl Into<String>,
    ) -> Result<Awaitable<T>, HandlerError> {
        let result = self
            .machine
            .sys_get_promise(name.into())
            .await
            .map_err(|e| self.sys_err(e))?;
        Ok(self.value_awaitable(result))
    }

    /// Non-blocking probe: `None` when the promise is not resolved yet.
    pub async fn peek_promise<T: DeserializeOwned>(
        &self,
        name: impl Into<String>,
    ) -> Result<Option<T>, HandlerError> {
        let result = self
            .machine
            .sys_peek_promise(name.into())
            .await
            .map_err(|e| self.sys_err(e))?;
        match result.resolve().await? {
            Value::Void => Ok(None),
            Value::Success(bytes) => decode_json(&bytes).map(Some),
            Value::Failure(failure) => Err(HandlerError::Terminal(failure)),
            _ => Err(self.sys_err(Error::new(
                codes::PROTOCOL_VIOLATION,
                "unexpected completion kind for peek promise",
            ))),
        }
    }

    pub async fn resolve_promise<T: Serialize>(
        &self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<(), HandlerError> {
        let bytes = encode_json(value)?;
        self.machine
            .sys_complete_promise(name.into(), NonEmptyValue::Success(bytes))
            .await
            .map_err(|e| self.sys_err(e))
    }

    pub async fn reject_promise(
        &self,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), HandlerError> {
        self.machine
            .sys_complete_promise(
                name.into(),
                NonEmptyValue::Failure(TerminalFailure {
                    code: codes::INTERNAL,
                    message: reason.into(),
                }),
            )
            .await
            .map_err(|e| self.sys_err(e))
    }

    // --- Side effects

    /// Run a closure exactly once per logical step, journaling its serialized
    /// result, under the endpoint's default retry policy.
    pub async fn run<T, F, Fut>(
        &self,
        name: impl Into<String>,
        closure: F,
    ) -> Result<T, HandlerError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(CancelWatcher) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RunError>> + Send,
    {
        execute_run(self.machine.clone(), name.into(), closure, None).await
    }

    /// Like [`run`](Self::run), with an explicit retry policy.
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        name: impl Into<String>,
        retry_policy: RetryPolicy,
        closure: F,
    ) -> Result<T, HandlerError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(CancelWatcher) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RunError>> + Send,
    {
        execute_run(self.machine.clone(), name.into(), closure, Some(retry_policy)).await
    }

    /// Lazy variant of [`run`](Self::run): nothing executes or journals until
    /// the returned awaitable is first polled, so entry order follows await
    /// order on first execution and replay alike.
    pub fn run_async<T, F, Fut>(&self, name: impl Into<String>, closure: F) -> Awaitable<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(CancelWatcher) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RunError>> + Send + 'static,
    {
        Awaitable::new(execute_run(self.machine.clone(), name.into(), closure, None))
    }

    // --- Cross-invocation operations

    /// Attach to another invocation and await its result.
    pub async fn attach_invocation<T: DeserializeOwned + Send + 'static>(
        &self,
        invocation_id: impl Into<String>,
    ) -> Result<Awaitable<T>, HandlerError> {
        let result = self
            .machine
            .sys_attach_invocation(invocation_id.into())
            .await
            .map_err(|e| self.sys_err(e))?;
        Ok(self.value_awaitable(result))
    }

    /// Fetch another invocation's output if already present, without blocking
    /// on it.
    pub async fn get_invocation_output<T: DeserializeOwned>(
        &self,
        invocation_id: impl Into<String>,
    ) -> Result<Option<T>, HandlerError> {
        let result = self
            .machine
            .sys_get_invocation_output(invocation_id.into())
            .await
            .map_err(|e| self.sys_err(e))?;
        match result.resolve().await? {
            Value::Void => Ok(None),
            Value::Success(bytes) => decode_json(&bytes).map(Some),
            Value::Failure(failure) => Err(HandlerError::Terminal(failure)),
            _ => Err(self.sys_err(Error::new(
                codes::PROTOCOL_VIOLATION,
                "unexpected completion kind for get invocation output",
            ))),
        }
    }

    /// Request cancellation of another invocation.
    pub async fn cancel_invocation(
        &self,
        invocation_id: impl Into<String>,
    ) -> Result<(), HandlerError> {
        self.machine
            .sys_cancel_invocation(invocation_id.into())
            .await
            .map_err(|e| self.sys_err(e))
    }

    fn value_awaitable<T: DeserializeOwned + Send + 'static>(
        &self,
        result: AsyncResult,
    ) -> Awaitable<T> {
        let machine = self.machine.clone();
        Awaitable::new(async move {
            match result.resolve().await? {
                Value::Success(bytes) => decode_json(&bytes),
                Value::Void => decode_json(b"null"),
                Value::Failure(failure) => Err(HandlerError::Terminal(failure)),
                _ => Err(HandlerError::Retryable(machine.fail(Error::new(
                    codes::PROTOCOL_VIOLATION,
                    "unexpected completion kind",
                )))),
            }
        })
    }
}

fn millis_since_epoch(t: SystemTime) -> u64 {
    u64::try_from(
        t.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .expect("millis since Unix epoch should fit in u64")
}

fn validate_awakeable_id(id: &str) -> Result<(), HandlerError> {
    crate::machine::parse_awakeable_id(id)
        .map(drop)
        .map_err(|e| {
            HandlerError::Terminal(TerminalFailure {
                code: codes::BAD_REQUEST,
                message: e.to_string(),
            })
        })
}

fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, HandlerError> {
    serde_json::to_vec(value).map(Bytes::from).map_err(|e| {
        HandlerError::Terminal(TerminalFailure {
            code: codes::INTERNAL,
            message: format!("cannot serialize value: {e}"),
        })
    })
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, HandlerError> {
    serde_json::from_slice(bytes).map_err(|e| {
        HandlerError::Terminal(TerminalFailure {
            code: codes::INTERNAL,
            message: format!("cannot deserialize value: {e}"),
        })
    })
}

use crate::completions::CompletionRegistry;
use crate::error::{
    codes, Error, INPUT_CLOSED_WHILE_WAITING_ENTRIES, MISSING_CONTENT_TYPE,
    UNEXPECTED_NON_ENTRY_FRAME,
};
use crate::headers::HeaderMap;
use crate::journal::Journal;
use crate::protocol::messages::{
    ErrorMessage, ProtocolMessage, StartMessage, SuspensionMessage,
};
use crate::protocol::{
    Decoder, Encoder, FrameTag, RawFrame, Version, FIRST_AWAKEABLE_SIGNAL_INDEX,
};
use crate::retries::RetryPolicy;
use crate::state::EagerState;
use crate::{HandlerError, Header, Input, ResponseHead};

use std::borrow::Cow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::SeedableRng;
use strum::IntoStaticStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

mod ops;
mod reader;

pub(crate) use ops::{awakeable_id, parse_awakeable_id, AsyncResult, RunEnter};

const CONTENT_TYPE: &str = "content-type";

/// Explicit per-endpoint configuration, passed through the registry instead
/// of living in process-wide state.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Retry policy applied to `run` closures that don't specify their own.
    pub default_run_retry_policy: RetryPolicy,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            default_run_retry_policy: RetryPolicy::default(),
        }
    }
}

/// The outcome a handler hands back to the machine.
pub type HandlerResult = Result<Bytes, HandlerError>;

/// Type-erased handler entry point, as registered in a
/// [`crate::registry::HandlerDefinition`].
pub type HandlerFn = Arc<
    dyn Fn(crate::context::Context, Input) -> BoxFuture<'static, HandlerResult> + Send + Sync,
>;

#[derive(Debug, IntoStaticStr)]
pub(crate) enum State {
    WaitingStart,
    WaitingReplayEntries,
    Replaying,
    Processing,
    Closed { failure: Option<Error> },
}

impl State {
    pub(crate) fn as_unexpected_state(&self, event: &'static str) -> Error {
        match self {
            State::Closed { failure: Some(e) } => e.clone(),
            State::Closed { failure: None } => Error::closed(event),
            s => Error::unexpected_state(s.into(), event),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StartInfo {
    pub(crate) id: Bytes,
    pub(crate) debug_id: String,
    pub(crate) key: String,
    pub(crate) random_seed: u64,
    pub(crate) known_entries: u32,
}

/// Outgoing half of the stream: encodes frames and writes them out. Shared
/// between the handler task and the reader task behind an async mutex, so a
/// journal-append/wire-emit pair is atomic with respect to other emitters.
pub(crate) struct FrameSink {
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    encoder: Encoder,
    closed: bool,
}

impl FrameSink {
    fn unconnected() -> Self {
        Self {
            writer: None,
            encoder: Encoder::new(),
            closed: false,
        }
    }

    fn connect(&mut self, writer: Box<dyn AsyncWrite + Send + Unpin>) {
        self.writer = Some(writer);
    }

    pub(crate) async fn send<M: ProtocolMessage>(&mut self, msg: &M) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        let buf = self.encoder.encode(msg);
        let writer = self
            .writer
            .as_mut()
            .expect("the sink is connected before the first frame is emitted");
        writer
            .write_all(&buf)
            .await
            .map_err(|e| Error::new(codes::INTERNAL, format!("cannot write frame: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::new(codes::INTERNAL, format!("cannot flush frame: {e}")))?;
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}

pub(crate) struct Shared {
    pub(crate) options: MachineOptions,
    version: Version,
    pub(crate) state: Mutex<State>,
    pub(crate) start_info: OnceLock<StartInfo>,
    pub(crate) journal: Mutex<Journal>,
    pub(crate) eager_state: Mutex<EagerState>,
    pub(crate) completions: CompletionRegistry,
    pub(crate) writer: tokio::sync::Mutex<FrameSink>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) next_signal_index: AtomicU32,
    pub(crate) run_retry_policy: Mutex<RetryPolicy>,
    pub(crate) rng: Mutex<StdRng>,
}

/// Per-invocation engine: consumes the framed stream, maintains the journal,
/// services handler operations and guarantees replay determinism. Born on
/// stream open, drives one handler to completion, never reused.
#[derive(Clone)]
pub struct InvocationStateMachine {
    pub(crate) shared: Arc<Shared>,
}

// --- Bound checks
#[allow(unused)]
const fn is_send<T: Send>() {}
const _: () = is_send::<InvocationStateMachine>();

impl InvocationStateMachine {
    #[instrument(level = "trace", skip_all)]
    pub fn new(request_headers: impl HeaderMap, options: MachineOptions) -> Result<Self, Error> {
        let version = request_headers
            .extract(CONTENT_TYPE)
            .map_err(|e| {
                Error::new(
                    codes::BAD_REQUEST,
                    format!("cannot read '{CONTENT_TYPE}' header: {e:?}"),
                )
            })?
            .ok_or(MISSING_CONTENT_TYPE)?
            .parse::<Version>()?;

        let default_run_retry_policy = options.default_run_retry_policy.clone();
        Ok(Self {
            shared: Arc::new(Shared {
                options,
                version,
                state: Mutex::new(State::WaitingStart),
                start_info: OnceLock::new(),
                journal: Mutex::new(Journal::default()),
                eager_state: Mutex::new(EagerState::default()),
                completions: CompletionRegistry::new(),
                writer: tokio::sync::Mutex::new(FrameSink::unconnected()),
                cancellation: CancellationToken::new(),
                next_signal_index: AtomicU32::new(FIRST_AWAKEABLE_SIGNAL_INDEX),
                run_retry_policy: Mutex::new(default_run_retry_policy),
                rng: Mutex::new(StdRng::seed_from_u64(0)),
            }),
        })
    }

    pub fn response_head(&self) -> ResponseHead {
        ResponseHead {
            status_code: 200,
            headers: vec![Header {
                key: Cow::Borrowed(CONTENT_TYPE),
                value: Cow::Borrowed(self.shared.version.content_type()),
            }],
            version: self.shared.version,
        }
    }

    pub fn version(&self) -> Version {
        self.shared.version
    }

    fn debug_invocation_id(&self) -> String {
        self.shared
            .start_info
            .get()
            .map(|si| si.debug_id.clone())
            .unwrap_or_default()
    }

    fn journal_index(&self) -> i64 {
        self.shared.journal.lock().unwrap().last_index()
    }

    /// Drive one invocation over the given stream halves to completion.
    ///
    /// Reads the Start frame and the replayed journal prefix, spawns the
    /// reader task, runs the handler and emits the closing frames.
    #[instrument(
        level = "debug",
        skip_all,
        fields(keel.protocol.version = %self.shared.version),
        err
    )]
    pub async fn run<R, W>(
        self,
        handler: HandlerFn,
        mut reader: R,
        writer: W,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.shared
            .writer
            .lock()
            .await
            .connect(Box::new(writer));

        // Collect Start and the known journal prefix before executing
        // anything.
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::with_capacity(8 * 1024);
        while !self.is_ready_to_execute()? {
            let read = reader
                .read_buf(&mut buf)
                .await
                .map_err(|e| self.fail(Error::new(codes::INTERNAL, format!("cannot read stream: {e}"))))?;
            if read == 0 {
                let e = self.fail(INPUT_CLOSED_WHILE_WAITING_ENTRIES);
                self.report_failure(&e).await;
                return Err(e);
            }
            decoder.push(buf.split().freeze());
            while !self.is_ready_to_execute()? {
                let Some(frame) = decoder.consume_next() else {
                    break;
                };
                if let Err(e) = self.apply_init_frame(frame) {
                    let e = self.fail(e);
                    self.report_failure(&e).await;
                    return Err(e);
                }
            }
            // Frames left in the decoder beyond this point belong to the
            // reader task.
        }

        // From here on a dedicated task drains the stream: completions,
        // cancellation and end-of-input all arrive concurrently with the
        // handler.
        let reader_task = tokio::spawn(reader::reader_loop(self.clone(), reader, decoder));

        let outcome = self.drive_handler(handler).await;

        reader_task.abort();
        let _ = reader_task.await;
        outcome
    }

    async fn drive_handler(&self, handler: HandlerFn) -> Result<(), Error> {
        let input = match self.take_input() {
            Ok(input) => input,
            Err(e) => {
                let e = self.fail(e);
                self.report_failure(&e).await;
                return Err(e);
            }
        };

        let ctx = crate::context::Context::new(self.clone());
        let result = (handler)(ctx, input).await;

        match result {
            Ok(output) => {
                debug!("Writing invocation result success value");
                if let Err(e) = self.write_output(output).await {
                    let e = self.fail(e);
                    self.report_failure(&e).await;
                    return Err(e);
                }
                self.close_with(None);
                let mut sink = self.shared.writer.lock().await;
                sink.send(&crate::protocol::messages::EndMessage::default())
                    .await?;
                sink.close();
                Ok(())
            }
            Err(HandlerError::Terminal(failure)) => {
                debug!("Invocation completed with terminal failure [{}]", failure.code);
                self.close_with(None);
                let mut sink = self.shared.writer.lock().await;
                sink.send(&ErrorMessage {
                    code: failure.code as u32,
                    message: failure.message,
                    ..Default::default()
                })
                .await?;
                sink.send(&crate::protocol::messages::EndMessage::default())
                    .await?;
                sink.close();
                Ok(())
            }
            Err(HandlerError::Cancelled) => {
                debug!("Invocation cancelled");
                self.close_with(None);
                let mut sink = self.shared.writer.lock().await;
                sink.send(&ErrorMessage {
                    code: u32::from(codes::CONFLICT),
                    message: "invocation cancelled".to_owned(),
                    ..Default::default()
                })
                .await?;
                sink.send(&crate::protocol::messages::EndMessage::default())
                    .await?;
                sink.close();
                Ok(())
            }
            Err(HandlerError::Suspended(_)) => {
                let waiting_entries = self.shared.completions.pending_indexes();
                debug!(
                    "Suspending invocation, waiting on entries {:?}",
                    waiting_entries
                );
                self.close_with(None);
                let mut sink = self.shared.writer.lock().await;
                sink.send(&SuspensionMessage { waiting_entries }).await?;
                sink.close();
                Ok(())
            }
            Err(HandlerError::Retryable(error)) => {
                let error = self.fail(error);
                self.report_failure(&error).await;
                Err(error)
            }
        }
    }

    /// Emit an Error frame on best effort and close the stream without End,
    /// leaving the supervisor free to retry.
    pub(crate) async fn report_failure(&self, error: &Error) {
        warn!(
            keel.invocation.id = %self.debug_invocation_id(),
            keel.journal.index = self.journal_index(),
            "Invocation failed: {error}"
        );
        let mut sink = self.shared.writer.lock().await;
        let _ = sink
            .send(&ErrorMessage {
                code: error.code as u32,
                message: error.message.clone().into_owned(),
                stacktrace: error.stacktrace.clone().into_owned(),
                related_entry_index: error.related_entry.as_ref().map(|re| re.index),
                next_retry_delay_ms: error.retry_after.map(|d| d.as_millis() as u64),
            })
            .await;
        sink.close();
    }

    fn is_ready_to_execute(&self) -> Result<bool, Error> {
        match &*self.shared.state.lock().unwrap() {
            State::WaitingStart | State::WaitingReplayEntries => Ok(false),
            State::Replaying | State::Processing => Ok(true),
            s @ State::Closed { .. } => Err(s.as_unexpected_state("IsReadyToExecute")),
        }
    }

    fn apply_init_frame(&self, frame: RawFrame) -> Result<(), Error> {
        let tag = match frame.tag() {
            Ok(tag) => tag,
            Err(unknown) => {
                warn!("Skipping frame with unknown tag: {unknown}");
                return Ok(());
            }
        };

        let mut state = self.shared.state.lock().unwrap();
        match &*state {
            State::WaitingStart => {
                let start = frame.decode_to::<StartMessage>(-1).map_err(Error::from)?;
                self.on_start(&mut state, start)
            }
            State::WaitingReplayEntries => {
                if tag.is_entry() {
                    let missing = self.shared.journal.lock().unwrap().push_replay_frame(frame);
                    if missing == 0 {
                        *state = State::Replaying;
                    }
                    Ok(())
                } else if tag.is_completion() {
                    // Journaled completions may trail the entries; park them
                    // in the registry until the matching await.
                    drop(state);
                    self.apply_completion_frame(tag, frame)
                } else {
                    Err(UNEXPECTED_NON_ENTRY_FRAME)
                }
            }
            s => Err(s.as_unexpected_state("NewFrame")),
        }
    }

    fn on_start(&self, state: &mut State, start: StartMessage) -> Result<(), Error> {
        debug!(
            keel.invocation.id = %start.debug_id,
            "Start invocation, known entries: {}",
            start.known_entries
        );

        let eager = EagerState::new(
            !start.partial_state,
            start
                .state_map
                .into_iter()
                .map(|e| {
                    Ok((
                        String::from_utf8(e.key.to_vec()).map_err(|e| {
                            Error::new(
                                codes::PROTOCOL_VIOLATION,
                                format!("eager state key is not valid UTF-8: {e}"),
                            )
                        })?,
                        e.value,
                    ))
                })
                .collect::<Result<Vec<_>, Error>>()?,
        );
        *self.shared.eager_state.lock().unwrap() = eager;

        if let Some(policy_override) = start.retry_policy {
            *self.shared.run_retry_policy.lock().unwrap() = policy_override.into();
        }
        *self.shared.rng.lock().unwrap() = StdRng::seed_from_u64(start.random_seed);

        self.shared.journal.lock().unwrap().initialize(start.known_entries);
        let known_entries = start.known_entries;
        self.shared
            .start_info
            .set(StartInfo {
                id: start.id,
                debug_id: start.debug_id,
                key: start.key,
                random_seed: start.random_seed,
                known_entries,
            })
            .expect("start info is only set once");

        *state = if known_entries > 0 {
            State::WaitingReplayEntries
        } else {
            State::Processing
        };
        Ok(())
    }

    /// Route a completion notification (or the cancel signal) into the
    /// registry. Called from the init loop and from the reader task.
    pub(crate) fn apply_completion_frame(
        &self,
        tag: FrameTag,
        frame: RawFrame,
    ) -> Result<(), Error> {
        if tag == FrameTag::CancelSignal {
            debug!(
                keel.invocation.id = %self.debug_invocation_id(),
                "Received cancel signal"
            );
            self.shared.cancellation.cancel();
            self.shared.completions.cancel_all();
            return Ok(());
        }

        let completion = frame.decode_as_completion().map_err(Error::from)?;
        let result = completion.result.ok_or_else(|| {
            Error::new(
                codes::PROTOCOL_VIOLATION,
                format!("completion for entry {} carries no result", completion.entry_index),
            )
        })?;
        match crate::Value::try_from(result)? {
            crate::Value::Failure(failure) => self
                .shared
                .completions
                .try_fail(completion.entry_index, failure),
            value => self
                .shared
                .completions
                .try_complete(completion.entry_index, value),
        }
        Ok(())
    }

    pub(crate) fn expect_start_info(&self) -> StartInfo {
        self.shared
            .start_info
            .get()
            .expect("state is past WaitingStart")
            .clone()
    }

    pub(crate) fn is_replaying(&self) -> bool {
        matches!(&*self.shared.state.lock().unwrap(), State::Replaying)
    }

    pub(crate) fn is_processing(&self) -> bool {
        matches!(&*self.shared.state.lock().unwrap(), State::Processing)
    }

    /// Record a fatal failure: transition to Closed, poison pending awaits.
    /// The first failure wins; later ones are returned as-is for logging.
    pub(crate) fn fail(&self, error: Error) -> Error {
        let mut state = self.shared.state.lock().unwrap();
        match &*state {
            State::Closed {
                failure: Some(first),
            } => first.clone(),
            _ => {
                *state = State::Closed {
                    failure: Some(error.clone()),
                };
                drop(state);
                self.shared.completions.fail_all(error.clone());
                error
            }
        }
    }

    fn close_with(&self, failure: Option<Error>) {
        *self.shared.state.lock().unwrap() = State::Closed { failure };
    }
}

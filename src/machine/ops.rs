use super::{InvocationStateMachine, State};
use crate::completions::{CompletionFuture, SlotResult};
use crate::error::{codes, BadAwakeableIdError, EntryMetadata, Error, MISSING_INPUT_ENTRY};
use crate::journal::Entry;
use crate::protocol::messages::{
    completion_result, AttachInvocationMessage, AwakeableMessage, CallMessage,
    ClearAllStateMessage, ClearStateMessage, CompletableEntryMessage, CompleteAwakeableMessage,
    CompletePromiseMessage, EntryMessage, GetInvocationOutputMessage, GetPromiseMessage,
    GetStateKeysMessage, GetStateMessage, InputMessage, OneWayCallMessage, OutputMessage,
    PeekPromiseMessage, Payload, RunMessage, SetStateMessage, SleepMessage, SendSignalMessage,
};
use crate::protocol::CANCEL_SIGNAL_INDEX;
use crate::state::{EagerGetState, EagerGetStateKeys};
use crate::{
    HandlerError, Header, Input, NonEmptyValue, RunExitResult, SuspendedError, Target, Value,
};

use std::borrow::Cow;
use std::mem::size_of;
use std::sync::atomic::Ordering;

use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use tracing::debug;

/// Outcome of pushing one entry through the journal dispatch.
pub(crate) enum AppliedEntry<M> {
    /// The entry was consumed from the replayed journal prefix.
    Replayed { index: u32, msg: M },
    /// A fresh entry was appended and its command frame emitted.
    Appended { index: u32 },
}

/// Result of a completable operation: either already known (from the
/// replayed journal or the eager cache) or awaiting a completion slot.
pub(crate) enum AsyncResult {
    Ready(Value),
    Pending(CompletionFuture),
}

impl AsyncResult {
    pub(crate) async fn resolve(self) -> Result<Value, HandlerError> {
        match self {
            AsyncResult::Ready(value) => Ok(value),
            AsyncResult::Pending(fut) => match fut.await {
                SlotResult::Value(value) => Ok(value),
                SlotResult::Cancelled => Err(HandlerError::Cancelled),
                SlotResult::Suspended => Err(HandlerError::Suspended(SuspendedError)),
                SlotResult::Fatal(error) => Err(HandlerError::Retryable(error)),
            },
        }
    }
}

/// Outcome of entering a `run` step.
pub(crate) enum RunEnter {
    /// The step already executed in a previous attempt; this is its recorded
    /// result.
    Replayed(NonEmptyValue),
    /// First execution: the caller must run the closure and journal the
    /// outcome through [`InvocationStateMachine::sys_run_exit`].
    Execute,
}

impl InvocationStateMachine {
    /// Consume the Input entry (index 0) and expose the invocation input.
    pub(crate) fn take_input(&self) -> Result<Input, Error> {
        {
            let state = self.shared.state.lock().unwrap();
            match &*state {
                State::Replaying => {}
                State::Processing => return Err(MISSING_INPUT_ENTRY),
                s => return Err(s.as_unexpected_state("TakeInput")),
            }
        }

        let (_, msg) = self
            .shared
            .journal
            .lock()
            .unwrap()
            .pop_replay(&InputMessage::default())?;
        self.finish_replay_if_caught_up();

        let start_info = self.expect_start_info();
        Ok(Input {
            invocation_id: start_info.debug_id,
            random_seed: start_info.random_seed,
            key: start_info.key,
            headers: msg
                .headers
                .into_iter()
                .map(|h| Header {
                    key: Cow::Owned(h.key),
                    value: Cow::Owned(h.value),
                })
                .collect(),
            input: msg.value.map(|p| p.content).unwrap_or_default(),
        })
    }

    pub(crate) fn finish_replay_if_caught_up(&self) {
        let caught_up = !self.shared.journal.lock().unwrap().is_replaying();
        if caught_up {
            let mut state = self.shared.state.lock().unwrap();
            if matches!(&*state, State::Replaying) {
                *state = State::Processing;
            }
        }
    }

    /// Core journal dispatch: during replay consume and check the next
    /// recorded entry; during processing append a fresh one and emit its
    /// command frame. The append/emit pair happens under the writer lock, so
    /// frames always leave in journal order.
    pub(crate) async fn apply_entry<M: EntryMessage>(
        &self,
        sys_name: &'static str,
        expected: M,
    ) -> Result<AppliedEntry<M>, Error> {
        let mut sink = self.shared.writer.lock().await;

        let replaying = {
            let state = self.shared.state.lock().unwrap();
            match &*state {
                State::Replaying => true,
                State::Processing => false,
                s => return Err(s.as_unexpected_state(sys_name)),
            }
        };

        if replaying {
            let entry_name = expected.entry_name();
            let (index, msg) = {
                let mut journal = self.shared.journal.lock().unwrap();
                let index = journal.next_index();
                journal.pop_replay(&expected).map_err(|e| {
                    e.with_related_entry(EntryMetadata {
                        index,
                        ty: M::TAG,
                        name: (!entry_name.is_empty()).then(|| Cow::Owned(entry_name.clone())),
                    })
                })?
            };
            self.finish_replay_if_caught_up();
            Ok(AppliedEntry::Replayed { index, msg })
        } else {
            let index = self
                .shared
                .journal
                .lock()
                .unwrap()
                .append(Entry::new(M::TAG, expected.entry_name(), false));
            sink.send(&expected).await?;
            Ok(AppliedEntry::Appended { index })
        }
    }

    async fn apply_completable_entry<M: CompletableEntryMessage>(
        &self,
        sys_name: &'static str,
        expected: M,
    ) -> Result<AsyncResult, Error> {
        match self.apply_entry(sys_name, expected).await? {
            AppliedEntry::Replayed { index, msg } => match msg.take_result() {
                Some(result) => {
                    self.shared.journal.lock().unwrap().mark_completed(index);
                    Ok(AsyncResult::Ready(Value::try_from(result)?))
                }
                // Not completed in the recorded journal: the supervisor
                // delivers (or already delivered) the completion separately.
                None => Ok(AsyncResult::Pending(
                    self.shared.completions.get_or_register(index),
                )),
            },
            AppliedEntry::Appended { index } => Ok(AsyncResult::Pending(
                self.shared.completions.register(index)?,
            )),
        }
    }

    // --- State

    pub(crate) async fn sys_state_get(&self, key: String) -> Result<AsyncResult, Error> {
        if self.is_processing() {
            debug!("Executing 'Get state {key}'");
        }
        let expected = GetStateMessage {
            key: Bytes::from(key.clone()),
            result: None,
        };

        // The previous execution journaled this read iff the next recorded
        // entry is a GetState for the same key; otherwise it was served from
        // the eager cache and left no trace.
        let journaled_on_previous_run = self.is_replaying()
            && self
                .shared
                .journal
                .lock()
                .unwrap()
                .peek_replay_matches(&expected);
        if journaled_on_previous_run {
            return self.apply_completable_entry("SysStateGet", expected).await;
        }

        let eager = self.shared.eager_state.lock().unwrap().get(&key);
        match eager {
            EagerGetState::Value(value) => Ok(AsyncResult::Ready(Value::Success(value))),
            EagerGetState::Default => Ok(AsyncResult::Ready(Value::Void)),
            EagerGetState::Unknown => self.apply_completable_entry("SysStateGet", expected).await,
        }
    }

    /// Record a value learned from a GetState completion, so later reads of
    /// the same key are served locally.
    pub(crate) fn learn_state(&self, key: String, value: Option<Bytes>) {
        self.shared.eager_state.lock().unwrap().learn(key, value);
    }

    pub(crate) async fn sys_state_get_keys(&self) -> Result<AsyncResult, Error> {
        if self.is_processing() {
            debug!("Executing 'Get state keys'");
        }
        let expected = GetStateKeysMessage { result: None };

        let journaled_on_previous_run = self.is_replaying()
            && self
                .shared
                .journal
                .lock()
                .unwrap()
                .peek_replay_matches(&expected);
        if journaled_on_previous_run {
            return self
                .apply_completable_entry("SysStateGetKeys", expected)
                .await;
        }

        let eager = self.shared.eager_state.lock().unwrap().get_keys();
        match eager {
            EagerGetStateKeys::Keys(keys) => Ok(AsyncResult::Ready(Value::StateKeys(keys))),
            EagerGetStateKeys::Unknown => {
                self.apply_completable_entry("SysStateGetKeys", expected)
                    .await
            }
        }
    }

    pub(crate) async fn sys_state_set(&self, key: String, value: Bytes) -> Result<(), Error> {
        if self.is_processing() {
            debug!("Executing 'Set state {key}'");
        }
        self.shared
            .eager_state
            .lock()
            .unwrap()
            .set(key.clone(), value.clone());
        self.apply_entry(
            "SysStateSet",
            SetStateMessage {
                key: Bytes::from(key),
                value,
            },
        )
        .await
        .map(drop)
    }

    pub(crate) async fn sys_state_clear(&self, key: String) -> Result<(), Error> {
        if self.is_processing() {
            debug!("Executing 'Clear state {key}'");
        }
        self.shared.eager_state.lock().unwrap().clear(key.clone());
        self.apply_entry(
            "SysStateClear",
            ClearStateMessage {
                key: Bytes::from(key),
            },
        )
        .await
        .map(drop)
    }

    pub(crate) async fn sys_state_clear_all(&self) -> Result<(), Error> {
        if self.is_processing() {
            debug!("Executing 'Clear all state keys'");
        }
        self.shared.eager_state.lock().unwrap().clear_all();
        self.apply_entry("SysStateClearAll", ClearAllStateMessage::default())
            .await
            .map(drop)
    }

    // --- Sleep

    pub(crate) async fn sys_sleep(
        &self,
        wake_up_time: u64,
        name: String,
    ) -> Result<AsyncResult, Error> {
        self.apply_completable_entry(
            "SysSleep",
            SleepMessage {
                wake_up_time,
                name,
                result: None,
            },
        )
        .await
    }

    // --- Calls

    pub(crate) async fn sys_call(
        &self,
        target: Target,
        parameter: Bytes,
    ) -> Result<AsyncResult, Error> {
        if self.is_processing() {
            debug!("Executing 'Call {}/{}'", target.service, target.handler);
        }
        self.apply_completable_entry(
            "SysCall",
            CallMessage {
                service_name: target.service,
                handler_name: target.handler,
                key: target.key.unwrap_or_default(),
                headers: target
                    .headers
                    .into_iter()
                    .map(crate::protocol::messages::Header::from)
                    .collect(),
                parameter,
                name: String::new(),
                result: None,
            },
        )
        .await
    }

    pub(crate) async fn sys_send(
        &self,
        target: Target,
        parameter: Bytes,
        invoke_time: u64,
    ) -> Result<(), Error> {
        if self.is_processing() {
            debug!("Executing 'Send to {}/{}'", target.service, target.handler);
        }
        self.apply_entry(
            "SysOneWayCall",
            OneWayCallMessage {
                service_name: target.service,
                handler_name: target.handler,
                key: target.key.unwrap_or_default(),
                headers: target
                    .headers
                    .into_iter()
                    .map(crate::protocol::messages::Header::from)
                    .collect(),
                parameter,
                invoke_time,
                name: String::new(),
            },
        )
        .await
        .map(drop)
    }

    // --- Awakeables

    pub(crate) async fn sys_awakeable(&self) -> Result<(String, AsyncResult), Error> {
        if self.is_processing() {
            debug!("Executing 'Awakeable'");
        }
        // Signal indexes are handed out in program order, so the identifier
        // is stable across replay.
        let signal_index = self
            .shared
            .next_signal_index
            .fetch_add(1, Ordering::Relaxed);
        let id = awakeable_id(&self.expect_start_info().id, signal_index);
        let result = self
            .apply_completable_entry("SysAwakeable", AwakeableMessage::default())
            .await?;
        Ok((id, result))
    }

    pub(crate) async fn sys_complete_awakeable(
        &self,
        id: String,
        value: NonEmptyValue,
    ) -> Result<(), Error> {
        if self.is_processing() {
            debug!("Executing 'Complete awakeable {id}'");
        }
        self.apply_entry(
            "SysCompleteAwakeable",
            CompleteAwakeableMessage {
                id,
                result: Some(value.into()),
            },
        )
        .await
        .map(drop)
    }

    // --- Durable promises

    pub(crate) async fn sys_get_promise(&self, key: String) -> Result<AsyncResult, Error> {
        if self.is_processing() {
            debug!("Executing 'Await promise {key}'");
        }
        self.apply_completable_entry(
            "SysGetPromise",
            GetPromiseMessage {
                key,
                ..Default::default()
            },
        )
        .await
    }

    pub(crate) async fn sys_peek_promise(&self, key: String) -> Result<AsyncResult, Error> {
        if self.is_processing() {
            debug!("Executing 'Peek promise {key}'");
        }
        self.apply_completable_entry(
            "SysPeekPromise",
            PeekPromiseMessage {
                key,
                ..Default::default()
            },
        )
        .await
    }

    pub(crate) async fn sys_complete_promise(
        &self,
        key: String,
        value: NonEmptyValue,
    ) -> Result<(), Error> {
        if self.is_processing() {
            debug!("Executing 'Complete promise {key}'");
        }
        self.apply_entry(
            "SysCompletePromise",
            CompletePromiseMessage {
                key,
                completion: Some(value.into()),
                ..Default::default()
            },
        )
        .await
        .map(drop)
    }

    // --- Cross-invocation operations

    pub(crate) async fn sys_attach_invocation(
        &self,
        invocation_id: String,
    ) -> Result<AsyncResult, Error> {
        if self.is_processing() {
            debug!("Executing 'Attach invocation {invocation_id}'");
        }
        self.apply_completable_entry(
            "SysAttachInvocation",
            AttachInvocationMessage {
                invocation_id,
                ..Default::default()
            },
        )
        .await
    }

    pub(crate) async fn sys_get_invocation_output(
        &self,
        invocation_id: String,
    ) -> Result<AsyncResult, Error> {
        if self.is_processing() {
            debug!("Executing 'Get invocation output {invocation_id}'");
        }
        self.apply_completable_entry(
            "SysGetInvocationOutput",
            GetInvocationOutputMessage {
                invocation_id,
                ..Default::default()
            },
        )
        .await
    }

    pub(crate) async fn sys_cancel_invocation(
        &self,
        target_invocation_id: String,
    ) -> Result<(), Error> {
        if self.is_processing() {
            debug!("Executing 'Cancel invocation {target_invocation_id}'");
        }
        self.apply_entry(
            "SysCancelInvocation",
            SendSignalMessage {
                target_invocation_id,
                signal_index: CANCEL_SIGNAL_INDEX,
                result: Some(completion_result::Result::Void(Default::default())),
            },
        )
        .await
        .map(drop)
    }

    // --- Run

    pub(crate) fn sys_run_enter(&self, name: &str) -> Result<RunEnter, Error> {
        let expected = RunMessage {
            name: name.to_owned(),
            result: None,
        };

        {
            let state = self.shared.state.lock().unwrap();
            match &*state {
                State::Replaying => {}
                State::Processing => return Ok(RunEnter::Execute),
                s => return Err(s.as_unexpected_state("SysRunEnter")),
            }
        }

        let (index, msg) = {
            let mut journal = self.shared.journal.lock().unwrap();
            let index = journal.next_index();
            journal.pop_replay(&expected).map_err(|e| {
                e.with_related_entry(EntryMetadata {
                    index,
                    ty: crate::protocol::FrameTag::Run,
                    name: Some(Cow::Owned(name.to_owned())),
                })
            })?
        };
        self.finish_replay_if_caught_up();

        let result = msg.result.ok_or_else(|| {
            Error::new(
                codes::PROTOCOL_VIOLATION,
                format!("replayed run entry {index} carries no recorded result"),
            )
        })?;
        self.shared.journal.lock().unwrap().mark_completed(index);

        match result {
            completion_result::Result::Value(b) => Ok(RunEnter::Replayed(NonEmptyValue::Success(b))),
            completion_result::Result::Failure(f) => {
                Ok(RunEnter::Replayed(NonEmptyValue::Failure(f.into())))
            }
            _ => Err(Error::new(
                codes::PROTOCOL_VIOLATION,
                format!("replayed run entry {index} carries an unexpected result kind"),
            )),
        }
    }

    pub(crate) async fn sys_run_exit(
        &self,
        name: String,
        result: RunExitResult,
    ) -> Result<NonEmptyValue, Error> {
        let value = match result {
            RunExitResult::Success(b) => {
                if self.is_processing() {
                    debug!("Journaling side effect '{name}' completed with success");
                }
                NonEmptyValue::Success(b)
            }
            RunExitResult::TerminalFailure(f) => {
                if self.is_processing() {
                    debug!("Journaling side effect '{name}' completed with terminal failure");
                }
                NonEmptyValue::Failure(f)
            }
        };

        let msg = RunMessage {
            name,
            result: Some(value.clone().into()),
        };
        match self.apply_entry("SysRunExit", msg).await? {
            AppliedEntry::Appended { index } => {
                self.shared.journal.lock().unwrap().mark_completed(index);
                Ok(value)
            }
            AppliedEntry::Replayed { index, .. } => Err(Error::new(
                codes::PROTOCOL_VIOLATION,
                format!("run exit for entry {index} cannot happen during replay"),
            )),
        }
    }

    // --- Output

    pub(crate) async fn write_output(&self, output: Bytes) -> Result<(), Error> {
        self.apply_entry(
            "SysWriteOutput",
            OutputMessage {
                headers: vec![],
                value: Some(Payload::from(output)),
            },
        )
        .await
        .map(drop)
    }

    // --- Deterministic randomness

    pub(crate) fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        f(&mut self.shared.rng.lock().unwrap())
    }
}

// --- Awakeable identifiers

const AWAKEABLE_ID_PREFIX: &str = "sign_1";

const INDIFFERENT_PAD: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_encode_padding(false);
const URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, INDIFFERENT_PAD);

pub(crate) fn awakeable_id(id: &[u8], signal_index: u32) -> String {
    let mut input_buf = BytesMut::with_capacity(id.len() + size_of::<u32>());
    input_buf.put_slice(id);
    input_buf.put_u32(signal_index);
    format!("{AWAKEABLE_ID_PREFIX}{}", URL_SAFE.encode(input_buf.freeze()))
}

pub(crate) fn parse_awakeable_id(id: &str) -> Result<(Bytes, u32), BadAwakeableIdError> {
    let encoded = id
        .strip_prefix(AWAKEABLE_ID_PREFIX)
        .ok_or_else(|| BadAwakeableIdError {
            id: id.to_owned(),
            reason: Cow::Borrowed("missing signal prefix"),
        })?;
    let decoded = URL_SAFE.decode(encoded).map_err(|e| BadAwakeableIdError {
        id: id.to_owned(),
        reason: Cow::Owned(format!("invalid base64: {e}")),
    })?;
    if decoded.len() < size_of::<u32>() {
        return Err(BadAwakeableIdError {
            id: id.to_owned(),
            reason: Cow::Borrowed("too short to carry a signal index"),
        });
    }
    let (raw_id, index_bytes) = decoded.split_at(decoded.len() - size_of::<u32>());
    let signal_index = u32::from_be_bytes(index_bytes.try_into().expect("split at four bytes"));
    Ok((Bytes::copy_from_slice(raw_id), signal_index))
}

use crate::error::codes;
use crate::protocol::FrameTag;
use crate::{Error, TerminalFailure, Value};
use bytes::Bytes;

/// A payload struct that maps 1:1 to a frame tag.
pub trait ProtocolMessage: prost::Message + Default {
    const TAG: FrameTag;
}

/// A message that occupies a journal slot.
pub trait EntryMessage: ProtocolMessage {
    /// User-facing entry name recorded in the journal. Empty when unnamed.
    fn entry_name(&self) -> String {
        String::new()
    }

    /// Identity check between a recorded entry and the entry the handler is
    /// about to produce during replay. Deliberately ignores recorded results.
    fn replay_eq(&self, other: &Self) -> bool;
}

/// An entry whose result is delivered asynchronously and may be recorded
/// inline when the entry is replayed after completion.
pub trait CompletableEntryMessage: EntryMessage {
    fn is_completed(&self) -> bool;
    fn take_result(self) -> Option<completion_result::Result>;
}

// --- Common payload fragments

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Void {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Failure {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

/// Typed value wrapper carried by Input/Output frames.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    #[prost(bytes = "bytes", tag = "1")]
    pub content: Bytes,
}

impl From<Bytes> for Payload {
    fn from(content: Bytes) -> Self {
        Payload { content }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateKeys {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub keys: ::prost::alloc::vec::Vec<Bytes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateEntry {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetryPolicyOverride {
    #[prost(uint32, optional, tag = "1")]
    pub max_attempts: ::core::option::Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub initial_interval_ms: ::core::option::Option<u64>,
    #[prost(float, optional, tag = "3")]
    pub factor: ::core::option::Option<f32>,
    #[prost(uint64, optional, tag = "4")]
    pub max_interval_ms: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub max_duration_ms: ::core::option::Option<u64>,
}

/// Shared result oneof. Entry messages record it inline once completed;
/// completion notifications deliver it by entry index. Tags 10..=14 are
/// reserved for it in every message embedding it.
pub mod completion_result {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "10")]
        Void(super::Void),
        #[prost(bytes = "bytes", tag = "11")]
        Value(Bytes),
        #[prost(message, tag = "12")]
        Failure(super::Failure),
        #[prost(message, tag = "13")]
        StateKeys(super::StateKeys),
    }
}

// --- Control frames

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub id: Bytes,
    #[prost(string, tag = "2")]
    pub debug_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub known_entries: u32,
    #[prost(string, tag = "4")]
    pub key: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub random_seed: u64,
    #[prost(message, repeated, tag = "6")]
    pub state_map: ::prost::alloc::vec::Vec<StateEntry>,
    #[prost(bool, tag = "7")]
    pub partial_state: bool,
    #[prost(message, optional, tag = "8")]
    pub retry_policy: ::core::option::Option<RetryPolicyOverride>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorMessage {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub stacktrace: ::prost::alloc::string::String,
    #[prost(uint32, optional, tag = "4")]
    pub related_entry_index: ::core::option::Option<u32>,
    /// Delay the supervisor should apply before the next retry, milliseconds.
    #[prost(uint64, optional, tag = "5")]
    pub next_retry_delay_ms: ::core::option::Option<u64>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct EndMessage {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SuspensionMessage {
    #[prost(uint32, repeated, tag = "1")]
    pub waiting_entries: ::prost::alloc::vec::Vec<u32>,
}

/// Template shared by every completion notification tag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletionMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

// --- Journal entries

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InputMessage {
    #[prost(message, repeated, tag = "1")]
    pub headers: ::prost::alloc::vec::Vec<Header>,
    #[prost(message, optional, tag = "2")]
    pub value: ::core::option::Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputMessage {
    #[prost(message, repeated, tag = "1")]
    pub headers: ::prost::alloc::vec::Vec<Header>,
    #[prost(message, optional, tag = "2")]
    pub value: ::core::option::Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetStateMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearStateMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ClearAllStateMessage {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateKeysMessage {
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SleepMessage {
    /// Absolute wake-up time, milliseconds since the Unix epoch.
    #[prost(uint64, tag = "1")]
    pub wake_up_time: u64,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallMessage {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub handler_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub key: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub headers: ::prost::alloc::vec::Vec<Header>,
    #[prost(bytes = "bytes", tag = "5")]
    pub parameter: Bytes,
    #[prost(string, tag = "6")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OneWayCallMessage {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub handler_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub key: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub headers: ::prost::alloc::vec::Vec<Header>,
    #[prost(bytes = "bytes", tag = "5")]
    pub parameter: Bytes,
    /// Absolute invoke time, milliseconds since the Unix epoch. Zero means now.
    #[prost(uint64, tag = "6")]
    pub invoke_time: u64,
    #[prost(string, tag = "7")]
    pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AwakeableMessage {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompleteAwakeableMessage {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunMessage {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPromiseMessage {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeekPromiseMessage {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletePromiseMessage {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub completion: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendSignalMessage {
    #[prost(string, tag = "1")]
    pub target_invocation_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub signal_index: u32,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttachInvocationMessage {
    #[prost(string, tag = "1")]
    pub invocation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetInvocationOutputMessage {
    #[prost(string, tag = "1")]
    pub invocation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(oneof = "completion_result::Result", tags = "10, 11, 12, 13")]
    pub result: ::core::option::Option<completion_result::Result>,
}

// --- Trait impls

macro_rules! impl_protocol_message {
    ($msg:ty, $tag:ident) => {
        impl ProtocolMessage for $msg {
            const TAG: FrameTag = FrameTag::$tag;
        }
    };
}

macro_rules! impl_completable {
    ($msg:ty) => {
        impl CompletableEntryMessage for $msg {
            fn is_completed(&self) -> bool {
                self.result.is_some()
            }

            fn take_result(self) -> Option<completion_result::Result> {
                self.result
            }
        }
    };
}

impl_protocol_message!(StartMessage, Start);
impl_protocol_message!(SuspensionMessage, Suspension);
impl_protocol_message!(ErrorMessage, Error);
impl_protocol_message!(EndMessage, End);

impl_protocol_message!(InputMessage, Input);
impl EntryMessage for InputMessage {
    fn replay_eq(&self, _: &Self) -> bool {
        true
    }
}

impl_protocol_message!(OutputMessage, Output);
impl EntryMessage for OutputMessage {
    fn replay_eq(&self, _: &Self) -> bool {
        true
    }
}

impl_protocol_message!(GetStateMessage, GetState);
impl EntryMessage for GetStateMessage {
    fn entry_name(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl_completable!(GetStateMessage);

impl_protocol_message!(SetStateMessage, SetState);
impl EntryMessage for SetStateMessage {
    fn entry_name(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl_protocol_message!(ClearStateMessage, ClearState);
impl EntryMessage for ClearStateMessage {
    fn entry_name(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl_protocol_message!(ClearAllStateMessage, ClearAllState);
impl EntryMessage for ClearAllStateMessage {
    fn replay_eq(&self, _: &Self) -> bool {
        true
    }
}

impl_protocol_message!(GetStateKeysMessage, GetStateKeys);
impl EntryMessage for GetStateKeysMessage {
    fn replay_eq(&self, _: &Self) -> bool {
        true
    }
}
impl_completable!(GetStateKeysMessage);

impl_protocol_message!(SleepMessage, Sleep);
impl EntryMessage for SleepMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl_completable!(SleepMessage);

impl_protocol_message!(CallMessage, Call);
impl EntryMessage for CallMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name
            && self.handler_name == other.handler_name
            && self.key == other.key
            && self.name == other.name
    }
}
impl_completable!(CallMessage);

impl_protocol_message!(OneWayCallMessage, OneWayCall);
impl EntryMessage for OneWayCallMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name
            && self.handler_name == other.handler_name
            && self.key == other.key
            && self.name == other.name
    }
}

impl_protocol_message!(AwakeableMessage, Awakeable);
impl EntryMessage for AwakeableMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl_completable!(AwakeableMessage);

impl_protocol_message!(CompleteAwakeableMessage, CompleteAwakeable);
impl EntryMessage for CompleteAwakeableMessage {
    fn replay_eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl_protocol_message!(RunMessage, Run);
impl EntryMessage for RunMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl_completable!(RunMessage);

impl_protocol_message!(GetPromiseMessage, GetPromise);
impl EntryMessage for GetPromiseMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.key == other.key && self.name == other.name
    }
}
impl_completable!(GetPromiseMessage);

impl_protocol_message!(PeekPromiseMessage, PeekPromise);
impl EntryMessage for PeekPromiseMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.key == other.key && self.name == other.name
    }
}
impl_completable!(PeekPromiseMessage);

impl_protocol_message!(CompletePromiseMessage, CompletePromise);
impl EntryMessage for CompletePromiseMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.key == other.key && self.name == other.name
    }
}

impl_protocol_message!(SendSignalMessage, SendSignal);
impl EntryMessage for SendSignalMessage {
    fn replay_eq(&self, other: &Self) -> bool {
        self.target_invocation_id == other.target_invocation_id
            && self.signal_index == other.signal_index
    }
}

impl_protocol_message!(AttachInvocationMessage, AttachInvocation);
impl EntryMessage for AttachInvocationMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.invocation_id == other.invocation_id && self.name == other.name
    }
}
impl_completable!(AttachInvocationMessage);

impl_protocol_message!(GetInvocationOutputMessage, GetInvocationOutput);
impl EntryMessage for GetInvocationOutputMessage {
    fn entry_name(&self) -> String {
        self.name.clone()
    }

    fn replay_eq(&self, other: &Self) -> bool {
        self.invocation_id == other.invocation_id && self.name == other.name
    }
}
impl_completable!(GetInvocationOutputMessage);

// --- Result extraction

impl TryFrom<completion_result::Result> for Value {
    type Error = Error;

    fn try_from(value: completion_result::Result) -> Result<Self, Self::Error> {
        Ok(match value {
            completion_result::Result::Void(_) => Value::Void,
            completion_result::Result::Value(b) => Value::Success(b),
            completion_result::Result::Failure(f) => Value::Failure(f.into()),
            completion_result::Result::StateKeys(state_keys) => {
                let mut keys = state_keys
                    .keys
                    .into_iter()
                    .map(|b| {
                        String::from_utf8(b.to_vec()).map_err(|e| {
                            Error::new(
                                codes::PROTOCOL_VIOLATION,
                                format!("state keys are not valid UTF-8: {e}"),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                keys.sort();
                Value::StateKeys(keys)
            }
        })
    }
}

impl From<crate::NonEmptyValue> for completion_result::Result {
    fn from(value: crate::NonEmptyValue) -> Self {
        match value {
            crate::NonEmptyValue::Success(b) => completion_result::Result::Value(b),
            crate::NonEmptyValue::Failure(f) => completion_result::Result::Failure(f.into()),
        }
    }
}

impl From<(String, String)> for Header {
    fn from((key, value): (String, String)) -> Self {
        Self { key, value }
    }
}

impl From<TerminalFailure> for Failure {
    fn from(value: TerminalFailure) -> Self {
        Self {
            code: value.code as u32,
            message: value.message,
        }
    }
}

impl From<Failure> for TerminalFailure {
    fn from(value: Failure) -> Self {
        Self {
            code: value.code as u16,
            message: value.message,
        }
    }
}

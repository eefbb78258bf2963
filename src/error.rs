use crate::protocol::{ContentTypeError, DecodingError, FrameTag};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Numeric invocation error codes carried by Error frames. The 4xx block is
/// client-visible; the 57x block flags violations of the execution contract
/// between SDK and supervisor.
pub mod codes {
    pub const BAD_REQUEST: u16 = 400;
    pub const CONFLICT: u16 = 409;
    pub const UNSUPPORTED_MEDIA_TYPE: u16 = 415;
    pub const INTERNAL: u16 = 500;
    pub const JOURNAL_MISMATCH: u16 = 570;
    pub const PROTOCOL_VIOLATION: u16 = 571;
    pub const CLOSED: u16 = 598;
    pub const SUSPENDED: u16 = 599;
}

/// Coordinates of the journal entry an error relates to, for diagnostics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct EntryMetadata {
    pub(crate) index: u32,
    pub(crate) ty: FrameTag,
    pub(crate) name: Option<Cow<'static, str>>,
}

impl fmt::Display for EntryMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?}", self.index, self.ty)?;
        if let Some(name) = &self.name {
            write!(f, " ({name})")?;
        }
        Ok(())
    }
}

/// A non-terminal invocation failure: protocol violations, transport
/// problems, retry exhaustion. Terminal business failures are
/// [`crate::TerminalFailure`] instead.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Error {
    pub(crate) code: u16,
    pub(crate) message: Cow<'static, str>,
    pub(crate) stacktrace: Cow<'static, str>,
    pub(crate) related_entry: Option<EntryMetadata>,
    pub(crate) retry_after: Option<Duration>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(related_entry) = &self.related_entry {
            write!(f, " at entry {related_entry}")?;
        }
        if !self.stacktrace.is_empty() {
            write!(f, "\n{}", self.stacktrace)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(code: u16, message: impl Into<Cow<'static, str>>) -> Self {
        Error {
            code,
            message: message.into(),
            stacktrace: Default::default(),
            related_entry: None,
            retry_after: None,
        }
    }

    const fn new_const(code: u16, message: &'static str) -> Self {
        Error {
            code,
            message: Cow::Borrowed(message),
            stacktrace: Cow::Borrowed(""),
            related_entry: None,
            retry_after: None,
        }
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INTERNAL, message)
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stacktrace(&self) -> &str {
        &self.stacktrace
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<Cow<'static, str>>) -> Self {
        self.stacktrace = stacktrace.into();
        self
    }

    /// Ask the supervisor to wait at least this long before retrying.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub(crate) fn with_related_entry(mut self, related_entry: EntryMetadata) -> Self {
        self.related_entry = Some(related_entry);
        self
    }

    // -- Canonical failures of the state machine

    pub(crate) fn unexpected_state(state: &'static str, event: &'static str) -> Self {
        Self::new(
            codes::PROTOCOL_VIOLATION,
            format!("operation '{event}' is not legal while the machine is '{state}'"),
        )
    }

    pub(crate) fn closed(event: &'static str) -> Self {
        Self::new(
            codes::CLOSED,
            format!("the invocation is already closed, '{event}' has no effect"),
        )
    }

    pub(crate) fn replay_exhausted(expected: FrameTag) -> Self {
        Self::new(
            codes::PROTOCOL_VIOLATION,
            format!(
                "the recorded journal ran dry: nothing left to replay for a '{expected}' entry"
            ),
        )
    }

    pub(crate) fn journal_mismatch(
        index: i64,
        ty: FrameTag,
        recorded: &str,
        current: &str,
    ) -> Self {
        Self::new(
            codes::JOURNAL_MISMATCH,
            format!(
                "this execution diverged from the recorded journal at index {index} ('{ty}' entry): \
                 the previous run recorded '{recorded}', this run produced '{current}'. \
                 Durable handlers must take the same path on every execution."
            ),
        )
    }
}

// -- Const errors

pub(crate) const MISSING_CONTENT_TYPE: Error = Error::new_const(
    codes::UNSUPPORTED_MEDIA_TYPE,
    "the request carries no content-type header, so no protocol version could be negotiated",
);

pub(crate) const UNEXPECTED_NON_ENTRY_FRAME: Error = Error::new_const(
    codes::PROTOCOL_VIOLATION,
    "received a control frame while the replay journal was still being collected",
);

pub(crate) const INPUT_CLOSED_WHILE_WAITING_ENTRIES: Error = Error::new_const(
    codes::PROTOCOL_VIOLATION,
    "the stream ended before the whole replay journal was received",
);

pub(crate) const MISSING_INPUT_ENTRY: Error = Error::new_const(
    codes::PROTOCOL_VIOLATION,
    "the recorded journal has no input entry at index 0",
);

// -- Awakeable identifiers

#[derive(Debug, thiserror::Error)]
#[error("'{id}' is not an awakeable identifier: {reason}")]
pub struct BadAwakeableIdError {
    pub(crate) id: String,
    pub(crate) reason: Cow<'static, str>,
}

// -- Conversions

impl From<ContentTypeError> for Error {
    fn from(value: ContentTypeError) -> Self {
        Error::new(codes::UNSUPPORTED_MEDIA_TYPE, value.to_string())
    }
}

impl From<DecodingError> for Error {
    fn from(value: DecodingError) -> Self {
        let code = match &value {
            DecodingError::EntryTypeMismatch { .. } => codes::JOURNAL_MISMATCH,
            _ => codes::PROTOCOL_VIOLATION,
        };
        Error::new(code, value.to_string())
    }
}

mod codec;
mod header;
pub(crate) mod messages;
mod version;

pub(crate) use codec::{Decoder, DecodingError, Encoder, RawFrame};
pub(crate) use header::FrameTag;
pub(crate) use version::ContentTypeError;
pub use version::Version;

/// Reserved signal index used by the supervisor to cancel an invocation.
pub(crate) const CANCEL_SIGNAL_INDEX: u32 = 1;

/// First signal index handed out to user awakeables; lower indexes are
/// reserved for protocol signals.
pub(crate) const FIRST_AWAKEABLE_SIGNAL_INDEX: u32 = 17;

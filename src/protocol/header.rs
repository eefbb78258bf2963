use std::fmt;

/// Size of the wire header: `tag:u16 | length:u32`, both big-endian.
pub(crate) const FRAME_HEADER_LEN: usize = 6;

type FrameTagId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown frame tag {0:#06x}")]
pub struct UnknownFrameTag(pub(crate) u16);

// Generates the FrameTag enum together with the conversions back and forth to
// the numeric tag id.
macro_rules! gen_frame_tag_enum {
    ($($variant:ident = $id:literal,)*) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum FrameTag {
            $($variant,)*
        }

        impl From<FrameTag> for FrameTagId {
            fn from(tag: FrameTag) -> Self {
                match tag {
                    $(FrameTag::$variant => $id,)*
                }
            }
        }

        impl TryFrom<FrameTagId> for FrameTag {
            type Error = UnknownFrameTag;

            fn try_from(value: FrameTagId) -> Result<Self, UnknownFrameTag> {
                match value {
                    $($id => Ok(FrameTag::$variant),)*
                    v => Err(UnknownFrameTag(v)),
                }
            }
        }
    };
}

gen_frame_tag_enum!(
    // Control frames
    Start = 0x0000,
    Suspension = 0x0002,
    Error = 0x0003,
    End = 0x0005,
    // Journal entries
    Input = 0x0400,
    Output = 0x0401,
    GetState = 0x0800,
    SetState = 0x0801,
    ClearState = 0x0802,
    ClearAllState = 0x0803,
    GetStateKeys = 0x0804,
    GetPromise = 0x0808,
    PeekPromise = 0x0809,
    CompletePromise = 0x080A,
    Sleep = 0x0C00,
    Call = 0x0C01,
    OneWayCall = 0x0C02,
    Awakeable = 0x0C03,
    CompleteAwakeable = 0x0C04,
    Run = 0x0C05,
    SendSignal = 0x0C06,
    AttachInvocation = 0x0C07,
    GetInvocationOutput = 0x0C08,
    // Completion notifications
    GetStateCompletion = 0x8000,
    GetStateKeysCompletion = 0x8001,
    SleepCompletion = 0x8002,
    CallCompletion = 0x8003,
    AwakeableCompletion = 0x8004,
    GetPromiseCompletion = 0x8005,
    PeekPromiseCompletion = 0x8006,
    AttachInvocationCompletion = 0x8007,
    GetInvocationOutputCompletion = 0x8008,
    CancelSignal = 0x800F,
);

impl FrameTag {
    /// True for frames that occupy a slot in the journal.
    pub fn is_entry(&self) -> bool {
        let id: FrameTagId = (*self).into();
        matches!(id & 0xFC00, 0x0400 | 0x0800 | 0x0C00)
    }

    /// True for completion notification frames delivered by the supervisor.
    pub fn is_completion(&self) -> bool {
        let id: FrameTagId = (*self).into();
        id & 0x8000 != 0
    }
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    tag: u16,
    length: u32,
}

impl FrameHeader {
    pub fn new(tag: FrameTag, length: u32) -> Self {
        FrameHeader {
            tag: tag.into(),
            length,
        }
    }

    pub(crate) fn from_raw(tag: u16, length: u32) -> Self {
        FrameHeader { tag, length }
    }

    /// The raw tag id; may not map to a known [`FrameTag`].
    pub fn raw_tag(&self) -> u16 {
        self.tag
    }

    pub fn tag(&self) -> Result<FrameTag, UnknownFrameTag> {
        self.tag.try_into()
    }

    pub fn frame_length(&self) -> u32 {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::{Buf, BufMut, BytesMut};

    fn roundtrip(tag: FrameTag, length: u32) {
        let header = FrameHeader::new(tag, length);
        let mut buf = BytesMut::new();
        buf.put_u16(header.raw_tag());
        buf.put_u32(header.frame_length());
        assert_eq!(buf.len(), FRAME_HEADER_LEN);

        let mut read = buf.freeze();
        let decoded = FrameHeader::from_raw(read.get_u16(), read.get_u32());
        assert_eq!(decoded.tag().unwrap(), tag);
        assert_eq!(decoded.frame_length(), length);
    }

    #[test]
    fn header_roundtrip() {
        roundtrip(FrameTag::Start, 22);
        roundtrip(FrameTag::GetState, 0);
        roundtrip(FrameTag::Run, 10341);
        roundtrip(FrameTag::CallCompletion, u32::MAX);
    }

    #[test]
    fn unknown_tag_is_preserved() {
        let header = FrameHeader::from_raw(0xFFFF, 12);
        assert_eq!(header.tag(), Err(UnknownFrameTag(0xFFFF)));
        assert_eq!(header.raw_tag(), 0xFFFF);
    }

    #[test]
    fn tag_partitions() {
        assert!(!FrameTag::Start.is_entry());
        assert!(!FrameTag::Suspension.is_entry());
        assert!(FrameTag::Input.is_entry());
        assert!(FrameTag::Output.is_entry());
        assert!(FrameTag::SetState.is_entry());
        assert!(FrameTag::Run.is_entry());
        assert!(!FrameTag::CallCompletion.is_entry());
        assert!(FrameTag::CallCompletion.is_completion());
        assert!(FrameTag::CancelSignal.is_completion());
        assert!(!FrameTag::Run.is_completion());
    }
}

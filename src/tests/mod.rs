mod awakeables;
mod failures;
mod promises;
mod suspensions;

use super::*;

use crate::machine::HandlerFn;
use crate::protocol::messages::{
    completion_result, CompletionMessage, InputMessage, OutputMessage, Payload, ProtocolMessage,
    StartMessage,
};
use crate::protocol::{Decoder, Encoder, FrameTag, RawFrame};

use std::future::Future;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::FutureExt;
use googletest::prelude::*;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// --- Test infra

pub(crate) fn test_headers() -> Vec<(String, String)> {
    vec![(
        "content-type".to_owned(),
        Version::maximum_supported_version().content_type().to_owned(),
    )]
}

/// Builds the supervisor side of an invocation stream, runs a handler
/// against the machine over an in-memory duplex, and hands back the emitted
/// frames for assertion.
pub(crate) struct TestInvocation {
    frames: Vec<Bytes>,
    encoder: Encoder,
    options: MachineOptions,
}

impl TestInvocation {
    pub(crate) fn new() -> Self {
        Self {
            frames: vec![],
            encoder: Encoder::new(),
            options: MachineOptions::default(),
        }
    }

    pub(crate) fn with_options(options: MachineOptions) -> Self {
        Self {
            options,
            ..Self::new()
        }
    }

    pub(crate) fn input<M: ProtocolMessage>(mut self, msg: M) -> Self {
        self.frames.push(self.encoder.encode(&msg));
        self
    }

    pub(crate) fn completion(mut self, tag: FrameTag, msg: CompletionMessage) -> Self {
        assert!(tag.is_completion());
        self.frames.push(self.encoder.encode_with_tag(tag, &msg));
        self
    }

    /// Inject a raw frame, bypassing tag validation. Used to exercise the
    /// unknown-tag skip path.
    pub(crate) fn raw_frame(mut self, tag: u16, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(6 + payload.len());
        buf.put_u16(tag);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        self.frames.push(buf.freeze());
        self
    }

    pub(crate) async fn run<F, Fut>(self, handler: F) -> TestOutput
    where
        F: Fn(Context, Input) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let machine =
            InvocationStateMachine::new(test_headers(), self.options).expect("version negotiated");
        assert_that!(
            machine.response_head().headers,
            contains(eq(Header {
                key: std::borrow::Cow::Borrowed("content-type"),
                value: std::borrow::Cow::Borrowed(
                    Version::maximum_supported_version().content_type()
                ),
            }))
        );

        let (mut supervisor, service) = tokio::io::duplex(1 << 20);
        for frame in &self.frames {
            supervisor.write_all(frame).await.unwrap();
        }
        // Half-close: the machine sees EOF once it drained the journal and
        // any trailing completions.
        supervisor.shutdown().await.unwrap();

        let handler_fn: HandlerFn = Arc::new(move |ctx, input| handler(ctx, input).boxed());
        let (service_read, service_write) = tokio::io::split(service);
        let serve_result = machine.run(handler_fn, service_read, service_write).await;

        let mut raw = Vec::new();
        supervisor.read_to_end(&mut raw).await.unwrap();
        let mut decoder = Decoder::new();
        decoder.push(Bytes::from(raw));

        TestOutput {
            decoder,
            serve_result,
        }
    }
}

pub(crate) struct TestOutput {
    decoder: Decoder,
    pub(crate) serve_result: std::result::Result<(), Error>,
}

impl TestOutput {
    pub(crate) fn next_decoded<M: ProtocolMessage>(&mut self) -> Option<M> {
        self.decoder
            .consume_next()
            .map(|frame| frame.decode_to::<M>(0).unwrap())
    }
}

impl Iterator for TestOutput {
    type Item = RawFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.consume_next()
    }
}

// --- Frame builders

pub(crate) fn start_message(known_entries: u32) -> StartMessage {
    StartMessage {
        id: Bytes::from_static(b"abc123"),
        debug_id: "abc123".to_owned(),
        known_entries,
        key: String::new(),
        random_seed: 0,
        state_map: vec![],
        partial_state: true,
        retry_policy: None,
    }
}

pub(crate) fn input_message(b: impl AsRef<[u8]>) -> InputMessage {
    InputMessage {
        headers: vec![],
        value: Some(Payload::from(Bytes::copy_from_slice(b.as_ref()))),
    }
}

pub(crate) fn completion_value(entry_index: u32, b: impl AsRef<[u8]>) -> CompletionMessage {
    CompletionMessage {
        entry_index,
        result: Some(completion_result::Result::Value(Bytes::copy_from_slice(
            b.as_ref(),
        ))),
    }
}

pub(crate) fn completion_void(entry_index: u32) -> CompletionMessage {
    CompletionMessage {
        entry_index,
        result: Some(completion_result::Result::Void(Default::default())),
    }
}

pub(crate) fn completion_failure(
    entry_index: u32,
    code: u16,
    message: impl Into<String>,
) -> CompletionMessage {
    CompletionMessage {
        entry_index,
        result: Some(completion_result::Result::Failure(
            crate::protocol::messages::Failure {
                code: code as u32,
                message: message.into(),
            },
        )),
    }
}

pub(crate) fn json(value: &impl Serialize) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap())
}

pub(crate) fn output_success(b: impl AsRef<[u8]>) -> OutputMessage {
    OutputMessage {
        headers: vec![],
        value: Some(Payload::from(Bytes::copy_from_slice(b.as_ref()))),
    }
}

// --- Version negotiation

#[test]
fn reject_missing_content_type() {
    let err = InvocationStateMachine::new(Vec::<(String, String)>::new(), Default::default())
        .err()
        .unwrap();
    assert_eq!(err.code(), codes::UNSUPPORTED_MEDIA_TYPE);
}

#[rstest::rstest]
#[case("application/vnd.keel.invocation.v1")]
#[case("application/vnd.keel.invocation.v99")]
#[case("application/json")]
fn reject_unsupported_content_types(#[case] content_type: &str) {
    let err = InvocationStateMachine::new(
        vec![("content-type".to_owned(), content_type.to_owned())],
        Default::default(),
    )
    .err()
    .unwrap();
    assert_eq!(err.code(), codes::UNSUPPORTED_MEDIA_TYPE);
}

#[test]
fn accept_minimum_supported_version() {
    let machine = InvocationStateMachine::new(
        vec![(
            "content-type".to_owned(),
            Version::minimum_supported_version().content_type().to_owned(),
        )],
        Default::default(),
    )
    .unwrap();
    assert_eq!(machine.version(), Version::minimum_supported_version());
}

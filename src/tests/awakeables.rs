use super::*;

use crate::protocol::messages::{
    AwakeableMessage, CompleteAwakeableMessage, EndMessage, OutputMessage,
};
use test_log::test;

#[test(tokio::test)]
async fn awakeable_resolves_with_external_completion() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .completion(
            FrameTag::AwakeableCompletion,
            completion_value(1, json(&"signal-payload")),
        )
        .run(|ctx, _input| async move {
            let (id, awaitable) = ctx.awakeable::<String>().await?;
            assert!(id.starts_with("sign_1"));
            let payload = awaitable.await?;
            Ok(json(&payload))
        })
        .await;

    assert_eq!(
        output.next_decoded::<AwakeableMessage>().unwrap(),
        AwakeableMessage::default()
    );
    assert_eq!(
        output.next_decoded::<OutputMessage>().unwrap(),
        output_success(json(&"signal-payload"))
    );
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn awakeable_ids_encode_the_invocation_and_signal_index() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .completion(FrameTag::AwakeableCompletion, completion_void(1))
        .completion(FrameTag::AwakeableCompletion, completion_void(2))
        .run(|ctx, _input| async move {
            let (first, a) = ctx.awakeable::<()>().await?;
            let (second, b) = ctx.awakeable::<()>().await?;

            let (raw_a, index_a) = crate::machine::parse_awakeable_id(&first).unwrap();
            let (raw_b, index_b) = crate::machine::parse_awakeable_id(&second).unwrap();
            assert_eq!(raw_a, Bytes::from_static(b"abc123"));
            assert_eq!(raw_b, Bytes::from_static(b"abc123"));
            // Indexes are allocated sequentially from the reserved base.
            assert_eq!(index_b, index_a + 1);

            a.await?;
            b.await?;
            Ok(Bytes::from_static(b"null"))
        })
        .await;

    output.next_decoded::<AwakeableMessage>().unwrap();
    output.next_decoded::<AwakeableMessage>().unwrap();
    output.next_decoded::<OutputMessage>().unwrap();
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn resolve_awakeable_emits_a_complete_awakeable_command() {
    let id = crate::machine::awakeable_id(b"other-invocation", 19);
    let id_in_handler = id.clone();
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .run(move |ctx, _input| {
            let id = id_in_handler.clone();
            async move {
                ctx.resolve_awakeable(&id, &"done").await?;
                Ok(Bytes::from_static(b"null"))
            }
        })
        .await;

    assert_eq!(
        output.next_decoded::<CompleteAwakeableMessage>().unwrap(),
        CompleteAwakeableMessage {
            id,
            result: Some(completion_result::Result::Value(json(&"done"))),
        }
    );
    output.next_decoded::<OutputMessage>().unwrap();
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn reject_awakeable_carries_the_reason() {
    let id = crate::machine::awakeable_id(b"other-invocation", 19);
    let id_in_handler = id.clone();
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .run(move |ctx, _input| {
            let id = id_in_handler.clone();
            async move {
                ctx.reject_awakeable(&id, "no longer needed").await?;
                Ok(Bytes::from_static(b"null"))
            }
        })
        .await;

    let complete = output.next_decoded::<CompleteAwakeableMessage>().unwrap();
    assert!(matches!(
        complete.result,
        Some(completion_result::Result::Failure(ref f)) if f.message == "no longer needed"
    ));
    output.next_decoded::<OutputMessage>().unwrap();
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn resolving_a_malformed_awakeable_id_is_a_terminal_failure() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .run(|ctx, _input| async move {
            let res = ctx.resolve_awakeable("wake_9not-one-of-ours", &()).await;
            match res {
                Err(HandlerError::Terminal(f)) => {
                    assert_eq!(f.code, 400);
                    Ok(Bytes::from_static(b"null"))
                }
                other => panic!("expected terminal failure, got {other:?}"),
            }
        })
        .await;

    output.next_decoded::<OutputMessage>().unwrap();
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

use super::*;

use crate::protocol::messages::{
    CompletePromiseMessage, EndMessage, GetPromiseMessage, OutputMessage, PeekPromiseMessage,
};
use test_log::test;

#[test(tokio::test)]
async fn promise_blocks_until_resolved() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .completion(
            FrameTag::GetPromiseCompletion,
            completion_value(1, json(&"approved")),
        )
        .run(|ctx, _input| async move {
            let decision: String = ctx.promise("review").await?.await?;
            Ok(json(&decision))
        })
        .await;

    assert_eq!(
        output.next_decoded::<GetPromiseMessage>().unwrap(),
        GetPromiseMessage {
            key: "review".to_owned(),
            ..Default::default()
        }
    );
    assert_eq!(
        output.next_decoded::<OutputMessage>().unwrap(),
        output_success(json(&"approved"))
    );
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn peek_promise_returns_absent_without_blocking() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .completion(FrameTag::PeekPromiseCompletion, completion_void(1))
        .run(|ctx, _input| async move {
            let pending: Option<String> = ctx.peek_promise("review").await?;
            assert_eq!(pending, None);
            Ok(Bytes::from_static(b"null"))
        })
        .await;

    assert_eq!(
        output.next_decoded::<PeekPromiseMessage>().unwrap(),
        PeekPromiseMessage {
            key: "review".to_owned(),
            ..Default::default()
        }
    );
    output.next_decoded::<OutputMessage>().unwrap();
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn resolve_promise_is_local_and_fire_and_forget() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .run(|ctx, _input| async move {
            ctx.resolve_promise("review", &"approved").await?;
            Ok(Bytes::from_static(b"null"))
        })
        .await;

    assert_eq!(
        output.next_decoded::<CompletePromiseMessage>().unwrap(),
        CompletePromiseMessage {
            key: "review".to_owned(),
            completion: Some(completion_result::Result::Value(json(&"approved"))),
            ..Default::default()
        }
    );
    output.next_decoded::<OutputMessage>().unwrap();
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn reject_promise_writes_a_failure() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .run(|ctx, _input| async move {
            ctx.reject_promise("review", "withdrawn").await?;
            Ok(Bytes::from_static(b"null"))
        })
        .await;

    let complete = output.next_decoded::<CompletePromiseMessage>().unwrap();
    assert_eq!(complete.key, "review");
    assert!(matches!(
        complete.completion,
        Some(completion_result::Result::Failure(ref f)) if f.message == "withdrawn"
    ));
    output.next_decoded::<OutputMessage>().unwrap();
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn rejected_promise_surfaces_as_terminal_failure() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .completion(
            FrameTag::GetPromiseCompletion,
            completion_failure(1, 500, "withdrawn"),
        )
        .run(|ctx, _input| async move {
            let result: std::result::Result<String, _> = async { ctx.promise("review").await?.await }.await;
            match result {
                Err(HandlerError::Terminal(f)) => {
                    assert_eq!(f.message, "withdrawn");
                    Ok(json(&"handled"))
                }
                other => panic!("expected rejected promise, got {other:?}"),
            }
        })
        .await;

    output.next_decoded::<GetPromiseMessage>().unwrap();
    assert_eq!(
        output.next_decoded::<OutputMessage>().unwrap(),
        output_success(json(&"handled"))
    );
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

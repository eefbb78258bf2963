use super::*;

use crate::protocol::messages::{
    EndMessage, ErrorMessage, OutputMessage, RunMessage, SetStateMessage,
};
use crate::run::RunError;
use test_log::test;

#[test(tokio::test)]
async fn handler_terminal_failure_emits_error_then_end() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .run(|_ctx, _input| async move {
            Err(HandlerError::terminal(400u16, "invalid request"))
        })
        .await;

    let error = output.next_decoded::<ErrorMessage>().unwrap();
    assert_eq!(error.code, 400);
    assert_eq!(error.message, "invalid request");
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
    // A terminal failure concludes the invocation cleanly.
    assert!(output.serve_result.is_ok());
}

#[test(tokio::test)]
async fn replayed_run_name_disagreement_is_a_journal_mismatch() {
    let mut output = TestInvocation::new()
        .input(start_message(2))
        .input(input_message(b"{}"))
        .input(RunMessage {
            name: "recorded-step".to_owned(),
            result: Some(completion_result::Result::Value(Bytes::from_static(b"1"))),
        })
        .run(|ctx, _input| async move {
            let _: u32 = ctx
                .run("different-step", |_| async { Ok::<_, RunError>(1) })
                .await?;
            Ok(Bytes::from_static(b"null"))
        })
        .await;

    let error = output.next_decoded::<ErrorMessage>().unwrap();
    assert_eq!(error.code as u16, codes::JOURNAL_MISMATCH);
    // No End: the supervisor may retry.
    assert_eq!(output.next(), None);
    assert!(output.serve_result.is_err());
}

#[test(tokio::test)]
async fn replayed_entry_kind_disagreement_is_a_journal_mismatch() {
    let mut output = TestInvocation::new()
        .input(start_message(2))
        .input(input_message(b"{}"))
        .input(SetStateMessage {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"1"),
        })
        .run(|ctx, _input| async move {
            ctx.sleep(std::time::Duration::from_secs(1)).await?;
            Ok(Bytes::from_static(b"null"))
        })
        .await;

    let error = output.next_decoded::<ErrorMessage>().unwrap();
    assert_eq!(error.code as u16, codes::JOURNAL_MISMATCH);
    assert_eq!(output.next(), None);
    assert!(output.serve_result.is_err());
}

#[test(tokio::test)]
async fn unknown_frame_tags_are_skipped() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .raw_frame(0x7777, b"ignored payload")
        .completion(FrameTag::GetStateCompletion, completion_value(1, b"\"v\""))
        .run(|ctx, _input| async move {
            let value: String = ctx.get_state("k").await?.expect("present");
            Ok(json(&value))
        })
        .await;

    // The garbage frame did not derail the invocation.
    output.next().unwrap(); // GetState command
    assert_eq!(
        output.next_decoded::<OutputMessage>().unwrap(),
        output_success(b"\"v\"")
    );
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn zero_known_entries_is_a_protocol_violation() {
    let mut output = TestInvocation::new()
        .input(start_message(0))
        .run(|_ctx, _input| async move { Ok(Bytes::from_static(b"null")) })
        .await;

    let error = output.next_decoded::<ErrorMessage>().unwrap();
    assert_eq!(error.code as u16, codes::PROTOCOL_VIOLATION);
    assert_eq!(output.next(), None);
    assert!(output.serve_result.is_err());
}

#[test(tokio::test)]
async fn operations_after_close_fail() {
    let mut output = TestInvocation::new()
        .input(start_message(2))
        .input(input_message(b"{}"))
        .input(SetStateMessage {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"1"),
        })
        .run(|ctx, _input| async move {
            // Poison the machine with a journal mismatch, then try again.
            let first = ctx.sleep(std::time::Duration::from_secs(1)).await;
            let first_err = match first {
                Err(e) => e,
                Ok(()) => panic!("expected a journal mismatch"),
            };
            let second = ctx.set_state("k", &1).await;
            assert!(second.is_err());
            Err(first_err)
        })
        .await;

    let error = output.next_decoded::<ErrorMessage>().unwrap();
    assert_eq!(error.code as u16, codes::JOURNAL_MISMATCH);
    assert_eq!(output.next(), None);
    assert!(output.serve_result.is_err());
}

#[test(tokio::test)]
async fn cancellation_surfaces_to_awaiters() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .completion(FrameTag::CancelSignal, completion_void(0))
        .run(|ctx, _input| async move {
            let (_, awaitable) = ctx.awakeable::<()>().await?;
            match awaitable.await {
                Err(HandlerError::Cancelled) => Err(HandlerError::Cancelled),
                other => panic!("expected cancellation, got {other:?}"),
            }
        })
        .await;

    // Awakeable command, then the cancellation concludes the invocation.
    output.next().unwrap();
    let error = output.next_decoded::<ErrorMessage>().unwrap();
    assert_eq!(error.code as u16, codes::CONFLICT);
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
    assert!(output.serve_result.is_ok());
}

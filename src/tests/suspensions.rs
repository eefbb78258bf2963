use super::*;

use crate::protocol::messages::{
    AwakeableMessage, EndMessage, GetStateMessage, OutputMessage, SuspensionMessage,
};
use test_log::test;

#[test(tokio::test)]
async fn awaiting_without_a_completion_suspends() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .run(|ctx, _input| async move {
            let _: Option<String> = ctx.get_state("missing").await?;
            unreachable!("the await above suspends")
        })
        .await;

    assert_eq!(
        output.next_decoded::<GetStateMessage>().unwrap(),
        GetStateMessage {
            key: Bytes::from_static(b"missing"),
            result: None,
        }
    );
    assert_eq!(
        output.next_decoded::<SuspensionMessage>().unwrap(),
        SuspensionMessage {
            waiting_entries: vec![1],
        }
    );
    // Suspension closes the stream without End.
    assert_eq!(output.next(), None);
    assert!(output.serve_result.is_ok());
}

#[test(tokio::test)]
async fn suspension_lists_the_awaited_entry_only() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .completion(FrameTag::AwakeableCompletion, completion_void(1))
        .run(|ctx, _input| async move {
            let (_, first) = ctx.awakeable::<()>().await?;
            let (_, second) = ctx.awakeable::<()>().await?;
            first.await?;
            second.await?;
            unreachable!("the second awakeable is never completed")
        })
        .await;

    output.next_decoded::<AwakeableMessage>().unwrap();
    output.next_decoded::<AwakeableMessage>().unwrap();
    assert_eq!(
        output.next_decoded::<SuspensionMessage>().unwrap(),
        SuspensionMessage {
            waiting_entries: vec![2],
        }
    );
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn delivered_completion_prevents_suspension() {
    let mut output = TestInvocation::new()
        .input(start_message(1))
        .input(input_message(b"{}"))
        .completion(FrameTag::AwakeableCompletion, completion_value(1, b"\"ok\""))
        .run(|ctx, _input| async move {
            let (_, awaitable) = ctx.awakeable::<String>().await?;
            let value = awaitable.await?;
            Ok(json(&value))
        })
        .await;

    output.next_decoded::<AwakeableMessage>().unwrap();
    assert_eq!(
        output.next_decoded::<OutputMessage>().unwrap(),
        output_success(b"\"ok\"")
    );
    output.next_decoded::<EndMessage>().unwrap();
    assert_eq!(output.next(), None);
}

#[test(tokio::test)]
async fn replay_suspends_on_the_first_unresolved_await() {
    // The journal knows the awakeable entry but no completion ever arrived.
    let mut output = TestInvocation::new()
        .input(start_message(2))
        .input(input_message(b"{}"))
        .input(AwakeableMessage::default())
        .run(|ctx, _input| async move {
            let (_, awaitable) = ctx.awakeable::<()>().await?;
            awaitable.await?;
            unreachable!("replay has no completion for entry 1")
        })
        .await;

    // No new Awakeable command: the entry was replayed.
    assert_eq!(
        output.next_decoded::<SuspensionMessage>().unwrap(),
        SuspensionMessage {
            waiting_entries: vec![1],
        }
    );
    assert_eq!(output.next(), None);
}

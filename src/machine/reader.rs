use super::InvocationStateMachine;
use crate::error::{codes, Error};
use crate::protocol::Decoder;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{trace, warn};

/// Reader task: drains the incoming half of the stream for the rest of the
/// invocation, delivering completions into the registry and watching for the
/// cancel signal. Flags the registry when the input closes, which is what
/// turns pending awaits into suspensions.
pub(crate) async fn reader_loop<R>(
    machine: InvocationStateMachine,
    mut reader: R,
    mut decoder: Decoder,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        while let Some(frame) = decoder.consume_next() {
            let tag = match frame.tag() {
                Ok(tag) => tag,
                Err(unknown) => {
                    warn!("Skipping frame with unknown tag: {unknown}");
                    continue;
                }
            };

            let res = if tag.is_completion() {
                trace!("Applying completion frame {tag}");
                machine.apply_completion_frame(tag, frame)
            } else {
                Err(Error::new(
                    codes::PROTOCOL_VIOLATION,
                    format!("unexpected frame '{tag}' while the invocation is executing"),
                ))
            };

            if let Err(e) = res {
                let e = machine.fail(e);
                machine.report_failure(&e).await;
                return;
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                trace!("Input closed");
                machine.shared.completions.notify_input_closed();
                return;
            }
            Ok(_) => decoder.push(buf.split().freeze()),
            Err(e) => {
                let e = machine.fail(Error::new(
                    codes::INTERNAL,
                    format!("cannot read stream: {e}"),
                ));
                machine.report_failure(&e).await;
                return;
            }
        }
    }
}

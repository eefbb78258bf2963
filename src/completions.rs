use crate::error::{codes, Error};
use crate::{TerminalFailure, Value};

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tracing::trace;

/// What a completion slot resolves to.
#[derive(Debug, Clone)]
pub(crate) enum SlotResult {
    /// The supervisor (or the replayed journal) delivered a result.
    Value(Value),
    /// The invocation was cancelled while this slot was still pending.
    Cancelled,
    /// No result can ever arrive: the input closed. The invocation parks.
    Suspended,
    /// The machine hit a fatal error; the slot is poisoned with it.
    Fatal(Error),
}

enum Slot {
    Pending { waker: Option<Waker> },
    Delivered(SlotResult),
}

#[derive(Default)]
struct Inner {
    slots: HashMap<u32, Slot>,
    input_closed: bool,
    cancelled: bool,
    poisoned: Option<Error>,
}

impl Inner {
    fn deliver(&mut self, index: u32, result: SlotResult) {
        match self.slots.entry(index) {
            MapEntry::Occupied(mut entry) => {
                if matches!(entry.get(), Slot::Delivered(_)) {
                    // The supervisor must deliver at most one completion per
                    // entry.
                    trace!("Discarding duplicate completion for entry {index}");
                    return;
                }
                let previous = entry.insert(Slot::Delivered(result));
                if let Slot::Pending { waker: Some(waker) } = previous {
                    waker.wake();
                }
            }
            MapEntry::Vacant(entry) => {
                // Early arrival: keep it until the handler awaits.
                entry.insert(Slot::Delivered(result));
            }
        }
    }

    fn wake_all(&mut self) {
        for slot in self.slots.values_mut() {
            if let Slot::Pending { waker } = slot {
                if let Some(waker) = waker.take() {
                    waker.wake();
                }
            }
        }
    }
}

/// Concurrent map from entry index to a single-consumer result slot. The
/// handler task registers awaitables; the reader task delivers completions,
/// possibly before registration.
#[derive(Clone, Default)]
pub(crate) struct CompletionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl CompletionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install a fresh awaitable for `index`. Fails if one is already live.
    pub(crate) fn register(&self, index: u32) -> Result<CompletionFuture, Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.slots.entry(index) {
            MapEntry::Occupied(entry) => {
                if matches!(entry.get(), Slot::Pending { .. }) {
                    return Err(Error::new(
                        codes::PROTOCOL_VIOLATION,
                        format!("An awaitable for entry {index} is already registered"),
                    ));
                }
            }
            MapEntry::Vacant(entry) => {
                entry.insert(Slot::Pending { waker: None });
            }
        }
        Ok(CompletionFuture {
            inner: Arc::clone(&self.inner),
            index,
        })
    }

    /// Idempotent variant of [`register`](Self::register): a second call for
    /// the same index awaits the same slot.
    pub(crate) fn get_or_register(&self, index: u32) -> CompletionFuture {
        let mut inner = self.inner.lock().unwrap();
        inner
            .slots
            .entry(index)
            .or_insert(Slot::Pending { waker: None });
        CompletionFuture {
            inner: Arc::clone(&self.inner),
            index,
        }
    }

    pub(crate) fn try_complete(&self, index: u32, value: Value) {
        self.inner
            .lock()
            .unwrap()
            .deliver(index, SlotResult::Value(value));
    }

    pub(crate) fn try_fail(&self, index: u32, failure: TerminalFailure) {
        self.inner
            .lock()
            .unwrap()
            .deliver(index, SlotResult::Value(Value::Failure(failure)));
    }

    /// Resolve every live awaitable with cancellation. Completions delivered
    /// before the cancel are left consumable.
    pub(crate) fn cancel_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled = true;
        inner.wake_all();
    }

    /// Poison the registry with a fatal machine error. Every pending and
    /// future await resolves with it.
    pub(crate) fn fail_all(&self, error: Error) {
        let mut inner = self.inner.lock().unwrap();
        if inner.poisoned.is_none() {
            inner.poisoned = Some(error);
        }
        inner.wake_all();
    }

    /// Flag that no further frames can arrive. Pending awaits resolve as
    /// suspended but stay registered, so they can be listed in the
    /// Suspension frame.
    pub(crate) fn notify_input_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.input_closed = true;
        inner.wake_all();
    }

    /// Entry indexes with a registered-but-undelivered awaitable, ascending.
    pub(crate) fn pending_indexes(&self) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        let mut indexes: Vec<u32> = inner
            .slots
            .iter()
            .filter_map(|(index, slot)| matches!(slot, Slot::Pending { .. }).then_some(*index))
            .collect();
        indexes.sort_unstable();
        indexes
    }
}

/// Awaitable side of a completion slot. Single-consumer: resolving removes
/// the slot from the registry.
pub(crate) struct CompletionFuture {
    inner: Arc<Mutex<Inner>>,
    index: u32,
}

impl Future for CompletionFuture {
    type Output = SlotResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock().unwrap();

        if matches!(inner.slots.get(&self.index), Some(Slot::Delivered(_))) {
            let Some(Slot::Delivered(result)) = inner.slots.remove(&self.index) else {
                unreachable!()
            };
            return Poll::Ready(result);
        }

        if let Some(error) = &inner.poisoned {
            return Poll::Ready(SlotResult::Fatal(error.clone()));
        }
        if inner.cancelled {
            inner.slots.remove(&self.index);
            return Poll::Ready(SlotResult::Cancelled);
        }
        if inner.input_closed {
            // Keep the slot: it must show up in the Suspension frame.
            return Poll::Ready(SlotResult::Suspended);
        }

        let new_waker = cx.waker().clone();
        match inner.slots.entry(self.index) {
            MapEntry::Occupied(mut entry) => {
                if let Slot::Pending { waker } = entry.get_mut() {
                    *waker = Some(new_waker);
                }
            }
            MapEntry::Vacant(entry) => {
                entry.insert(Slot::Pending {
                    waker: Some(new_waker),
                });
            }
        }
        Poll::Pending
    }
}

//! Fan-out of committed store events to subscribers.
//!
//! A single pipe-draining task delivers every published event to every
//! matching subscriber, in order and synchronously: there is no buffering
//! beyond the one-slot handoff channels, so a slow subscriber suspends
//! publication rather than dropping or accumulating events.

use crate::store::{Inner, Store};
use proto_intake::Event;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct Subscriber {
    tx: mpsc::Sender<Event>,
    filter: Option<String>,
}

impl Store {
    /// Subscribe to the change feed.
    ///
    /// With a filter, an event is delivered iff its first object's
    /// descriptor kind or type equals the filter; without one, every event
    /// is delivered. A snapshot of current store contents arrives
    /// asynchronously as one ADD event before (or interleaved with) live
    /// events. A closed store returns an already-closed channel.
    pub fn subscribe(&self, filter: Option<String>) -> mpsc::Receiver<Event> {
        // One-slot channels: the sender parks until the subscriber receives.
        let (tx, rx) = mpsc::channel(1);
        if self.inner.closed.load(Ordering::Acquire) {
            return rx; // The sender just dropped, so the channel is closed.
        }

        self.inner.subscribers.lock().unwrap().push(Subscriber {
            tx: tx.clone(),
            filter,
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let snapshot = Store::snapshot_event(&inner);
            if !snapshot.objects.is_empty() {
                let _ = tx.send(snapshot).await;
            }
        });
        rx
    }

    /// Close the change feed: refuse new publishes, wait for in-flight
    /// operations to finish publishing, then close the pipe and every
    /// subscriber channel. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // No operation started after `closed` was set will publish; spin
        // until those already in flight have drained out of the pipe.
        while self.inner.ops.read() != 0 {
            tokio::task::yield_now().await;
        }
        // Dropping the sender closes the pipe, which ends the fan-out task.
        let _pipe = self.inner.pipe.lock().unwrap().take();
    }
}

pub(crate) async fn fan_out(inner: Arc<Inner>, mut pipe: mpsc::Receiver<Event>) {
    while let Some(event) = pipe.recv().await {
        // Snapshot the registry so its lock is never held across a send.
        let subscribers: Vec<(mpsc::Sender<Event>, Option<String>)> = inner
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.tx.clone(), s.filter.clone()))
            .collect();

        for (tx, filter) in subscribers {
            if !matches(filter.as_deref(), &event) {
                continue;
            }
            if tx.send(event.clone()).await.is_err() {
                // The receiver was dropped; deregister it.
                inner
                    .subscribers
                    .lock()
                    .unwrap()
                    .retain(|s| !s.tx.same_channel(&tx));
            }
        }
    }

    // Pipe closed: dropping the registered senders closes every
    // subscriber channel.
    inner.subscribers.lock().unwrap().clear();
}

fn matches(filter: Option<&str>, event: &Event) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let Some(descriptor) = event
        .objects
        .first()
        .and_then(|o| o.type_descriptor.as_ref())
    else {
        return false;
    };
    descriptor.kind == filter || descriptor.r#type == filter
}

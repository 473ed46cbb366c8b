//! In-process membership trackers
//!
//! Subsystems on the coordinator (recovery, placement, tooling) observe
//! membership changes through trackers. Every registry mutation first
//! enqueues the change on all trackers, then fires each tracker's callback,
//! so an observer's view of the event stream is always consistent with the
//! registry's.

use crate::coordinator::updates::EntryState;
use std::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerChangeEvent {
    ServerAdded,
    ServerCrashed,
    ServerRemoved,
}

/// A membership subscriber.
///
/// Both methods run with the coordinator lock held: implementations must
/// not call back into the server list, and should do no more than queue
/// the event and wake a consumer.
pub trait ServerTracker: Send {
    fn enqueue_change(&self, state: &EntryState, event: ServerChangeEvent);
    fn fire_callback(&self);
}

/// Tracker that forwards events over a channel, with an optional callback
/// fired after each batch of enqueues.
pub struct ChannelTracker {
    tx: mpsc::Sender<(EntryState, ServerChangeEvent)>,
    callback: Option<Box<dyn Fn() + Send>>,
}

impl ChannelTracker {
    pub fn new() -> (Self, mpsc::Receiver<(EntryState, ServerChangeEvent)>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx, callback: None }, rx)
    }

    pub fn with_callback(
        callback: Box<dyn Fn() + Send>,
    ) -> (Self, mpsc::Receiver<(EntryState, ServerChangeEvent)>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                tx,
                callback: Some(callback),
            },
            rx,
        )
    }
}

impl ServerTracker for ChannelTracker {
    fn enqueue_change(&self, state: &EntryState, event: ServerChangeEvent) {
        // A dropped receiver just means the subscriber went away.
        let _ = self.tx.send((state.clone(), event));
    }

    fn fire_callback(&self) {
        if let Some(callback) = &self.callback {
            callback();
        }
    }
}

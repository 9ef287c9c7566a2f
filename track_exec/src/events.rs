//! # Tracking events
//!
//! Notifications raised by the transport, driver and supervisor. Any number of subscribers can
//! register for events, each receiving its own copy over an `mpsc` channel. Subscribers which
//! have dropped their receiver are removed on the next emit.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::vision::TrackId;
use serde::Serialize;
use std::sync::{
    mpsc::{channel, Receiver, Sender},
    Arc, Mutex,
};

use crate::lock;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum TrackEvent {
    /// The servo link was established (`true`) or lost (`false`)
    ConnectionChanged(bool),

    /// A nonzero speed command was accepted by both drives.
    ///
    /// Units: RPM
    CommandSent { pan: i32, tilt: i32 },

    /// A control tick ran against the given target.
    ///
    /// Units: pixels
    TrackingUpdate {
        target_x: f64,
        target_y: f64,
        cx: f64,
        cy: f64,
    },

    /// The target is inside the deadzone
    TargetReached,

    /// The locked track was lost and the largest balloon is followed instead
    TargetSwitched {
        from: Option<TrackId>,
        to: Option<TrackId>,
    },

    /// The emergency stop was triggered
    EmergencyStopped,
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Fan-out of [`TrackEvent`]s to registered subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<TrackEvent>>>>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Receiver<TrackEvent> {
        let (tx, rx) = channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Send the event to every live subscriber.
    pub fn emit(&self, event: TrackEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event).is_ok());
    }

    /// Number of live subscribers, as of the last emit.
    pub fn num_subscribers(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

//! Fired-once signals built on channel disconnection.
//!
//! A [`Signal`]/[`SignalRx`] pair models a one-shot broadcast: firing (or
//! dropping) the `Signal` disconnects the channel, which makes every cloned
//! `SignalRx` immediately ready inside `crossbeam::select!`. No value is ever
//! sent; disconnection is the event.

use crossbeam::channel::{Receiver, Sender, TryRecvError, bounded};
use std::sync::Arc;
use thiserror::Error;

/// Returned by blocking operations interrupted by a fired signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// The firing half. Dropping it fires the signal.
pub struct Signal {
    tx: Option<Sender<()>>,
}

impl Signal {
    /// Fire the signal, waking every receiver. Idempotent by construction:
    /// the signal can only be consumed once.
    pub fn fire(mut self) {
        self.tx.take();
    }
}

/// The observing half. Cheap to clone; all clones trip together.
#[derive(Clone)]
pub struct SignalRx {
    rx: Receiver<()>,
    // Present only for `never()`: keeps the sender alive so the channel
    // can never disconnect.
    _hold: Option<Arc<Sender<()>>>,
}

impl SignalRx {
    pub fn is_fired(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// The underlying receiver, for use with `crossbeam::select!`. It
    /// becomes ready (with a disconnect error) when the signal fires.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// A new un-fired signal pair.
pub fn signal() -> (Signal, SignalRx) {
    let (tx, rx) = bounded(0);
    (Signal { tx: Some(tx) }, SignalRx { rx, _hold: None })
}

/// A receiver that is already fired.
pub fn fired() -> SignalRx {
    let (tx, rx) = bounded(0);
    drop(tx);
    SignalRx { rx, _hold: None }
}

/// A receiver that never fires.
pub fn never() -> SignalRx {
    let (tx, rx) = bounded(0);
    SignalRx {
        rx,
        _hold: Some(Arc::new(tx)),
    }
}

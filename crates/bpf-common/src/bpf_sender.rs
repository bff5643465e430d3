//! The [`BpfSender`] trait is the output channel used by probes to emit events.
//!
//! [`BpfSender::send`] must not block since it runs inline in probe context.
//! Delivery is best effort: a full channel drops the event, nobody retries.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::program::{BpfEvent, FixedPayload};

pub trait BpfSender<T>: Send + Sync + 'static {
    /// Must not block since it runs inline in probe context
    fn send(&self, event: BpfEvent<T>);
}

/// Simple implementation for tokio::mpsc bounded channels.
/// Sending with full channel will drop messages.
impl<T: Send + 'static> BpfSender<T> for mpsc::Sender<BpfEvent<T>> {
    fn send(&self, event: BpfEvent<T>) {
        if self.try_send(event).is_err() {
            log::warn!("dropping msg");
        }
    }
}

/// Consumers reading the fixed-layout wire format get raw records instead.
impl<T: FixedPayload + Send + 'static> BpfSender<T> for mpsc::Sender<Bytes> {
    fn send(&self, event: BpfEvent<T>) {
        if self.try_send(event.encode()).is_err() {
            log::warn!("dropping msg");
        }
    }
}

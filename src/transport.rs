//----------------------------------------------------------------------------------------------
// Module transport
// Transport capability consumed by the protocol engine
// The transport is byte oriented and packet preserving, framing (e.g. the XCP on
// Ethernet length/counter header) is its business, not the protocol engine's

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The transmit queue cannot accept the packet right now.
    /// On the DAQ path this surfaces as the overrun bit of the next DTO.
    #[error("transmit queue full")]
    QueueFull,

    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// Outbound half of the datagram transport.
/// `send` enqueues one CTO response or DTO packet, `flush` pushes prior sends
/// out. Both are called with packets no larger than the negotiated maximum.
pub trait XcpTransport: Send + Sync {
    fn send(&self, packet: &[u8]) -> Result<(), TransportError>;

    fn flush(&self) {}
}

//----------------------------------------------------------------------------------------------
// QueueTransport

/// In-memory transport collecting sent packets in a queue.
/// Serves single process embeddings that drain the queue from their own
/// transmit loop, and the integration tests, which pop and compare frames.
/// `refuse_next` makes the next send fail to exercise the overrun path.
#[derive(Debug, Default)]
pub struct QueueTransport {
    frames: Mutex<VecDeque<Vec<u8>>>,
    refuse_next: AtomicBool,
}

impl QueueTransport {
    pub fn new() -> QueueTransport {
        QueueTransport::default()
    }

    /// Take the oldest sent packet
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Let the next send fail with QueueFull
    pub fn refuse_next(&self) {
        self.refuse_next.store(true, Ordering::Relaxed);
    }
}

impl XcpTransport for QueueTransport {
    fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.refuse_next.swap(false, Ordering::Relaxed) {
            return Err(TransportError::QueueFull);
        }
        self.frames.lock().push_back(packet.to_vec());
        Ok(())
    }
}

//----------------------------------------------------------------------------------------------

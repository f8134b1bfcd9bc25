//! Transport layer interfaces and implementations
//!
//! The core only sees the traits below. The shaped side talks to a
//! stream-multiplexing transport (QUIC), the unshaped side to plain sockets
//! (TCP). Inbound events are delivered through the `*Events` traits, which
//! the drivers implement.
//!
//! Implementations must deliver inbound chunks smaller than the configured
//! queue capacity, and must retry a chunk refused with
//! [`FlowError::Backpressure`] after a short back-off. Outbound, they report
//! how many more bytes a writer accepts, and the core pops no more than that
//! from a ring, so a slow peer backs up into shared memory.

pub mod memory;
pub mod quic;
pub mod tcp;

use crate::error::{FlowError, TransportError};
use crate::flow::address::AddressPair;
use crate::protocol::ConnStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Stream handle on the shaped transport
pub type StreamId = u64;

/// Socket handle on the unshaped side
pub type SocketId = u64;

/// Multiplexed transport towards the peer middlebox
pub trait ShapedTransport: Send + Sync + 'static {
    /// Open a new bidirectional stream, waiting until the transport grants it.
    /// Called from the core's worker threads, never from async context.
    fn open_stream(&self) -> Result<StreamId, TransportError>;

    /// Queue bytes for writing on a stream
    fn send_on_stream(&self, stream: StreamId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Finish the sending side of a stream
    fn close_stream(&self, stream: StreamId) -> Result<(), TransportError>;

    /// Bytes `stream` accepts before its writer is saturated
    fn write_capacity(&self, stream: StreamId) -> usize;
}

/// Callbacks from a [`ShapedTransport`]
pub trait StreamEvents: Send + Sync + 'static {
    fn on_stream_data(&self, stream: StreamId, bytes: &[u8]) -> Result<(), FlowError>;

    /// No more bytes will arrive on `stream`
    fn on_stream_closed(&self, stream: StreamId, end: StreamEnd);
}

/// How an inbound stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The peer finished its sending side after its last byte
    Finished,
    /// Reset by the peer or lost with the connection
    Reset,
}

/// Plain sockets on the unshaped side
pub trait UnshapedTransport: Send + Sync + 'static {
    /// Start connecting to the flow's server; failures surface later as a
    /// FIN event for the returned socket
    fn connect(&self, address: &AddressPair) -> Result<SocketId, TransportError>;

    /// Queue bytes for writing on a socket
    fn send_on_socket(&self, socket: SocketId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Half-close: nothing more will be written to the socket
    fn close_socket(&self, socket: SocketId) -> Result<(), TransportError>;

    /// Bytes `socket` accepts before its writer is saturated
    fn write_capacity(&self, socket: SocketId) -> usize;
}

/// Callbacks from an [`UnshapedTransport`]
pub trait SocketEvents: Send + Sync + 'static {
    /// `hint` is `Syn` for a newly accepted socket (no bytes), `Ongoing` for
    /// data and `Fin` once the socket stops producing bytes
    fn on_socket_data(&self, socket: SocketId, client: &str, bytes: &[u8], hint: ConnStatus) -> Result<(), FlowError>;
}

/// Late-bound, non-owning reference from a transport to its event handler
pub struct EventSlot<E: ?Sized>(OnceLock<Weak<E>>);

impl<E: ?Sized> EventSlot<E> {
    pub fn new() -> Self {
        Self(OnceLock::new())
    }

    /// Install the handler; returns `false` if one was already set
    pub fn set(&self, events: Weak<E>) -> bool {
        self.0.set(events).is_ok()
    }

    /// The handler, if set and still alive
    pub fn get(&self) -> Option<Arc<E>> {
        self.0.get().and_then(Weak::upgrade)
    }
}

impl<E: ?Sized> Default for EventSlot<E> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum WriteOp {
    Data(Vec<u8>),
    Finish,
}

/// Core-facing end of a writer task's queue, bounded in unwritten bytes
pub(crate) struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteOp>,
    queued: Arc<AtomicUsize>,
    window: usize,
}

/// Writer-task end of a [`WriteQueue`]
pub(crate) struct WriteQueueReceiver {
    rx: mpsc::UnboundedReceiver<WriteOp>,
    queued: Arc<AtomicUsize>,
}

pub(crate) fn write_queue(window: usize) -> (WriteQueue, WriteQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    (
        WriteQueue {
            tx,
            queued: queued.clone(),
            window,
        },
        WriteQueueReceiver { rx, queued },
    )
}

impl WriteQueue {
    /// Room left in the window. A queue whose writer is gone reports
    /// unlimited room so the next write surfaces the failure.
    pub(crate) fn capacity(&self) -> usize {
        if self.tx.is_closed() {
            return usize::MAX;
        }
        self.window.saturating_sub(self.queued.load(Ordering::Acquire))
    }

    pub(crate) fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let len = bytes.len();
        self.queued.fetch_add(len, Ordering::AcqRel);
        self.tx.send(WriteOp::Data(bytes)).map_err(|_| {
            self.queued.fetch_sub(len, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    pub(crate) fn finish(&self) -> Result<(), TransportError> {
        self.tx.send(WriteOp::Finish).map_err(|_| TransportError::Closed)
    }
}

impl WriteQueueReceiver {
    pub(crate) async fn recv(&mut self) -> Option<WriteOp> {
        self.rx.recv().await
    }

    /// `len` bytes left the process
    pub(crate) fn written(&self, len: usize) {
        self.queued.fetch_sub(len, Ordering::AcqRel);
    }
}

/// Deliver one chunk, sleeping `backoff` between attempts while the core
/// reports backpressure
pub async fn deliver_with_backoff<F>(mut deliver: F, backoff: Duration) -> Result<(), FlowError>
where
    F: FnMut() -> Option<Result<(), FlowError>>,
{
    loop {
        match deliver() {
            Some(Err(FlowError::Backpressure(_))) => tokio::time::sleep(backoff).await,
            Some(result) => return result,
            // Handler gone: the process is shutting down
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_deliver_retries_backpressure() {
        let attempts = AtomicUsize::new(0);
        let result = deliver_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Some(if n < 3 { Err(FlowError::Backpressure(1)) } else { Ok(()) })
            },
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_deliver_passes_other_errors_through() {
        let result = deliver_with_backoff(|| Some(Err(FlowError::UnknownFlow(9))), Duration::from_millis(1)).await;
        assert_eq!(result, Err(FlowError::UnknownFlow(9)));
    }

    #[tokio::test]
    async fn test_write_queue_window_tracks_unwritten_bytes() {
        let (queue, mut rx) = write_queue(100);
        assert_eq!(queue.capacity(), 100);
        queue.send(vec![1; 60]).unwrap();
        queue.send(vec![2; 60]).unwrap();
        assert_eq!(queue.capacity(), 0);

        match rx.recv().await {
            Some(WriteOp::Data(bytes)) => rx.written(bytes.len()),
            _ => panic!("expected data"),
        }
        assert_eq!(queue.capacity(), 40);

        drop(rx);
        assert!(matches!(queue.send(vec![3; 10]), Err(TransportError::Closed)));
        assert_eq!(queue.capacity(), usize::MAX);
    }

    #[test]
    fn test_event_slot_is_weak() {
        trait Ping: Send + Sync {
            fn ping(&self) -> u8;
        }
        struct Pong;
        impl Ping for Pong {
            fn ping(&self) -> u8 {
                7
            }
        }

        let slot: EventSlot<dyn Ping> = EventSlot::new();
        let handler: Arc<dyn Ping> = Arc::new(Pong);
        assert!(slot.set(Arc::downgrade(&handler)));
        assert!(!slot.set(Arc::downgrade(&handler)));
        assert_eq!(slot.get().map(|h| h.ping()), Some(7));
        drop(handler);
        assert!(slot.get().is_none());
    }
}

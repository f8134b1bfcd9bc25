//! In-process transports for tests and local experiments
//!
//! [`MemoryShapedTransport::pair`] links two shaped endpoints through
//! delivery threads that retry backpressured chunks, like a real stream
//! reader would. [`MemorySockets`] stands in for the TCP side: the caller
//! plays the client or server and the transport records what the core
//! wrote.

use super::{
    EventSlot, ShapedTransport, SocketEvents, SocketId, StreamEnd, StreamEvents, StreamId, UnshapedTransport,
};
use crate::error::{FlowError, TransportError};
use crate::flow::AddressPair;
use crate::protocol::ConnStatus;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

const RETRY_BACKOFF: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

enum Delivery {
    Data(StreamId, Vec<u8>),
    Finish(StreamId),
}

/// One end of an in-memory stream link
pub struct MemoryShapedTransport {
    next_stream: AtomicU64,
    /// 0 for the dialling end, 1 for the accepting end, as QUIC numbers streams
    stream_base: u64,
    events: Arc<EventSlot<dyn StreamEvents>>,
    outgoing: Mutex<Sender<Delivery>>,
    sent: Mutex<HashMap<StreamId, u64>>,
    finished: Mutex<HashSet<StreamId>>,
}

impl MemoryShapedTransport {
    /// Two connected ends; the first one dials
    pub fn pair() -> io::Result<(Arc<Self>, Arc<Self>)> {
        let dial_events: Arc<EventSlot<dyn StreamEvents>> = Arc::new(EventSlot::new());
        let accept_events: Arc<EventSlot<dyn StreamEvents>> = Arc::new(EventSlot::new());
        let (dial_tx, dial_rx) = mpsc::channel();
        let (accept_tx, accept_rx) = mpsc::channel();
        spawn_delivery("dpmux-mem-forward", dial_rx, accept_events.clone())?;
        spawn_delivery("dpmux-mem-reverse", accept_rx, dial_events.clone())?;

        let end = |stream_base, events, outgoing| {
            Arc::new(Self {
                next_stream: AtomicU64::new(0),
                stream_base,
                events,
                outgoing: Mutex::new(outgoing),
                sent: Mutex::new(HashMap::new()),
                finished: Mutex::new(HashSet::new()),
            })
        };
        Ok((end(0, dial_events, dial_tx), end(1, accept_events, accept_tx)))
    }

    pub fn set_events(&self, events: Weak<dyn StreamEvents>) -> bool {
        self.events.set(events)
    }

    /// Total bytes written on `stream` by this end
    pub fn bytes_sent_on(&self, stream: StreamId) -> u64 {
        lock(&self.sent).get(&stream).copied().unwrap_or(0)
    }

    /// Whether this end finished `stream`
    pub fn is_finished(&self, stream: StreamId) -> bool {
        lock(&self.finished).contains(&stream)
    }

    fn forward(&self, delivery: Delivery) -> Result<(), TransportError> {
        lock(&self.outgoing).send(delivery).map_err(|_| TransportError::Closed)
    }
}

impl ShapedTransport for MemoryShapedTransport {
    fn open_stream(&self) -> Result<StreamId, TransportError> {
        Ok(self.next_stream.fetch_add(1, Ordering::Relaxed) * 4 + self.stream_base)
    }

    fn send_on_stream(&self, stream: StreamId, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.is_finished(stream) {
            return Err(TransportError::UnknownStream(stream));
        }
        *lock(&self.sent).entry(stream).or_insert(0) += bytes.len() as u64;
        self.forward(Delivery::Data(stream, bytes))
    }

    fn close_stream(&self, stream: StreamId) -> Result<(), TransportError> {
        if !lock(&self.finished).insert(stream) {
            return Ok(());
        }
        self.forward(Delivery::Finish(stream))
    }

    /// The link queues without limit
    fn write_capacity(&self, _stream: StreamId) -> usize {
        usize::MAX
    }
}

fn spawn_delivery(
    name: &str,
    incoming: Receiver<Delivery>,
    events: Arc<EventSlot<dyn StreamEvents>>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut refused = HashSet::new();
        // Ends when the sending transport is dropped
        while let Ok(delivery) = incoming.recv() {
            match delivery {
                Delivery::Data(stream, bytes) => {
                    if refused.contains(&stream) {
                        continue;
                    }
                    loop {
                        let Some(handler) = events.get() else {
                            trace!(stream_id = stream, "no handler, dropping chunk");
                            break;
                        };
                        match handler.on_stream_data(stream, &bytes) {
                            Ok(()) => break,
                            Err(FlowError::Backpressure(_)) => thread::sleep(RETRY_BACKOFF),
                            Err(e) => {
                                debug!(stream_id = stream, error = %e, "stream refused");
                                refused.insert(stream);
                                break;
                            }
                        }
                    }
                }
                Delivery::Finish(stream) => {
                    if let Some(handler) = events.get() {
                        handler.on_stream_closed(stream, StreamEnd::Finished);
                    }
                }
            }
        }
    })
}

/// What the core did with one socket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketRecord {
    pub client: String,
    /// Set for sockets the core connected itself
    pub connected_to: Option<AddressPair>,
    pub received: Vec<u8>,
    pub shut_down: bool,
}

/// Scripted stand-in for the TCP side
pub struct MemorySockets {
    events: EventSlot<dyn SocketEvents>,
    next_socket: AtomicU64,
    sockets: Mutex<HashMap<SocketId, SocketRecord>>,
}

impl MemorySockets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: EventSlot::new(),
            next_socket: AtomicU64::new(1),
            sockets: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_events(&self, events: Weak<dyn SocketEvents>) -> bool {
        self.events.set(events)
    }

    /// Deliver an event, waiting out backpressure
    fn deliver(&self, socket: SocketId, bytes: &[u8], hint: ConnStatus) -> Result<(), FlowError> {
        let client = lock(&self.sockets)
            .get(&socket)
            .map(|record| record.client.clone())
            .ok_or(FlowError::UnknownFlow(socket))?;
        loop {
            let handler = self.events.get().ok_or(FlowError::UnknownFlow(socket))?;
            match handler.on_socket_data(socket, &client, bytes, hint) {
                Err(FlowError::Backpressure(_)) => thread::sleep(RETRY_BACKOFF),
                result => return result,
            }
        }
    }

    /// A client connected from `client`
    pub fn accept(&self, client: &str) -> Result<SocketId, FlowError> {
        let socket = self.next_socket.fetch_add(1, Ordering::Relaxed);
        lock(&self.sockets).insert(
            socket,
            SocketRecord {
                client: client.to_string(),
                ..Default::default()
            },
        );
        self.deliver(socket, &[], ConnStatus::Syn)?;
        Ok(socket)
    }

    /// Bytes read from the socket's peer, split into `chunk`-sized reads
    pub fn inject(&self, socket: SocketId, bytes: &[u8], chunk: usize) -> Result<(), FlowError> {
        for piece in bytes.chunks(chunk.max(1)) {
            self.deliver(socket, piece, ConnStatus::Ongoing)?;
        }
        Ok(())
    }

    /// The socket's peer stopped sending
    pub fn hang_up(&self, socket: SocketId) -> Result<(), FlowError> {
        self.deliver(socket, &[], ConnStatus::Fin)
    }

    pub fn record(&self, socket: SocketId) -> Option<SocketRecord> {
        lock(&self.sockets).get(&socket).cloned()
    }

    /// Sockets opened through [`UnshapedTransport::connect`], by id
    pub fn connected(&self) -> Vec<SocketId> {
        let sockets = lock(&self.sockets);
        let mut ids: Vec<SocketId> = sockets
            .iter()
            .filter(|(_, record)| record.connected_to.is_some())
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl UnshapedTransport for MemorySockets {
    fn connect(&self, address: &AddressPair) -> Result<SocketId, TransportError> {
        let socket = self.next_socket.fetch_add(1, Ordering::Relaxed);
        lock(&self.sockets).insert(
            socket,
            SocketRecord {
                client: address.client_endpoint(),
                connected_to: Some(address.clone()),
                ..Default::default()
            },
        );
        Ok(socket)
    }

    fn send_on_socket(&self, socket: SocketId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut sockets = lock(&self.sockets);
        let record = sockets.get_mut(&socket).ok_or(TransportError::UnknownSocket(socket))?;
        if record.shut_down {
            return Err(TransportError::Closed);
        }
        record.received.extend_from_slice(&bytes);
        Ok(())
    }

    fn close_socket(&self, socket: SocketId) -> Result<(), TransportError> {
        let mut sockets = lock(&self.sockets);
        let record = sockets.get_mut(&socket).ok_or(TransportError::UnknownSocket(socket))?;
        record.shut_down = true;
        Ok(())
    }

    /// Writes land in the record at once
    fn write_capacity(&self, _socket: SocketId) -> usize {
        usize::MAX
    }
}

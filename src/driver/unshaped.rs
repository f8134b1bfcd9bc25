//! Unshaped-process driver
//!
//! Terminates ordinary TCP flows. On the initiating peer it accepts client
//! sockets and allocates a queue pair for each; on the responding peer it
//! connects to the server named by each pair the shaped process announces.
//! Either way socket bytes go into the to-shaped ring and the from-shaped
//! ring is drained back onto the socket.

use super::{lock, Driver, PeerRole, Role, SignalOutbox, SyntheticKeys};
use crate::error::FlowError;
use crate::flow::{AddressPair, FlowEntry, FlowPool, QueueId, QueuePair};
use crate::protocol::ConnStatus;
use crate::shm::{Direction, ShmArena, SignalRecord};
use crate::stats::FlowStats;
use crate::transport::{SocketEvents, SocketId, UnshapedTransport};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace, warn};

/// Settings of the unshaped process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnshapedOptions {
    pub peer_role: PeerRole,
    /// `host:port` every accepted client is relayed to (initiating peer)
    pub destination: String,
}

/// Driver of the unshaped process
pub struct UnshapedSide<T: UnshapedTransport> {
    transport: Arc<T>,
    arena: Arc<ShmArena>,
    pool: FlowPool,
    options: UnshapedOptions,
    broken: Mutex<HashSet<QueueId>>,
    outbox: SignalOutbox,
    synthetic: SyntheticKeys,
    stats: FlowStats,
}

impl<T: UnshapedTransport> UnshapedSide<T> {
    pub fn new(transport: Arc<T>, arena: Arc<ShmArena>, options: UnshapedOptions) -> Self {
        let pool = FlowPool::new(&arena, Role::Unshaped);
        Self {
            transport,
            arena,
            pool,
            options,
            broken: Mutex::new(HashSet::new()),
            outbox: SignalOutbox::new(Direction::ToShaped),
            synthetic: SyntheticKeys::default(),
            stats: FlowStats::new(),
        }
    }

    pub fn pool(&self) -> &FlowPool {
        &self.pool
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn is_broken(&self, id: QueueId) -> bool {
        lock(&self.broken).contains(&id)
    }

    fn signal(&self, id: QueueId, status: ConnStatus) {
        self.outbox.send(self.arena.signals(), SignalRecord::new(id, status));
    }

    /// Entry point for socket events
    pub fn received_unshaped_data(
        &self,
        socket: SocketId,
        client: &str,
        bytes: &[u8],
        hint: ConnStatus,
    ) -> Result<(), FlowError> {
        match hint {
            ConnStatus::Syn => {
                let pair = self.accept_socket(socket, client)?;
                self.push_outbound(&pair, bytes)
            }
            ConnStatus::Ongoing => {
                let pair = self.pool.find_by_endpoint(socket).ok_or(FlowError::UnknownFlow(socket))?;
                self.push_outbound(&pair, bytes)
            }
            ConnStatus::Fin => {
                match self.pool.find_by_endpoint(socket) {
                    Some(pair) => self.close_outbound(&pair),
                    None => debug!(socket_id = socket, "FIN on a socket without a flow"),
                }
                Ok(())
            }
        }
    }

    fn accept_socket(&self, socket: SocketId, client: &str) -> Result<QueuePair, FlowError> {
        if self.options.peer_role != PeerRole::Initiator {
            FlowStats::bump(&self.stats.protocol_violations);
            warn!(socket_id = socket, "accepted socket on the responding side");
            return Err(FlowError::UnknownFlow(socket));
        }
        let address = AddressPair::from_endpoints(client, &self.options.destination)?;
        match self.pool.assign(socket, &address) {
            Ok(pair) => {
                FlowStats::bump(&self.stats.flows_opened);
                info!(queue_id = pair.id(), socket_id = socket, %address, "flow opened");
                self.signal(pair.id(), ConnStatus::Syn);
                Ok(pair)
            }
            Err(e) => {
                FlowStats::bump(&self.stats.flows_rejected);
                error!(socket_id = socket, client, error = %e, "rejecting connection");
                if let Err(e) = self.transport.close_socket(socket) {
                    debug!(socket_id = socket, error = %e, "close of rejected socket failed");
                }
                Err(e.into())
            }
        }
    }

    fn push_outbound(&self, pair: &QueuePair, bytes: &[u8]) -> Result<(), FlowError> {
        if bytes.is_empty() {
            return Ok(());
        }
        pair.to_shaped()
            .push(bytes)
            .map_err(|_| FlowError::Backpressure(pair.id()))?;
        FlowStats::add(&self.stats.bytes_in, bytes.len());
        trace!(queue_id = pair.id(), len = bytes.len(), "outbound flow data");
        Ok(())
    }

    /// The socket stopped producing bytes
    fn close_outbound(&self, pair: &QueuePair) {
        if pair.to_shaped().is_marked_for_deletion() {
            return;
        }
        pair.to_shaped().mark_for_deletion();
        if let Err(e) = self.pool.mark_fin_pending(pair.id()) {
            warn!(queue_id = pair.id(), error = %e, "could not record FIN");
        }
        debug!(queue_id = pair.id(), "socket closed");
        self.signal(pair.id(), ConnStatus::Fin);
    }

    /// SYN from the shaped process: connect to the flow's server
    fn connect_flow(&self, id: QueueId) {
        if self.options.peer_role != PeerRole::Responder {
            FlowStats::bump(&self.stats.protocol_violations);
            warn!(queue_id = id, "unexpected SYN signal on the initiating side");
            return;
        }
        let Some(pair) = self.pool.pair(id) else {
            warn!(queue_id = id, "SYN signal for unknown queue");
            return;
        };
        let address = pair.address();
        match self.transport.connect(&address) {
            Ok(socket) => match self.pool.adopt(id, socket) {
                Ok(_) => {
                    FlowStats::bump(&self.stats.flows_opened);
                    info!(queue_id = id, socket_id = socket, %address, "flow opened");
                }
                Err(e) => {
                    error!(queue_id = id, error = %e, "could not bind new socket");
                    let _ = self.transport.close_socket(socket);
                }
            },
            Err(e) => {
                warn!(queue_id = id, %address, error = %e, "connect failed, closing flow");
                match self.pool.adopt(id, self.synthetic.next()) {
                    Ok(pair) => {
                        lock(&self.broken).insert(id);
                        self.close_outbound(&pair);
                    }
                    Err(e) => error!(queue_id = id, error = %e, "could not bind failed flow"),
                }
            }
        }
    }

    /// Move queued inbound bytes onto the flow's socket and forward its FIN.
    /// Bytes the socket's writer has no room for stay in the ring.
    fn drain_inbound(&self, entry: &FlowEntry) {
        let from_shaped = entry.pair.from_shaped();
        let closed = from_shaped.is_marked_for_deletion();
        let broken = self.is_broken(entry.pair.id());
        let pending = if broken {
            from_shaped.size()
        } else {
            from_shaped.size().min(self.transport.write_capacity(entry.endpoint))
        };
        if pending > 0 {
            match from_shaped.pop_vec(pending) {
                Ok(_) if broken => trace!(queue_id = entry.pair.id(), len = pending, "discarded data of failed flow"),
                Ok(bytes) => {
                    FlowStats::add(&self.stats.bytes_out, bytes.len());
                    if let Err(e) = self.transport.send_on_socket(entry.endpoint, bytes) {
                        warn!(queue_id = entry.pair.id(), socket_id = entry.endpoint, error = %e, "socket write failed");
                        lock(&self.broken).insert(entry.pair.id());
                        self.close_outbound(&entry.pair);
                    }
                }
                Err(e) => error!(queue_id = entry.pair.id(), error = %e, "pop below reported size"),
            }
        }

        if closed && from_shaped.is_empty() && !from_shaped.sent_fin() {
            if !self.is_broken(entry.pair.id()) {
                if let Err(e) = self.transport.close_socket(entry.endpoint) {
                    debug!(socket_id = entry.endpoint, error = %e, "socket shutdown failed");
                }
            }
            from_shaped.set_sent_fin();
            debug!(queue_id = entry.pair.id(), "forwarded FIN to socket");
        }
    }

    fn try_release(&self, entry: &FlowEntry) {
        let (from_shaped, to_shaped) = (entry.pair.from_shaped(), entry.pair.to_shaped());
        let done = to_shaped.sent_fin()
            && from_shaped.sent_fin()
            && to_shaped.is_empty()
            && from_shaped.is_empty()
            && entry.pair.fully_marked();
        if !done {
            return;
        }
        match self.pool.release(entry.pair.id()) {
            Ok(()) => {
                FlowStats::bump(&self.stats.flows_closed);
                lock(&self.broken).remove(&entry.pair.id());
                info!(queue_id = entry.pair.id(), socket_id = entry.endpoint, "flow closed");
            }
            Err(e) => error!(queue_id = entry.pair.id(), error = %e, "release refused"),
        }
    }
}

impl<T: UnshapedTransport> SocketEvents for UnshapedSide<T> {
    fn on_socket_data(&self, socket: SocketId, client: &str, bytes: &[u8], hint: ConnStatus) -> Result<(), FlowError> {
        self.received_unshaped_data(socket, client, bytes, hint)
    }
}

impl<T: UnshapedTransport> Driver for UnshapedSide<T> {
    fn role(&self) -> Role {
        Role::Unshaped
    }

    fn poll_signals(&self) -> usize {
        let signals = self.arena.signals();
        let mut handled = 0;
        while let Some(record) = signals.recv(Direction::FromShaped) {
            handled += 1;
            match record.status {
                ConnStatus::Syn => self.connect_flow(record.queue_id),
                ConnStatus::Fin => {
                    if let Err(e) = self.pool.mark_fin_pending(record.queue_id) {
                        warn!(queue_id = record.queue_id, error = %e, "FIN signal for unbound queue");
                    }
                }
                ConnStatus::Ongoing => warn!(queue_id = record.queue_id, "ignoring ONGOING signal"),
            }
        }
        self.outbox.flush(signals);
        handled
    }

    fn service(&self) {
        let (dummy, _) = self.arena.dummy_pair();
        let padding = dummy.size();
        if padding > 0 && dummy.pop_vec(padding).is_ok() {
            FlowStats::add(&self.stats.dummy_bytes, padding);
        }
        for entry in self.pool.snapshot() {
            self.drain_inbound(&entry);
            self.try_release(&entry);
        }
        self.outbox.flush(self.arena.signals());
    }

    fn stats(&self) -> &FlowStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PoolError, TransportError};
    use crate::shm::ShmLayout;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeSockets {
        next: AtomicU64,
        refuse: AtomicBool,
        connects: Mutex<Vec<AddressPair>>,
        written: Mutex<Vec<(SocketId, Vec<u8>)>>,
        closed: Mutex<Vec<SocketId>>,
        room: Mutex<Option<usize>>,
    }

    impl UnshapedTransport for FakeSockets {
        fn connect(&self, address: &AddressPair) -> Result<SocketId, TransportError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Other("connection refused".into()));
            }
            self.connects.lock().unwrap().push(address.clone());
            Ok(100 + self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn send_on_socket(&self, socket: SocketId, bytes: Vec<u8>) -> Result<(), TransportError> {
            self.written.lock().unwrap().push((socket, bytes));
            Ok(())
        }

        fn close_socket(&self, socket: SocketId) -> Result<(), TransportError> {
            self.closed.lock().unwrap().push(socket);
            Ok(())
        }

        fn write_capacity(&self, _socket: SocketId) -> usize {
            self.room.lock().unwrap().unwrap_or(usize::MAX)
        }
    }

    fn side(role: PeerRole, max_flows: usize) -> (Arc<ShmArena>, UnshapedSide<FakeSockets>) {
        let arena = Arc::new(ShmArena::in_memory(ShmLayout::new(max_flows, 512).unwrap()).unwrap());
        let options = UnshapedOptions {
            peer_role: role,
            destination: "203.0.113.5:8080".into(),
        };
        let side = UnshapedSide::new(Arc::new(FakeSockets::default()), arena.clone(), options);
        (arena, side)
    }

    #[test]
    fn test_accept_assigns_pair_and_signals_syn() {
        let (arena, side) = side(PeerRole::Initiator, 2);
        side.received_unshaped_data(3, "192.0.2.9:41000", &[], ConnStatus::Syn).unwrap();
        side.received_unshaped_data(3, "192.0.2.9:41000", b"GET /", ConnStatus::Ongoing).unwrap();

        let pair = side.pool().find_by_endpoint(3).unwrap();
        assert_eq!(pair.to_shaped().pop_vec(5).unwrap(), b"GET /");
        assert_eq!(pair.address().server_endpoint(), "203.0.113.5:8080");
        assert_eq!(pair.address().client_port, "41000");
        let signals = arena.signals().drain(Direction::ToShaped);
        assert_eq!(signals, vec![SignalRecord::new(pair.id(), ConnStatus::Syn)]);
    }

    #[test]
    fn test_exhaustion_rejects_new_socket_only() {
        let (_arena, side) = side(PeerRole::Initiator, 1);
        side.received_unshaped_data(1, "192.0.2.9:1", &[], ConnStatus::Syn).unwrap();
        side.received_unshaped_data(1, "192.0.2.9:1", b"keep", ConnStatus::Ongoing).unwrap();

        let err = side.received_unshaped_data(2, "192.0.2.9:2", &[], ConnStatus::Syn).unwrap_err();
        assert_eq!(err, FlowError::Rejected(PoolError::Exhausted));
        assert_eq!(*side.transport().closed.lock().unwrap(), vec![2]);
        assert_eq!(side.pool().find_by_endpoint(1).unwrap().to_shaped().size(), 4);
        assert_eq!(side.stats().snapshot().flows_rejected, 1);
    }

    #[test]
    fn test_full_ring_reports_backpressure() {
        let (_arena, side) = side(PeerRole::Initiator, 1);
        side.received_unshaped_data(1, "192.0.2.9:1", &[], ConnStatus::Syn).unwrap();
        side.received_unshaped_data(1, "192.0.2.9:1", &[0u8; 500], ConnStatus::Ongoing).unwrap();
        let id = side.pool().find_by_endpoint(1).unwrap().id();
        assert_eq!(
            side.received_unshaped_data(1, "192.0.2.9:1", &[0u8; 20], ConnStatus::Ongoing),
            Err(FlowError::Backpressure(id))
        );
        assert_eq!(
            side.received_unshaped_data(9, "192.0.2.9:1", b"x", ConnStatus::Ongoing),
            Err(FlowError::UnknownFlow(9))
        );
    }

    #[test]
    fn test_socket_fin_marks_and_signals() {
        let (arena, side) = side(PeerRole::Initiator, 1);
        side.received_unshaped_data(1, "192.0.2.9:1", &[], ConnStatus::Syn).unwrap();
        side.received_unshaped_data(1, "192.0.2.9:1", &[], ConnStatus::Fin).unwrap();
        side.received_unshaped_data(1, "192.0.2.9:1", &[], ConnStatus::Fin).unwrap();

        let pair = side.pool().find_by_endpoint(1).unwrap();
        assert!(pair.to_shaped().is_marked_for_deletion());
        let signals = arena.signals().drain(Direction::ToShaped);
        assert_eq!(
            signals,
            vec![
                SignalRecord::new(pair.id(), ConnStatus::Syn),
                SignalRecord::new(pair.id(), ConnStatus::Fin)
            ]
        );
    }

    #[test]
    fn test_inbound_bytes_reach_socket_then_shutdown() {
        let (_arena, side) = side(PeerRole::Initiator, 1);
        side.received_unshaped_data(1, "192.0.2.9:1", &[], ConnStatus::Syn).unwrap();
        let pair = side.pool().find_by_endpoint(1).unwrap();

        pair.from_shaped().push(b"response").unwrap();
        side.service();
        assert_eq!(*side.transport().written.lock().unwrap(), vec![(1, b"response".to_vec())]);
        assert!(side.transport().closed.lock().unwrap().is_empty());

        pair.from_shaped().mark_for_deletion();
        side.service();
        assert_eq!(*side.transport().closed.lock().unwrap(), vec![1]);
        assert!(pair.from_shaped().sent_fin());

        // Both directions done: shaped side forwarded our FIN too
        side.received_unshaped_data(1, "192.0.2.9:1", &[], ConnStatus::Fin).unwrap();
        pair.to_shaped().set_sent_fin();
        side.service();
        assert_eq!(side.pool().available(), 1);
        assert_eq!(side.stats().snapshot().flows_closed, 1);
    }

    #[test]
    fn test_slow_socket_leaves_bytes_in_ring() {
        let (_arena, side) = side(PeerRole::Initiator, 1);
        side.received_unshaped_data(1, "192.0.2.9:1", &[], ConnStatus::Syn).unwrap();
        let pair = side.pool().find_by_endpoint(1).unwrap();
        *side.transport().room.lock().unwrap() = Some(3);

        pair.from_shaped().push(b"response").unwrap();
        pair.from_shaped().mark_for_deletion();
        side.service();
        assert_eq!(*side.transport().written.lock().unwrap(), vec![(1, b"res".to_vec())]);
        assert_eq!(pair.from_shaped().size(), 5);
        assert!(side.transport().closed.lock().unwrap().is_empty());

        // Peer stops sending once the ring is full
        assert!(pair.from_shaped().push(&[0u8; 507]).is_err());

        *side.transport().room.lock().unwrap() = Some(0);
        side.service();
        assert_eq!(pair.from_shaped().size(), 5);

        *side.transport().room.lock().unwrap() = None;
        side.service();
        let written: Vec<u8> = side.transport().written.lock().unwrap().iter().flat_map(|(_, b)| b.clone()).collect();
        assert_eq!(written, b"response");
        assert_eq!(*side.transport().closed.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_responder_connects_on_syn_signal() {
        let (arena, side) = side(PeerRole::Responder, 1);
        let shaped = FlowPool::new(&arena, Role::Shaped);
        let address = AddressPair::from_endpoints("192.0.2.9:5000", "127.0.0.1:9000").unwrap();
        let pair = shaped.assign(8, &address).unwrap();
        arena
            .signals()
            .send(Direction::FromShaped, SignalRecord::new(pair.id(), ConnStatus::Syn))
            .unwrap();

        assert_eq!(side.poll_signals(), 1);
        assert_eq!(*side.transport().connects.lock().unwrap(), vec![address]);
        assert_eq!(side.pool().endpoint_of(pair.id()), Some(100));
    }

    #[test]
    fn test_refused_connect_closes_flow() {
        let (arena, side) = side(PeerRole::Responder, 1);
        side.transport().refuse.store(true, Ordering::SeqCst);
        let shaped = FlowPool::new(&arena, Role::Shaped);
        let pair = shaped.assign(8, &AddressPair::from_endpoints("192.0.2.9:5000", "127.0.0.1:1").unwrap()).unwrap();
        arena
            .signals()
            .send(Direction::FromShaped, SignalRecord::new(pair.id(), ConnStatus::Syn))
            .unwrap();

        side.poll_signals();
        assert!(pair.to_shaped().is_marked_for_deletion());
        let signals = arena.signals().drain(Direction::ToShaped);
        assert_eq!(signals, vec![SignalRecord::new(pair.id(), ConnStatus::Fin)]);

        // Bytes for the dead socket are dropped, and no shutdown is attempted
        pair.from_shaped().push(b"lost").unwrap();
        pair.from_shaped().mark_for_deletion();
        side.service();
        assert!(side.transport().written.lock().unwrap().is_empty());
        assert!(side.transport().closed.lock().unwrap().is_empty());
        assert!(pair.from_shaped().sent_fin());
    }

    #[test]
    fn test_padding_is_discarded() {
        let (arena, side) = side(PeerRole::Responder, 1);
        let (from_shaped, _) = arena.dummy_pair();
        from_shaped.push(&[0u8; 300]).unwrap();
        side.service();
        assert!(from_shaped.is_empty());
        assert_eq!(side.stats().snapshot().dummy_bytes, 300);
    }
}

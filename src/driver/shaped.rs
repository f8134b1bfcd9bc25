//! Shaped-process driver
//!
//! Bridges the shared rings and the multiplexed transport towards the peer
//! middlebox. Outbound bytes only leave through the scheduler (this type is
//! its [`ShapingSource`]); inbound bytes are pushed straight into the
//! flow's from-shaped ring.
//!
//! The initiating peer reserves two streams at start-up: a control stream
//! carrying [`ControlMessage`] records and a dummy stream carrying padding.
//! Every other stream is one flow. On the responding peer a stream can show
//! up before or after the SYN record naming it; whichever comes second
//! completes the association. A stream that ends without carrying a byte
//! still completes it.

use super::{lock, Driver, PeerRole, Role, SignalOutbox, SyntheticKeys};
use crate::constants::CONTROL_STREAM_ID;
use crate::error::{FlowError, PoolError, TransportError};
use crate::flow::{AddressPair, FlowEntry, FlowPool, QueueId, QueuePair};
use crate::protocol::{ConnStatus, ControlDecoder, ControlMessage, StreamType};
use crate::shaper::{BufferKind, Fairness, PreparedBuffer, ShapingSource};
use crate::shm::{Direction, ShmArena, SignalRecord};
use crate::stats::FlowStats;
use crate::transport::{ShapedTransport, StreamEnd, StreamEvents, StreamId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Settings of the shaped process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapedOptions {
    pub peer_role: PeerRole,
    pub fairness: Fairness,
    /// How long a stream or SYN record waits for its counterpart
    pub association_window: Duration,
}

impl Default for ShapedOptions {
    fn default() -> Self {
        Self {
            peer_role: PeerRole::Initiator,
            fairness: Fairness::InOrder,
            association_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ReservedStreams {
    control: Option<StreamId>,
    dummy: Option<StreamId>,
}

#[derive(Debug, Default)]
struct Association {
    /// SYN records for streams that have not delivered data yet
    early: HashMap<StreamId, (AddressPair, Instant)>,
    /// Streams holding a pair but not identified yet
    anonymous: HashMap<StreamId, Instant>,
    /// Streams that ended before anything identified them
    ended: HashMap<StreamId, (StreamEnd, Instant)>,
    /// Streams the peer finished before its FIN record arrived
    finished: HashSet<StreamId>,
    /// FIN records that arrived before their stream finished
    fin_records: HashSet<StreamId>,
}

/// Driver of the shaped process
pub struct ShapedSide<T: ShapedTransport> {
    transport: Arc<T>,
    arena: Arc<ShmArena>,
    pool: FlowPool,
    options: ShapedOptions,
    reserved: RwLock<ReservedStreams>,
    association: Mutex<Association>,
    decoder: Mutex<ControlDecoder>,
    broken: Mutex<HashSet<QueueId>>,
    outbox: SignalOutbox,
    rotation: AtomicUsize,
    synthetic: SyntheticKeys,
    stats: FlowStats,
}

impl<T: ShapedTransport> ShapedSide<T> {
    pub fn new(transport: Arc<T>, arena: Arc<ShmArena>, options: ShapedOptions) -> Self {
        let pool = FlowPool::new(&arena, Role::Shaped);
        Self {
            transport,
            arena,
            pool,
            options,
            reserved: RwLock::new(ReservedStreams::default()),
            association: Mutex::new(Association::default()),
            decoder: Mutex::new(ControlDecoder::new()),
            broken: Mutex::new(HashSet::new()),
            outbox: SignalOutbox::new(Direction::FromShaped),
            rotation: AtomicUsize::new(0),
            synthetic: SyntheticKeys::default(),
            stats: FlowStats::new(),
        }
    }

    pub fn pool(&self) -> &FlowPool {
        &self.pool
    }

    pub fn options(&self) -> &ShapedOptions {
        &self.options
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn control_stream(&self) -> Option<StreamId> {
        self.reserved().control
    }

    pub fn dummy_stream(&self) -> Option<StreamId> {
        self.reserved().dummy
    }

    /// Open and announce the reserved streams; a no-op on the responding peer
    pub fn start(&self) -> Result<(), TransportError> {
        if self.options.peer_role != PeerRole::Initiator {
            return Ok(());
        }
        let control = self.transport.open_stream()?;
        if control != CONTROL_STREAM_ID {
            warn!(stream_id = control, "control stream did not get the first stream id");
        }
        self.transport
            .send_on_stream(control, ControlMessage::control(control).to_bytes())?;
        let dummy = self.transport.open_stream()?;
        self.transport
            .send_on_stream(control, ControlMessage::dummy(dummy).to_bytes())?;
        FlowStats::add(&self.stats.control_messages, 2);

        let mut reserved = self.reserved.write().unwrap_or_else(|e| e.into_inner());
        reserved.control = Some(control);
        reserved.dummy = Some(dummy);
        info!(control_stream = control, dummy_stream = dummy, "reserved streams opened");
        Ok(())
    }

    fn reserved(&self) -> ReservedStreams {
        *self.reserved.read().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_broken(&self, id: QueueId) {
        lock(&self.broken).insert(id);
    }

    fn signal(&self, id: QueueId, status: ConnStatus) {
        self.outbox.send(self.arena.signals(), SignalRecord::new(id, status));
    }

    /// Whether `stream` carries control records. The initiating peer opens
    /// the control stream first, so the responding peer knows its id before
    /// any byte arrives.
    fn is_control_stream(&self, stream: StreamId) -> bool {
        if let Some(control) = self.reserved().control {
            return control == stream;
        }
        if self.options.peer_role != PeerRole::Responder || stream != CONTROL_STREAM_ID {
            return false;
        }
        let mut reserved = self.reserved.write().unwrap_or_else(|e| e.into_inner());
        if reserved.control.replace(stream).is_none() {
            info!(stream_id = stream, "control stream identified");
        }
        true
    }

    /// Entry point for bytes arriving from the peer on any stream
    pub fn received_shaped_data(&self, stream: StreamId, bytes: &[u8]) -> Result<(), FlowError> {
        if self.is_control_stream(stream) {
            self.handle_control_bytes(bytes);
            return Ok(());
        }
        if self.reserved().dummy == Some(stream) {
            self.absorb_padding(bytes);
            return Ok(());
        }
        let pair = match self.pool.find_by_endpoint(stream) {
            Some(pair) => pair,
            None => self.accept_stream(stream)?,
        };
        if bytes.len() >= pair.from_shaped().capacity() {
            error!(stream_id = stream, len = bytes.len(), "inbound chunk larger than a queue");
            return Err(PoolError::InvariantViolation(format!("chunk of {} bytes cannot fit queue", bytes.len())).into());
        }
        pair.from_shaped()
            .push(bytes)
            .map_err(|_| FlowError::Backpressure(pair.id()))?;
        FlowStats::add(&self.stats.bytes_in, bytes.len());
        trace!(queue_id = pair.id(), len = bytes.len(), "inbound flow data");
        Ok(())
    }

    /// Padding is handed to the unshaped process, which throws it away
    fn absorb_padding(&self, bytes: &[u8]) {
        FlowStats::add(&self.stats.dummy_bytes, bytes.len());
        let (from_shaped, _) = self.arena.dummy_pair();
        for chunk in bytes.chunks(from_shaped.capacity() - 1) {
            if from_shaped.push(chunk).is_err() {
                trace!("dummy ring full, padding dropped");
                break;
            }
        }
    }

    /// Give a new inbound stream a queue pair
    fn accept_stream(&self, stream: StreamId) -> Result<QueuePair, FlowError> {
        if self.options.peer_role == PeerRole::Initiator {
            FlowStats::bump(&self.stats.protocol_violations);
            warn!(stream_id = stream, "data on a stream this side never opened");
            return Err(FlowError::UnknownFlow(stream));
        }

        let mut association = lock(&self.association);
        let pair = self.assign_inbound(stream)?;
        match association.early.remove(&stream) {
            Some((address, _)) => {
                drop(association);
                self.bind(&pair, stream, &address);
            }
            None => {
                association.anonymous.insert(stream, Instant::now());
                debug!(stream_id = stream, queue_id = pair.id(), "stream awaiting its SYN record");
            }
        }
        Ok(pair)
    }

    /// Take a queue pair for an inbound stream, closing the stream when none
    /// is left. Callers hold the association lock.
    fn assign_inbound(&self, stream: StreamId) -> Result<QueuePair, FlowError> {
        match self.pool.assign(stream, &AddressPair::default()) {
            Ok(pair) => {
                FlowStats::bump(&self.stats.flows_opened);
                Ok(pair)
            }
            Err(e) => {
                FlowStats::bump(&self.stats.flows_rejected);
                error!(stream_id = stream, error = %e, "rejecting inbound stream");
                if let Err(e) = self.transport.close_stream(stream) {
                    debug!(stream_id = stream, error = %e, "close of rejected stream failed");
                }
                Err(e.into())
            }
        }
    }

    /// The flow on `stream`. A stream that carried no data is bound here to
    /// its waiting SYN record; if that record has not arrived, a given
    /// `ended` is kept for the record to pick up.
    fn settle_stream(&self, stream: StreamId, ended: Option<StreamEnd>) -> Result<Option<QueuePair>, FlowError> {
        if let Some(pair) = self.pool.find_by_endpoint(stream) {
            return Ok(Some(pair));
        }
        let mut association = lock(&self.association);
        // Inbound pairs are only assigned under the lock
        if let Some(pair) = self.pool.find_by_endpoint(stream) {
            return Ok(Some(pair));
        }
        match association.early.remove(&stream) {
            Some((address, _)) => {
                let pair = self.assign_inbound(stream)?;
                self.bind(&pair, stream, &address);
                Ok(Some(pair))
            }
            None => {
                if let (Some(end), PeerRole::Responder) = (ended, self.options.peer_role) {
                    association.ended.insert(stream, (end, Instant::now()));
                    debug!(stream_id = stream, ?end, "stream ended ahead of its SYN record");
                }
                Ok(None)
            }
        }
    }

    /// Stamp the flow's endpoints and announce it to the unshaped process
    fn bind(&self, pair: &QueuePair, stream: StreamId, address: &AddressPair) {
        pair.stamp_address(address);
        info!(queue_id = pair.id(), stream_id = stream, %address, "flow opened");
        self.signal(pair.id(), ConnStatus::Syn);
        // The stream may have ended while it was anonymous
        if pair.from_shaped().is_marked_for_deletion() {
            self.signal(pair.id(), ConnStatus::Fin);
        }
    }

    fn handle_control_bytes(&self, bytes: &[u8]) {
        let messages = lock(&self.decoder).push(bytes);
        for message in messages {
            match message {
                Ok(message) => self.handle_control(message),
                Err(e) => {
                    FlowStats::bump(&self.stats.protocol_violations);
                    warn!(error = %e, "discarding malformed control record");
                }
            }
        }
    }

    fn handle_control(&self, message: ControlMessage) {
        FlowStats::bump(&self.stats.control_messages);
        let stream = message.stream_id;
        match (message.stream_type, message.conn_status) {
            (StreamType::Control, _) => {
                if self.reserved().control != Some(stream) {
                    warn!(stream_id = stream, control = ?self.reserved().control, "control stream announced on another stream");
                }
            }
            (StreamType::Dummy, _) => self.set_dummy_stream(stream),
            (StreamType::Data, ConnStatus::Syn) => self.handle_syn(stream, message.address),
            (StreamType::Data, ConnStatus::Fin) => self.handle_fin_record(stream),
            (StreamType::Data, ConnStatus::Ongoing) => {
                FlowStats::bump(&self.stats.protocol_violations);
                warn!(stream_id = stream, "ONGOING is not a control record");
            }
        }
    }

    fn set_dummy_stream(&self, stream: StreamId) {
        self.reserved.write().unwrap_or_else(|e| e.into_inner()).dummy = Some(stream);
        info!(stream_id = stream, "dummy stream identified");
        // Padding that beat its announcement was taken for a flow
        if let Some(pair) = self.pool.find_by_endpoint(stream) {
            self.abandon(&pair, stream);
        }
    }

    fn handle_syn(&self, stream: StreamId, address: AddressPair) {
        if self.options.peer_role == PeerRole::Initiator {
            FlowStats::bump(&self.stats.protocol_violations);
            warn!(stream_id = stream, "peer sent SYN for a stream this side opens");
            return;
        }
        let mut association = lock(&self.association);
        if association.anonymous.remove(&stream).is_some() {
            drop(association);
            if let Some(pair) = self.pool.find_by_endpoint(stream) {
                self.bind(&pair, stream, &address);
            }
        } else if self.pool.find_by_endpoint(stream).is_some() {
            FlowStats::bump(&self.stats.protocol_violations);
            warn!(stream_id = stream, "duplicate SYN record");
        } else if let Some((end, _)) = association.ended.remove(&stream) {
            // The stream carried no data and is already over
            let Ok(pair) = self.assign_inbound(stream) else {
                return;
            };
            self.bind(&pair, stream, &address);
            match end {
                StreamEnd::Finished => {
                    association.finished.insert(stream);
                }
                StreamEnd::Reset => {
                    drop(association);
                    self.mark_broken(pair.id());
                    self.close_inbound(&pair, true);
                }
            }
        } else {
            association.early.insert(stream, (address, Instant::now()));
            debug!(stream_id = stream, "SYN record ahead of its stream");
        }
    }

    /// A flow's FIN takes effect once both its record and the end of its
    /// stream were seen, so no data can trail the close
    fn handle_fin_record(&self, stream: StreamId) {
        match self.settle_stream(stream, None) {
            Ok(Some(_)) => {}
            Ok(None) => {
                FlowStats::bump(&self.stats.protocol_violations);
                warn!(stream_id = stream, "FIN record for unknown stream");
                return;
            }
            Err(_) => return,
        }
        let mut association = lock(&self.association);
        if association.finished.remove(&stream) {
            drop(association);
            self.remote_fin(stream);
        } else {
            association.fin_records.insert(stream);
        }
    }

    /// Close the from-shaped direction of the flow on `stream`
    fn remote_fin(&self, stream: StreamId) {
        match self.pool.find_by_endpoint(stream) {
            Some(pair) => {
                let anonymous = lock(&self.association).anonymous.contains_key(&stream);
                self.close_inbound(&pair, !anonymous);
            }
            None => debug!(stream_id = stream, "FIN for a stream without a flow"),
        }
    }

    fn close_inbound(&self, pair: &QueuePair, announce: bool) {
        if pair.from_shaped().is_marked_for_deletion() {
            return;
        }
        pair.from_shaped().mark_for_deletion();
        if let Err(e) = self.pool.mark_fin_pending(pair.id()) {
            warn!(queue_id = pair.id(), error = %e, "could not record FIN");
        }
        debug!(queue_id = pair.id(), "peer closed flow");
        if announce {
            self.signal(pair.id(), ConnStatus::Fin);
        }
    }

    /// Drop a pair the unshaped process was never told about
    fn abandon(&self, pair: &QueuePair, stream: StreamId) {
        lock(&self.association).anonymous.remove(&stream);
        for ring in [pair.from_shaped(), pair.to_shaped()] {
            ring.mark_for_deletion();
            ring.set_sent_fin();
        }
        match self.pool.release(pair.id()) {
            Ok(()) => debug!(queue_id = pair.id(), stream_id = stream, "abandoned unidentified stream"),
            Err(e) => error!(queue_id = pair.id(), error = %e, "could not abandon pair"),
        }
    }

    /// SYN from the unshaped process: open a stream and announce the flow
    fn open_flow(&self, id: QueueId) {
        if self.options.peer_role != PeerRole::Initiator {
            FlowStats::bump(&self.stats.protocol_violations);
            warn!(queue_id = id, "unexpected SYN signal on the responding side");
            return;
        }
        let Some(pair) = self.pool.pair(id) else {
            warn!(queue_id = id, "SYN signal for unknown queue");
            return;
        };
        let address = pair.address();
        match self.transport.open_stream() {
            Ok(stream) => match self.pool.adopt(id, stream) {
                Ok(_) => {
                    FlowStats::bump(&self.stats.flows_opened);
                    info!(queue_id = id, stream_id = stream, %address, "flow opened");
                    self.send_control(ControlMessage::syn(stream, address));
                }
                Err(e) => {
                    error!(queue_id = id, error = %e, "could not bind new stream");
                    let _ = self.transport.close_stream(stream);
                }
            },
            Err(e) => {
                warn!(queue_id = id, error = %e, "could not open stream, closing flow");
                match self.pool.adopt(id, self.synthetic.next()) {
                    Ok(pair) => {
                        self.mark_broken(id);
                        self.close_inbound(&pair, true);
                    }
                    Err(e) => error!(queue_id = id, error = %e, "could not bind failed flow"),
                }
            }
        }
    }

    fn send_control(&self, message: ControlMessage) -> bool {
        let Some(control) = self.reserved().control else {
            warn!(stream_id = message.stream_id, "no control stream yet, dropping record");
            return false;
        };
        FlowStats::bump(&self.stats.control_messages);
        match self.transport.send_on_stream(control, message.to_bytes()) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "control stream write failed");
                false
            }
        }
    }

    fn handle_stream_closed(&self, stream: StreamId, end: StreamEnd) {
        let reserved = self.reserved();
        if reserved.control == Some(stream) || reserved.dummy == Some(stream) {
            warn!(stream_id = stream, ?end, "reserved stream closed by peer");
            return;
        }
        let pair = match self.settle_stream(stream, Some(end)) {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!(stream_id = stream, "close of unbound stream");
                return;
            }
            Err(_) => return,
        };
        match end {
            StreamEnd::Finished => {
                let mut association = lock(&self.association);
                if association.fin_records.remove(&stream) {
                    drop(association);
                    self.remote_fin(stream);
                } else {
                    association.finished.insert(stream);
                }
            }
            StreamEnd::Reset => {
                warn!(queue_id = pair.id(), stream_id = stream, "stream reset, closing flow");
                self.mark_broken(pair.id());
                self.remote_fin(stream);
            }
        }
    }

    /// Forward the FIN of a drained, closed to-shaped ring
    fn finish_outbound(&self, entry: &FlowEntry, broken: bool) -> Option<PreparedBuffer> {
        let to_shaped = entry.pair.to_shaped();
        if !to_shaped.is_marked_for_deletion() || !to_shaped.is_empty() || to_shaped.sent_fin() {
            return None;
        }
        to_shaped.set_sent_fin();
        if broken {
            return None;
        }
        let control = self.reserved().control?;
        // Queued behind this flow's data on the stream's writer
        if let Err(e) = self.transport.close_stream(entry.endpoint) {
            debug!(stream_id = entry.endpoint, error = %e, "stream finish failed");
        }
        FlowStats::bump(&self.stats.control_messages);
        debug!(queue_id = entry.pair.id(), stream_id = entry.endpoint, "forwarding FIN");
        Some(PreparedBuffer::control(control, ControlMessage::fin(entry.endpoint).to_bytes()))
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
                let mut association = lock(&self.association);
                association.finished.remove(&entry.endpoint);
                association.fin_records.remove(&entry.endpoint);
                info!(queue_id = entry.pair.id(), stream_id = entry.endpoint, "flow closed");
            }
            Err(e) => error!(queue_id = entry.pair.id(), error = %e, "release refused"),
        }
    }
}

/// Split `budget` over flows with the given backlogs
pub(crate) fn plan_grants(fairness: Fairness, start: usize, backlogs: &[usize], budget: usize) -> Vec<usize> {
    let n = backlogs.len();
    let mut grants = vec![0; n];
    if n == 0 {
        return grants;
    }
    let mut remaining = budget;
    match fairness {
        Fairness::InOrder | Fairness::RoundRobin => {
            let start = if fairness == Fairness::RoundRobin { start % n } else { 0 };
            for offset in 0..n {
                let i = (start + offset) % n;
                grants[i] = backlogs[i].min(remaining);
                remaining -= grants[i];
            }
        }
        Fairness::EqualShare => {
            let hungry = backlogs.iter().filter(|&&b| b > 0).count();
            if hungry > 0 {
                let share = budget / hungry;
                for (grant, &backlog) in grants.iter_mut().zip(backlogs) {
                    *grant = backlog.min(share);
                    remaining -= *grant;
                }
            }
            for (grant, &backlog) in grants.iter_mut().zip(backlogs) {
                let extra = (backlog - *grant).min(remaining);
                *grant += extra;
                remaining -= extra;
            }
        }
    }
    grants
}

impl<T: ShapedTransport> ShapingSource for ShapedSide<T> {
    fn aggregate_backlog(&self) -> usize {
        let broken = lock(&self.broken).clone();
        self.pool
            .snapshot()
            .iter()
            .filter(|entry| !broken.contains(&entry.pair.id()))
            .map(|entry| entry.pair.to_shaped().size())
            .sum()
    }

    fn prepare_data(&self, max_bytes: usize) -> Vec<PreparedBuffer> {
        let flows = self.pool.snapshot();
        let broken = lock(&self.broken).clone();
        let mut buffers = Vec::new();

        let (live, failed): (Vec<&FlowEntry>, Vec<&FlowEntry>) =
            flows.iter().partition(|entry| !broken.contains(&entry.pair.id()));
        for entry in &failed {
            let stale = entry.pair.to_shaped().size();
            if stale > 0 {
                let _ = entry.pair.to_shaped().pop_vec(stale);
                trace!(queue_id = entry.pair.id(), len = stale, "discarded data of failed flow");
            }
        }

        // Never pop more than a stream's writer can take
        let backlogs: Vec<usize> = live
            .iter()
            .map(|entry| {
                let queued = entry.pair.to_shaped().size();
                queued.min(self.transport.write_capacity(entry.endpoint))
            })
            .collect();
        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        let grants = plan_grants(self.options.fairness, start, &backlogs, max_bytes);
        for (entry, &grant) in live.iter().zip(&grants) {
            if grant == 0 {
                continue;
            }
            match entry.pair.to_shaped().pop_vec(grant) {
                Ok(bytes) => {
                    FlowStats::add(&self.stats.bytes_out, bytes.len());
                    buffers.push(PreparedBuffer::data(entry.endpoint, bytes));
                }
                Err(e) => error!(queue_id = entry.pair.id(), error = %e, "pop below reported size"),
            }
        }

        for (entry, &grant) in live.iter().zip(&grants) {
            if grant == 0 {
                buffers.extend(self.finish_outbound(entry, false));
            }
        }
        for entry in &failed {
            self.finish_outbound(entry, true);
        }
        for entry in &flows {
            self.try_release(entry);
        }
        buffers
    }

    fn prepare_dummy(&self, len: usize) -> Option<PreparedBuffer> {
        let stream = self.reserved().dummy?;
        if self.transport.write_capacity(stream) < len {
            trace!(stream_id = stream, len, "dummy stream saturated");
            return None;
        }
        Some(PreparedBuffer::dummy(stream, len))
    }

    fn dispatch(&self, buffer: PreparedBuffer) -> bool {
        let (stream, kind) = (buffer.stream, buffer.kind);
        match self.transport.send_on_stream(stream, buffer.bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(stream_id = stream, ?kind, error = %e, "stream write failed");
                if kind == BufferKind::Data {
                    if let Some(pair) = self.pool.find_by_endpoint(stream) {
                        self.mark_broken(pair.id());
                        self.close_inbound(&pair, true);
                    }
                }
                false
            }
        }
    }
}

impl<T: ShapedTransport> StreamEvents for ShapedSide<T> {
    fn on_stream_data(&self, stream: StreamId, bytes: &[u8]) -> Result<(), FlowError> {
        self.received_shaped_data(stream, bytes)
    }

    fn on_stream_closed(&self, stream: StreamId, end: StreamEnd) {
        self.handle_stream_closed(stream, end);
    }
}

impl<T: ShapedTransport> Driver for ShapedSide<T> {
    fn role(&self) -> Role {
        Role::Shaped
    }

    fn poll_signals(&self) -> usize {
        let signals = self.arena.signals();
        let mut handled = 0;
        while let Some(record) = signals.recv(Direction::ToShaped) {
            handled += 1;
            match record.status {
                ConnStatus::Syn => self.open_flow(record.queue_id),
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

    /// Expire half-made associations and retry held signals
    fn service(&self) {
        let window = self.options.association_window;
        let now = Instant::now();
        let (stale_streams, stale_records) = {
            let mut association = lock(&self.association);
            let mut stale_streams = Vec::new();
            association.anonymous.retain(|&stream, &mut seen| {
                let keep = now.duration_since(seen) < window;
                if !keep {
                    stale_streams.push(stream);
                }
                keep
            });
            let before = association.early.len() + association.ended.len();
            association
                .early
                .retain(|_, (_, seen)| now.duration_since(*seen) < window);
            association
                .ended
                .retain(|_, (_, seen)| now.duration_since(*seen) < window);
            (stale_streams, before - association.early.len() - association.ended.len())
        };

        for stream in stale_streams {
            FlowStats::bump(&self.stats.protocol_violations);
            warn!(stream_id = stream, "stream never identified, dropping it");
            if let Some(pair) = self.pool.find_by_endpoint(stream) {
                self.abandon(&pair, stream);
            }
            let _ = self.transport.close_stream(stream);
        }
        if stale_records > 0 {
            FlowStats::add(&self.stats.protocol_violations, stale_records);
            warn!(count = stale_records, "SYN records or stream ends expired unmatched");
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
    use crate::shm::ShmLayout;
    use std::sync::atomic::{AtomicBool, AtomicU64};

    /// Transport that records every call
    #[derive(Default)]
    struct FakeStreams {
        next: AtomicU64,
        fail_open: AtomicBool,
        sent: Mutex<Vec<(StreamId, Vec<u8>)>>,
        closed: Mutex<Vec<StreamId>>,
        room: Mutex<HashMap<StreamId, usize>>,
    }

    impl FakeStreams {
        fn sent_on(&self, stream: StreamId) -> Vec<u8> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == stream)
                .flat_map(|(_, b)| b.clone())
                .collect()
        }

        fn control_records(&self, control: StreamId) -> Vec<ControlMessage> {
            ControlDecoder::new()
                .push(&self.sent_on(control))
                .into_iter()
                .map(Result::unwrap)
                .collect()
        }
    }

    impl ShapedTransport for FakeStreams {
        fn open_stream(&self) -> Result<StreamId, TransportError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            Ok(self.next.fetch_add(1, Ordering::SeqCst) * 4)
        }

        fn send_on_stream(&self, stream: StreamId, bytes: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((stream, bytes));
            Ok(())
        }

        fn close_stream(&self, stream: StreamId) -> Result<(), TransportError> {
            self.closed.lock().unwrap().push(stream);
            Ok(())
        }

        fn write_capacity(&self, stream: StreamId) -> usize {
            self.room.lock().unwrap().get(&stream).copied().unwrap_or(usize::MAX)
        }
    }

    fn side(role: PeerRole, max_flows: usize) -> (Arc<ShmArena>, ShapedSide<FakeStreams>) {
        let arena = Arc::new(ShmArena::in_memory(ShmLayout::new(max_flows, 1024).unwrap()).unwrap());
        let options = ShapedOptions {
            peer_role: role,
            association_window: Duration::from_millis(20),
            ..Default::default()
        };
        let side = ShapedSide::new(Arc::new(FakeStreams::default()), arena.clone(), options);
        (arena, side)
    }

    fn address() -> AddressPair {
        AddressPair::from_endpoints("192.0.2.1:50000", "198.51.100.7:443").unwrap()
    }

    /// Play the unshaped process allocating a flow
    fn announce_flow(arena: &ShmArena, peer_pool: &FlowPool, socket: u64) -> QueuePair {
        let pair = peer_pool.assign(socket, &address()).unwrap();
        arena
            .signals()
            .send(Direction::ToShaped, SignalRecord::new(pair.id(), ConnStatus::Syn))
            .unwrap();
        pair
    }

    #[test]
    fn test_start_announces_reserved_streams() {
        let (_arena, side) = side(PeerRole::Initiator, 2);
        side.start().unwrap();
        assert_eq!(side.control_stream(), Some(0));
        assert_eq!(side.dummy_stream(), Some(4));
        let records = side.transport().control_records(0);
        assert_eq!(records, vec![ControlMessage::control(0), ControlMessage::dummy(4)]);
    }

    #[test]
    fn test_syn_signal_opens_stream_and_sends_syn_record() {
        let (arena, side) = side(PeerRole::Initiator, 2);
        side.start().unwrap();
        let unshaped = FlowPool::new(&arena, Role::Unshaped);
        let pair = announce_flow(&arena, &unshaped, 1);

        assert_eq!(side.poll_signals(), 1);
        assert_eq!(side.pool().endpoint_of(pair.id()), Some(8));
        let records = side.transport().control_records(0);
        assert_eq!(records.last(), Some(&ControlMessage::syn(8, address())));
        assert_eq!(side.stats().snapshot().flows_opened, 1);
    }

    #[test]
    fn test_failed_open_closes_flow_towards_unshaped() {
        let (arena, side) = side(PeerRole::Initiator, 1);
        side.start().unwrap();
        side.transport().fail_open.store(true, Ordering::SeqCst);
        let unshaped = FlowPool::new(&arena, Role::Unshaped);
        let pair = announce_flow(&arena, &unshaped, 1);

        side.poll_signals();
        assert!(pair.from_shaped().is_marked_for_deletion());
        let back = arena.signals().drain(Direction::FromShaped);
        assert_eq!(back, vec![SignalRecord::new(pair.id(), ConnStatus::Fin)]);

        // Whatever the socket still sends is discarded
        pair.to_shaped().push(b"late").unwrap();
        assert_eq!(side.aggregate_backlog(), 0);
        assert!(side.prepare_data(100).is_empty());
        assert!(pair.to_shaped().is_empty());
    }

    #[test]
    fn test_outbound_data_then_fin_then_release() {
        let (arena, side) = side(PeerRole::Initiator, 1);
        side.start().unwrap();
        let unshaped = FlowPool::new(&arena, Role::Unshaped);
        let pair = announce_flow(&arena, &unshaped, 1);
        side.poll_signals();

        pair.to_shaped().push(&[7u8; 300]).unwrap();
        assert_eq!(side.aggregate_backlog(), 300);
        let first = side.prepare_data(200);
        assert_eq!(first, vec![PreparedBuffer::data(8, vec![7u8; 200])]);

        // Socket closes while 100 bytes are still queued
        pair.to_shaped().mark_for_deletion();
        let second = side.prepare_data(200);
        assert_eq!(second, vec![PreparedBuffer::data(8, vec![7u8; 100])]);
        assert!(!pair.to_shaped().sent_fin());

        let third = side.prepare_data(200);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].kind, BufferKind::Control);
        assert_eq!(third[0].stream, 0);
        assert_eq!(ControlMessage::from_bytes(&third[0].bytes).unwrap(), ControlMessage::fin(8));
        assert_eq!(*side.transport().closed.lock().unwrap(), vec![8]);
        assert!(pair.to_shaped().sent_fin());

        // Peer closes its direction: FIN record plus end of stream
        side.received_shaped_data(0, &ControlMessage::fin(8).to_bytes()).unwrap();
        assert!(!pair.from_shaped().is_marked_for_deletion());
        side.on_stream_closed(8, StreamEnd::Finished);
        assert!(pair.from_shaped().is_marked_for_deletion());
        let signals = arena.signals().drain(Direction::FromShaped);
        assert_eq!(signals, vec![SignalRecord::new(pair.id(), ConnStatus::Fin)]);

        // Unshaped process drained the ring and closed its socket
        pair.from_shaped().set_sent_fin();
        side.prepare_data(200);
        assert_eq!(side.pool().available(), 1);
        assert_eq!(side.stats().snapshot().flows_closed, 1);
    }

    #[test]
    fn test_responder_binds_stream_after_syn_record() {
        let (arena, side) = side(PeerRole::Responder, 2);
        side.received_shaped_data(0, &ControlMessage::control(0).to_bytes()).unwrap();
        assert_eq!(side.control_stream(), Some(0));

        side.received_shaped_data(8, b"hello").unwrap();
        let pair = side.pool().find_by_endpoint(8).unwrap();
        assert_eq!(pair.from_shaped().size(), 5);
        assert!(arena.signals().drain(Direction::FromShaped).is_empty());

        side.received_shaped_data(0, &ControlMessage::syn(8, address()).to_bytes()).unwrap();
        assert_eq!(pair.address(), address());
        let signals = arena.signals().drain(Direction::FromShaped);
        assert_eq!(signals, vec![SignalRecord::new(pair.id(), ConnStatus::Syn)]);
    }

    #[test]
    fn test_responder_binds_early_syn_record() {
        let (arena, side) = side(PeerRole::Responder, 2);
        let mut records = ControlMessage::control(0).to_bytes();
        records.extend(ControlMessage::syn(12, address()).to_bytes());
        // Split mid-record
        side.received_shaped_data(0, &records[..100]).unwrap();
        side.received_shaped_data(0, &records[100..]).unwrap();

        side.received_shaped_data(12, b"x").unwrap();
        let pair = side.pool().find_by_endpoint(12).unwrap();
        assert_eq!(pair.address(), address());
        assert_eq!(arena.signals().drain(Direction::FromShaped).len(), 1);
    }

    #[test]
    fn test_responder_binds_stream_that_ends_without_data() {
        let (arena, side) = side(PeerRole::Responder, 1);
        let mut records = ControlMessage::control(0).to_bytes();
        records.extend(ControlMessage::syn(8, address()).to_bytes());
        side.received_shaped_data(0, &records).unwrap();
        assert_eq!(side.pool().available(), 1);

        side.on_stream_closed(8, StreamEnd::Finished);
        let pair = side.pool().find_by_endpoint(8).unwrap();
        assert_eq!(pair.address(), address());
        assert!(!pair.from_shaped().is_marked_for_deletion());

        side.received_shaped_data(0, &ControlMessage::fin(8).to_bytes()).unwrap();
        assert!(pair.from_shaped().is_marked_for_deletion());
        let signals = arena.signals().drain(Direction::FromShaped);
        assert_eq!(
            signals,
            vec![
                SignalRecord::new(pair.id(), ConnStatus::Syn),
                SignalRecord::new(pair.id(), ConnStatus::Fin)
            ]
        );
        assert_eq!(side.stats().snapshot().protocol_violations, 0);
    }

    #[test]
    fn test_responder_keeps_stream_end_until_its_syn_record() {
        let (arena, side) = side(PeerRole::Responder, 1);
        side.received_shaped_data(0, &ControlMessage::control(0).to_bytes()).unwrap();
        side.on_stream_closed(12, StreamEnd::Finished);
        assert_eq!(side.pool().available(), 1);

        let mut records = ControlMessage::syn(12, address()).to_bytes();
        records.extend(ControlMessage::fin(12).to_bytes());
        side.received_shaped_data(0, &records).unwrap();
        let pair = side.pool().find_by_endpoint(12).unwrap();
        assert!(pair.from_shaped().is_marked_for_deletion());
        let signals = arena.signals().drain(Direction::FromShaped);
        assert_eq!(
            signals,
            vec![
                SignalRecord::new(pair.id(), ConnStatus::Syn),
                SignalRecord::new(pair.id(), ConnStatus::Fin)
            ]
        );

        // An end nobody ever names expires
        side.on_stream_closed(16, StreamEnd::Finished);
        std::thread::sleep(Duration::from_millis(40));
        side.service();
        assert_eq!(side.stats().snapshot().protocol_violations, 1);
    }

    #[test]
    fn test_control_stream_known_before_padding_arrives() {
        let (_arena, side) = side(PeerRole::Responder, 1);
        // Padding overtakes the control records
        side.received_shaped_data(4, &[0u8; 600]).unwrap();
        assert_eq!(side.control_stream(), None);

        let mut records = ControlMessage::control(0).to_bytes();
        records.extend(ControlMessage::dummy(4).to_bytes());
        side.received_shaped_data(0, &records).unwrap();
        assert_eq!(side.control_stream(), Some(0));
        assert_eq!(side.dummy_stream(), Some(4));
        assert!(side.pool().find_by_endpoint(0).is_none());
        assert!(side.pool().find_by_endpoint(4).is_none());
        assert_eq!(side.pool().available(), 1);

        side.received_shaped_data(4, &[0u8; 100]).unwrap();
        assert_eq!(side.stats().snapshot().dummy_bytes, 100);
    }

    #[test]
    fn test_saturated_streams_hold_back_data_and_padding() {
        let (arena, side) = side(PeerRole::Initiator, 1);
        side.start().unwrap();
        let unshaped = FlowPool::new(&arena, Role::Unshaped);
        let pair = announce_flow(&arena, &unshaped, 1);
        side.poll_signals();

        pair.to_shaped().push(&[3u8; 300]).unwrap();
        side.transport().room.lock().unwrap().insert(8, 50);
        assert_eq!(side.prepare_data(200), vec![PreparedBuffer::data(8, vec![3u8; 50])]);
        assert_eq!(pair.to_shaped().size(), 250);

        side.transport().room.lock().unwrap().insert(8, 0);
        assert!(side.prepare_data(200).is_empty());
        assert_eq!(pair.to_shaped().size(), 250);

        side.transport().room.lock().unwrap().insert(4, 5);
        assert_eq!(side.prepare_dummy(10), None);
        assert_eq!(side.prepare_dummy(5), Some(PreparedBuffer::dummy(4, 5)));
    }

    #[test]
    fn test_responder_rejects_stream_when_pool_exhausted() {
        let (_arena, side) = side(PeerRole::Responder, 1);
        side.received_shaped_data(0, &ControlMessage::control(0).to_bytes()).unwrap();
        side.received_shaped_data(8, b"first").unwrap();

        let err = side.received_shaped_data(12, b"second").unwrap_err();
        assert_eq!(err, FlowError::Rejected(PoolError::Exhausted));
        assert_eq!(*side.transport().closed.lock().unwrap(), vec![12]);
        assert_eq!(side.pool().find_by_endpoint(8).unwrap().from_shaped().size(), 5);
        assert_eq!(side.stats().snapshot().flows_rejected, 1);
    }

    #[test]
    fn test_full_ring_reports_backpressure() {
        let (_arena, side) = side(PeerRole::Responder, 1);
        side.received_shaped_data(0, &ControlMessage::control(0).to_bytes()).unwrap();
        side.received_shaped_data(8, &[1u8; 1000]).unwrap();
        let id = side.pool().find_by_endpoint(8).unwrap().id();
        assert_eq!(side.received_shaped_data(8, &[1u8; 100]), Err(FlowError::Backpressure(id)));
    }

    #[test]
    fn test_unidentified_stream_expires() {
        let (_arena, side) = side(PeerRole::Responder, 1);
        side.received_shaped_data(0, &ControlMessage::control(0).to_bytes()).unwrap();
        side.received_shaped_data(8, b"orphan").unwrap();
        assert_eq!(side.pool().available(), 0);

        std::thread::sleep(Duration::from_millis(40));
        side.service();
        assert_eq!(side.pool().available(), 1);
        assert!(side.pool().find_by_endpoint(8).is_none());
        assert_eq!(side.stats().snapshot().protocol_violations, 1);
    }

    #[test]
    fn test_padding_reaches_dummy_ring() {
        let (arena, side) = side(PeerRole::Responder, 1);
        let mut records = ControlMessage::control(0).to_bytes();
        records.extend(ControlMessage::dummy(4).to_bytes());
        side.received_shaped_data(0, &records).unwrap();
        side.received_shaped_data(4, &[0u8; 3000]).unwrap();

        let (from_shaped, _) = arena.dummy_pair();
        assert_eq!(from_shaped.size(), 1023);
        assert_eq!(side.stats().snapshot().dummy_bytes, 3000);
        assert_eq!(side.prepare_dummy(10), Some(PreparedBuffer::dummy(4, 10)));
    }

    #[test]
    fn test_initiator_refuses_unknown_stream() {
        let (_arena, side) = side(PeerRole::Initiator, 1);
        side.start().unwrap();
        assert_eq!(side.received_shaped_data(40, b"?"), Err(FlowError::UnknownFlow(40)));
        assert_eq!(side.pool().available(), 1);
    }

    #[test]
    fn test_grant_planning() {
        let backlogs = [500, 0, 300];
        assert_eq!(plan_grants(Fairness::InOrder, 7, &backlogs, 600), vec![500, 0, 100]);
        assert_eq!(plan_grants(Fairness::RoundRobin, 2, &backlogs, 600), vec![300, 0, 300]);
        assert_eq!(plan_grants(Fairness::EqualShare, 0, &backlogs, 400), vec![200, 0, 200]);
        assert_eq!(plan_grants(Fairness::EqualShare, 0, &backlogs, 700), vec![400, 0, 300]);
        assert_eq!(plan_grants(Fairness::EqualShare, 0, &[0, 0], 50), vec![0, 0]);
        assert!(plan_grants(Fairness::InOrder, 0, &[], 50).is_empty());
    }
}
